//! Route simulation
//!
//! Drives a publisher through a delivery route, one location update per
//! waypoint, to exercise the pipeline end to end.

use std::time::Duration;

use async_stream::stream;
use futures::{pin_mut, Stream, StreamExt};
use tracing::{error, info};
use uuid::Uuid;

use crate::tracking::error::PublishError;
use crate::tracking::event::Coordinates;
use crate::tracking::publisher::{PublishAck, PublishLocation};

pub const DEFAULT_INTER_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_ROUTE_PAUSE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub coordinates: Coordinates,
    pub description: String,
}

impl Waypoint {
    pub fn new(latitude: f64, longitude: f64, description: impl Into<String>) -> Self {
        Self {
            coordinates: Coordinates::new(latitude, longitude),
            description: description.into(),
        }
    }
}

/// Restaurant to customer, four stops
pub fn default_route() -> Vec<Waypoint> {
    vec![
        Waypoint::new(40.7128, -74.006, "Restaurant - Starting Point"),
        Waypoint::new(40.7135, -74.007, "On the way"),
        Waypoint::new(40.714, -74.008, "Near customer"),
        Waypoint::new(40.7145, -74.0085, "Delivery destination"),
    ]
}

/// `DEL-` followed by eight hex digits
pub fn generate_delivery_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("DEL-{}", &id[..8])
}

/// Result of publishing one waypoint
#[derive(Debug)]
pub struct WaypointOutcome {
    pub delivery_id: String,
    pub index: usize,
    pub waypoint: Waypoint,
    pub result: Result<PublishAck, PublishError>,
}

/// Summary of one simulated route
#[derive(Debug, Clone, Default)]
pub struct RouteReport {
    pub delivery_id: String,
    pub acks: Vec<PublishAck>,
    pub failed: usize,
}

impl RouteReport {
    pub fn published(&self) -> usize {
        self.acks.len()
    }
}

pub struct RouteSimulator<P> {
    publisher: P,
    route: Vec<Waypoint>,
    inter_delay: Duration,
    route_pause: Duration,
}

impl<P: PublishLocation> RouteSimulator<P> {
    pub fn new(publisher: P) -> Self {
        Self {
            publisher,
            route: default_route(),
            inter_delay: DEFAULT_INTER_DELAY,
            route_pause: DEFAULT_ROUTE_PAUSE,
        }
    }

    /// Set the route used by [`run_fleet`](Self::run_fleet) (builder pattern)
    pub fn with_route(mut self, route: Vec<Waypoint>) -> Self {
        self.route = route;
        self
    }

    /// Set the pause between waypoints (builder pattern)
    pub fn with_inter_delay(mut self, inter_delay: Duration) -> Self {
        self.inter_delay = inter_delay;
        self
    }

    /// Set the pause between routes of a fleet run (builder pattern)
    pub fn with_route_pause(mut self, route_pause: Duration) -> Self {
        self.route_pause = route_pause;
        self
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Publish one location update per waypoint, pausing `inter_delay` between sends
    ///
    /// Nothing is published until the stream is polled. A failed waypoint is
    /// logged and yielded; the remaining waypoints are still sent.
    pub fn simulate_route(
        &self,
        delivery_id: impl Into<String>,
        waypoints: Vec<Waypoint>,
        inter_delay: Duration,
    ) -> impl Stream<Item = WaypointOutcome> + '_ {
        let delivery_id = delivery_id.into();

        stream! {
            info!(delivery_id = %delivery_id, waypoints = waypoints.len(), "Starting delivery simulation");

            for (index, waypoint) in waypoints.into_iter().enumerate() {
                if index > 0 {
                    tokio::time::sleep(inter_delay).await;
                }

                let result = self.publisher.publish(&delivery_id, waypoint.coordinates).await;
                match &result {
                    Ok(ack) => info!(
                        delivery_id = %delivery_id,
                        position = ack.position,
                        description = %waypoint.description,
                        "Location updated"
                    ),
                    Err(err) => error!(
                        delivery_id = %delivery_id,
                        description = %waypoint.description,
                        error = %err,
                        "Error updating location"
                    ),
                }

                yield WaypointOutcome {
                    delivery_id: delivery_id.clone(),
                    index,
                    waypoint,
                    result,
                };
            }

            info!(delivery_id = %delivery_id, "Delivery simulation completed");
        }
    }

    /// Drive a whole route to completion
    pub async fn run_route(&self, delivery_id: impl Into<String>, waypoints: Vec<Waypoint>) -> RouteReport {
        let delivery_id = delivery_id.into();
        let outcomes = self.simulate_route(delivery_id.clone(), waypoints, self.inter_delay);
        pin_mut!(outcomes);

        let mut report = RouteReport {
            delivery_id,
            ..Default::default()
        };

        while let Some(outcome) = outcomes.next().await {
            match outcome.result {
                Ok(ack) => report.acks.push(ack),
                Err(_) => report.failed += 1,
            }
        }

        report
    }

    /// Run `count` routes one after another, each under a fresh delivery id
    pub async fn run_fleet(&self, count: usize) -> Vec<RouteReport> {
        info!(count, "Starting simulation for deliveries");

        let mut reports = Vec::with_capacity(count);
        for run in 0..count {
            if run > 0 {
                tokio::time::sleep(self.route_pause).await;
            }
            reports.push(self.run_route(generate_delivery_id(), self.route.clone()).await);
        }

        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::error::PublishFailure;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Records every call; fails the calls whose 0-based index is listed
    #[derive(Default)]
    struct RecordingPublisher {
        calls: Mutex<Vec<(String, Coordinates, Instant)>>,
        fail_on: Vec<usize>,
    }

    impl RecordingPublisher {
        fn failing_on(fail_on: Vec<usize>) -> Self {
            Self {
                fail_on,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<(String, Coordinates, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PublishLocation for RecordingPublisher {
        async fn publish(&self, delivery_id: &str, coordinates: Coordinates) -> Result<PublishAck, PublishError> {
            let mut calls = self.calls.lock().unwrap();
            let index = calls.len();
            calls.push((delivery_id.to_string(), coordinates, Instant::now()));

            if self.fail_on.contains(&index) {
                return Err(PublishError {
                    delivery_id: delivery_id.to_string(),
                    cause: PublishFailure::NotConnected,
                });
            }

            Ok(PublishAck {
                delivery_id: delivery_id.to_string(),
                stream_name: format!("delivery_location_updates-{}", delivery_id),
                position: index as i64,
                message_id: Uuid::new_v4(),
                timestamp: Utc::now(),
            })
        }
    }

    fn assert_about(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual < expected + Duration::from_millis(50),
            "expected about {:?}, got {:?}",
            expected,
            actual
        );
    }

    #[test]
    fn test_default_route() {
        let route = default_route();
        assert_eq!(route.len(), 4);
        assert_eq!(route[0].description, "Restaurant - Starting Point");
        assert_eq!(route[3].coordinates, Coordinates::new(40.7145, -74.0085));
        assert!(route.iter().all(|w| w.coordinates.is_valid()));
    }

    #[test]
    fn test_generated_delivery_ids() {
        let id = generate_delivery_id();
        assert!(id.starts_with("DEL-"));
        assert_eq!(id.len(), 12);
        assert_ne!(id, generate_delivery_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_is_lazy() {
        let simulator = RouteSimulator::new(RecordingPublisher::default());
        let outcomes = simulator.simulate_route("DEL-1", default_route(), Duration::from_secs(3));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(simulator.publisher().calls().is_empty());

        let outcomes: Vec<_> = outcomes.collect().await;
        assert_eq!(outcomes.len(), 4);
        assert_eq!(simulator.publisher().calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_publishes_in_order_with_delays() {
        let simulator = RouteSimulator::new(RecordingPublisher::default());
        let started = Instant::now();

        let outcomes: Vec<_> = simulator
            .simulate_route("DEL-1", default_route(), Duration::from_secs(3))
            .collect()
            .await;

        let calls = simulator.publisher().calls();
        let route = default_route();

        for (i, (delivery_id, coordinates, at)) in calls.iter().enumerate() {
            assert_eq!(delivery_id, "DEL-1");
            assert_eq!(*coordinates, route[i].coordinates);
            assert_about(*at - started, Duration::from_secs(3 * i as u64));
        }

        // No pause after the last waypoint
        assert_about(started.elapsed(), Duration::from_secs(9));
        assert!(outcomes.iter().map(|o| o.index).eq(0..4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_waypoint_does_not_abort_route() {
        let simulator = RouteSimulator::new(RecordingPublisher::failing_on(vec![1]));

        let outcomes: Vec<_> = simulator
            .simulate_route("DEL-2", default_route(), Duration::from_secs(3))
            .collect()
            .await;

        assert_eq!(outcomes.len(), 4);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
        assert!(outcomes[2].result.is_ok());
        assert!(outcomes[3].result.is_ok());
        assert_eq!(outcomes[1].waypoint.description, "On the way");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_route_counts_failures() {
        let simulator = RouteSimulator::new(RecordingPublisher::failing_on(vec![0, 3]));
        let report = simulator.run_route("DEL-3", default_route()).await;

        assert_eq!(report.delivery_id, "DEL-3");
        assert_eq!(report.published(), 2);
        assert_eq!(report.failed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_runs_routes_sequentially() {
        let simulator = RouteSimulator::new(RecordingPublisher::default());
        let started = Instant::now();

        let reports = simulator.run_fleet(3).await;

        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.published() == 4 && r.failed == 0));

        let ids: HashSet<&str> = reports.iter().map(|r| r.delivery_id.as_str()).collect();
        assert_eq!(ids.len(), 3);

        // Calls of one route are contiguous
        let calls = simulator.publisher().calls();
        for (route, chunk) in calls.chunks(4).enumerate() {
            assert!(chunk.iter().all(|(id, _, _)| *id == reports[route].delivery_id));
        }

        // 3 routes of 9s plus 2 pauses of 2s
        assert_about(started.elapsed(), Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_fleet() {
        let simulator = RouteSimulator::new(RecordingPublisher::default());
        assert!(simulator.run_fleet(0).await.is_empty());
        assert!(simulator.publisher().calls().is_empty());
    }
}
