use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::tracking::error::{PublishError, PublishFailure};
use crate::tracking::event::{Coordinates, LocationUpdateEvent};
use crate::tracking::lifecycle::ConnectionHandle;
use crate::tracking::topic::Topic;

/// Confirmation that the transport accepted a location update
#[derive(Debug, Clone, PartialEq)]
pub struct PublishAck {
    pub delivery_id: String,
    pub stream_name: String,
    /// Position of the update within the delivery's stream (0-based)
    pub position: i64,
    pub message_id: Uuid,
    /// Timestamp carried by the published event
    pub timestamp: DateTime<Utc>,
}

/// Anything that can publish location updates
///
/// The route simulator is generic over this so it can run against a real
/// publisher or an in-memory one.
#[async_trait]
pub trait PublishLocation: Send + Sync {
    async fn publish(
        &self,
        delivery_id: &str,
        coordinates: Coordinates,
    ) -> Result<PublishAck, PublishError>;
}

/// Writes location updates to the delivery's stream in the topic
///
/// A publish either returns an ack after the transport accepted the message or
/// fails; it never retries.
pub struct LocationPublisher {
    handle: ConnectionHandle,
    topic: Topic,
}

impl LocationPublisher {
    pub fn new(handle: ConnectionHandle, topic: Topic) -> Self {
        Self { handle, topic }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub async fn publish(
        &self,
        delivery_id: &str,
        coordinates: Coordinates,
    ) -> Result<PublishAck, PublishError> {
        self.try_publish(delivery_id, coordinates)
            .await
            .map_err(|cause| {
                warn!(
                    delivery_id = %delivery_id,
                    topic = %self.topic,
                    operation = "publish",
                    error = %cause,
                    "Failed to publish location update"
                );
                PublishError {
                    delivery_id: delivery_id.to_string(),
                    cause,
                }
            })
    }

    async fn try_publish(
        &self,
        delivery_id: &str,
        coordinates: Coordinates,
    ) -> Result<PublishAck, PublishFailure> {
        let event = LocationUpdateEvent::new(delivery_id, coordinates, Utc::now())?;

        if !self.handle.is_connected() {
            return Err(PublishFailure::NotConnected);
        }

        let msg = event.to_write_message(&self.topic)?;
        let message_id = msg.id;
        let stream_name = msg.stream_name.clone();

        let position = self.handle.client().write_message(msg).await?;

        debug!(
            delivery_id = %event.delivery_id,
            stream_name = %stream_name,
            position,
            latitude = event.latitude,
            longitude = event.longitude,
            "Location update published"
        );

        Ok(PublishAck {
            delivery_id: event.delivery_id,
            stream_name,
            position,
            message_id,
            timestamp: event.timestamp,
        })
    }
}

#[async_trait]
impl PublishLocation for LocationPublisher {
    async fn publish(
        &self,
        delivery_id: &str,
        coordinates: Coordinates,
    ) -> Result<PublishAck, PublishError> {
        LocationPublisher::publish(self, delivery_id, coordinates).await
    }
}
