use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use delivery_tracking::config::TrackerConfig;
use delivery_tracking::telemetry::{self, LogFormat};
use delivery_tracking::tracking::{
    connect_with_retry, shutdown_signal, ConnectionHandle, ConnectionManager, HandlerError,
    HandlerFailure, LocationPublisher, LocationSubscriber, LocationUpdateEvent, RetryPolicy, Role,
    RouteReport, RouteSimulator, SubscriberState, Subscription,
};

/// Real-time delivery location tracking over Message DB
#[derive(Debug, Parser)]
#[command(name = "delivery-tracking", version)]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume location updates and log them until interrupted
    Subscribe,

    /// Publish simulated delivery routes
    Simulate {
        /// Number of deliveries to simulate
        #[arg(long, default_value_t = 3)]
        count: usize,
    },

    /// Subscribe and simulate in one process
    Run {
        /// Number of deliveries to simulate
        #[arg(long, default_value_t = 3)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_format, "info");

    let config = TrackerConfig::from_env().context("Failed to load configuration")?;
    let manager = ConnectionManager::new(config.message_db.clone());

    info!(
        server = %config.message_db.redacted(),
        topic = %config.topic,
        group_id = %config.group_id,
        "Delivery tracking service starting"
    );

    match cli.command {
        Command::Subscribe => {
            let subscription = start_subscription(&manager, &config).await?;
            wait_for_stop(subscription.watch_state()).await;
            stop_subscription(subscription).await
        }
        Command::Simulate { count } => {
            let handle = connect_publisher(&manager).await?;
            let simulator = simulator(handle.clone(), &config);

            tokio::select! {
                reports = simulator.run_fleet(count) => log_reports(&reports),
                signal = shutdown_signal() => info!(signal, "Shutdown requested, stopping simulation"),
            }

            manager.disconnect(&handle).context("Failed to release publisher")?;
            Ok(())
        }
        Command::Run { count } => {
            let subscription = start_subscription(&manager, &config).await?;
            let handle = match connect_publisher(&manager).await {
                Ok(handle) => handle,
                Err(err) => {
                    if let Err(shutdown_err) = subscription.shutdown().await {
                        error!(error = %shutdown_err, "Subscriber shutdown failed");
                    }
                    return Err(err);
                }
            };

            let simulator = simulator(handle.clone(), &config);
            let states = subscription.watch_state();

            let stopped = tokio::select! {
                reports = simulator.run_fleet(count) => {
                    log_reports(&reports);
                    false
                }
                _ = wait_for_stop(states.clone()) => true,
            };

            if !stopped {
                info!("Simulation finished, still tracking; press Ctrl+C to stop");
                wait_for_stop(states).await;
            }

            // Publisher first, so nothing new arrives while the subscriber drains
            if let Err(err) = manager.disconnect(&handle) {
                error!(error = %err, "Failed to release publisher");
            }
            stop_subscription(subscription).await
        }
    }
}

async fn connect_publisher(manager: &ConnectionManager) -> Result<ConnectionHandle> {
    connect_with_retry(manager, Role::Publisher, &RetryPolicy::default())
        .await
        .context("Publisher could not connect to Message DB")
}

fn simulator(handle: ConnectionHandle, config: &TrackerConfig) -> RouteSimulator<LocationPublisher> {
    RouteSimulator::new(LocationPublisher::new(handle, config.topic.clone()))
        .with_inter_delay(config.simulation.inter_delay)
        .with_route_pause(config.simulation.route_pause)
}

async fn start_subscription(manager: &ConnectionManager, config: &TrackerConfig) -> Result<Subscription> {
    let handle = connect_with_retry(manager, Role::Subscriber, &RetryPolicy::default())
        .await
        .context("Subscriber could not connect to Message DB")?;

    let (failures, reports) = mpsc::unbounded_channel();
    tokio::spawn(report_failures(reports));

    let subscription = LocationSubscriber::new(manager.clone(), handle.clone(), config.subscriber.clone())
        .with_failure_reporter(failures)
        .subscribe(config.topic.as_str(), &config.group_id, log_location)
        .await;

    match subscription {
        Ok(subscription) => Ok(subscription),
        Err(err) => {
            if let Err(release_err) = manager.disconnect(&handle) {
                warn!(error = %release_err, "Failed to release subscriber");
            }
            Err(err).context("Failed to subscribe to location updates")
        }
    }
}

async fn log_location(event: LocationUpdateEvent) -> Result<(), HandlerError> {
    info!(
        delivery_id = %event.delivery_id,
        latitude = event.latitude,
        longitude = event.longitude,
        timestamp = %event.timestamp.to_rfc3339(),
        "Received location update"
    );
    Ok(())
}

async fn report_failures(mut failures: mpsc::UnboundedReceiver<HandlerFailure>) {
    while let Some(failure) = failures.recv().await {
        error!(
            partition = failure.partition,
            delivery_id = failure.delivery_id.as_deref().unwrap_or("unknown"),
            global_position = failure.global_position,
            outcome = ?failure.outcome,
            error = %failure.error,
            "Location update was not processed"
        );
    }
}

/// Resolve on SIGINT/SIGTERM or when the subscription crashes
async fn wait_for_stop(mut states: watch::Receiver<SubscriberState>) {
    tokio::select! {
        signal = shutdown_signal() => info!(signal, "Shutdown requested"),
        _ = states.wait_for(|state| *state == SubscriberState::Crashed) => {
            error!("Subscriber crashed, shutting down");
        }
    }
}

async fn stop_subscription(subscription: Subscription) -> Result<()> {
    let summary = subscription
        .shutdown()
        .await
        .context("Subscriber did not shut down cleanly")?;

    for partition in &summary.partitions {
        info!(
            partition = partition.partition,
            handled = partition.handled,
            failed = partition.failed,
            dead_lettered = partition.dead_lettered,
            committed_position = partition.committed_position,
            "Partition summary"
        );
    }

    if summary.state == SubscriberState::Crashed {
        bail!("Subscriber stopped after a partition crashed");
    }

    info!("Delivery tracking service stopped");
    Ok(())
}

fn log_reports(reports: &[RouteReport]) {
    for report in reports {
        info!(
            delivery_id = %report.delivery_id,
            published = report.published(),
            failed = report.failed,
            "Route completed"
        );
    }
}
