//! Delivery location tracking pipeline
//!
//! - [`lifecycle`]: connection state of the publisher and subscriber roles
//! - [`publisher`]: writes location updates keyed by delivery id
//! - [`subscriber`]: consumer-group subscription feeding a handler
//! - [`harness`]: route simulation driving a publisher
//!
//! # Example
//!
//! ```no_run
//! use delivery_tracking::message_db::MessageDbConfig;
//! use delivery_tracking::tracking::{
//!     ConnectionManager, Coordinates, LocationPublisher, Role, Topic,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ConnectionManager::new(MessageDbConfig::default());
//!     let handle = manager.connect(Role::Publisher).await?;
//!
//!     let publisher = LocationPublisher::new(handle.clone(), Topic::default());
//!     let ack = publisher.publish("DEL-1", Coordinates::new(40.7128, -74.006)).await?;
//!     println!("stored at position {}", ack.position);
//!
//!     manager.disconnect(&handle)?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod event;
pub mod harness;
pub mod lifecycle;
pub mod publisher;
pub mod signal;
pub mod subscriber;
pub mod topic;

pub use error::{
    ConnectionError, HandlerError, PublishError, PublishFailure, ShutdownError, SubscriptionError,
};
pub use event::{Coordinates, LocationUpdateEvent, LOCATION_UPDATED};
pub use harness::{default_route, RouteReport, RouteSimulator, Waypoint, WaypointOutcome};
pub use lifecycle::{
    connect_with_retry, ConnectionHandle, ConnectionManager, ConnectionState, RetryPolicy, Role,
};
pub use publisher::{LocationPublisher, PublishAck, PublishLocation};
pub use signal::shutdown_signal;
pub use subscriber::{
    FailureOutcome, HandlerFailure, LocationSubscriber, PartitionReport, PoisonPolicy,
    SubscriberConfig, SubscriberState, Subscription, SubscriptionSummary,
};
pub use topic::{Topic, TopicError, DEFAULT_TOPIC};
