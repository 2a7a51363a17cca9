//! Consumer-group subscriber of the location topic
//!
//! The topic is split into `partition_count` partitions (Message DB consumer-group
//! slots). A subscriber instance is one member of a group and owns the partitions
//! `p` with `p % group_size == group_member`. Every owned partition runs in its own
//! task that feeds the handler one message at a time, so the updates of one
//! delivery reach the handler in the order they were published.
//!
//! ```text
//! Idle -> Subscribed -> Running -> Draining -> Stopped
//!                          |           |
//!                          +-> Crashed <-+
//! ```

mod partition;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::message_db::PositionTracker;
use crate::tracking::error::{HandlerError, ShutdownError, SubscriptionError};
use crate::tracking::event::LocationUpdateEvent;
use crate::tracking::lifecycle::{ConnectionHandle, ConnectionManager, Role};
use crate::tracking::topic::Topic;

pub use partition::{CommitCursor, PartitionReport, DEAD_LETTERED};

use partition::PartitionWorker;

/// Type-erased location handler
pub type LocationHandler = Arc<
    dyn Fn(LocationUpdateEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync,
>;

/// What happens to a message once its handler attempts are used up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoisonPolicy {
    /// Stop committing the partition for the rest of the run; the message and
    /// everything after it is redelivered on restart
    #[default]
    HoldCommit,
    /// Park the message in the delivery's dead-letter stream and keep committing
    DeadLetter,
}

/// Subscriber tuning
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Number of partitions the topic is split into; must match across the group
    pub partition_count: u32,

    /// This instance's index within the consumer group (0-based)
    pub group_member: u32,

    /// Number of instances in the consumer group
    pub group_size: u32,

    /// Maximum messages fetched per read
    pub batch_size: i64,

    /// Wait after an empty read or a failed read
    pub polling_interval: Duration,

    /// Commit the offset after this many processed messages
    pub commit_interval: usize,

    /// Handler invocations per message before it counts as failed
    pub max_attempts: u32,

    /// Wait between handler attempts of one message
    pub retry_delay: Duration,

    pub poison_policy: PoisonPolicy,

    /// Consecutive read failures after which a partition gives up
    pub max_poll_failures: u32,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            partition_count: 4,
            group_member: 0,
            group_size: 1,
            batch_size: 10,
            polling_interval: Duration::from_millis(100),
            commit_interval: 1,
            max_attempts: 1,
            retry_delay: Duration::from_millis(100),
            poison_policy: PoisonPolicy::HoldCommit,
            max_poll_failures: 5,
        }
    }
}

impl SubscriberConfig {
    /// Set the partition count (builder pattern)
    pub fn with_partition_count(mut self, partition_count: u32) -> Self {
        self.partition_count = partition_count;
        self
    }

    /// Set the group membership (builder pattern)
    pub fn with_group_member(mut self, member: u32, size: u32) -> Self {
        self.group_member = member;
        self.group_size = size;
        self
    }

    /// Set the batch size (builder pattern)
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the polling interval (builder pattern)
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set the commit interval (builder pattern)
    pub fn with_commit_interval(mut self, interval: usize) -> Self {
        self.commit_interval = interval;
        self
    }

    /// Set the handler attempts per message and the delay between them (builder pattern)
    pub fn with_max_attempts(mut self, max_attempts: u32, retry_delay: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.retry_delay = retry_delay;
        self
    }

    /// Set the poison policy (builder pattern)
    pub fn with_poison_policy(mut self, policy: PoisonPolicy) -> Self {
        self.poison_policy = policy;
        self
    }

    /// Set the tolerated consecutive read failures (builder pattern)
    pub fn with_max_poll_failures(mut self, max_poll_failures: u32) -> Self {
        self.max_poll_failures = max_poll_failures;
        self
    }

    /// Partitions owned by this group member
    pub fn assigned_partitions(&self) -> Vec<u32> {
        if self.group_size == 0 {
            return Vec::new();
        }

        (0..self.partition_count)
            .filter(|p| p % self.group_size == self.group_member)
            .collect()
    }

    /// Check the group parameters and return the owned partitions
    pub fn validate(&self, group_id: &str) -> Result<Vec<u32>, SubscriptionError> {
        let invalid = |reason: String| SubscriptionError::InvalidGroup {
            group_id: group_id.to_string(),
            reason,
        };

        if group_id.trim().is_empty() {
            return Err(invalid("group id must not be empty".to_string()));
        }
        if group_id.chars().any(char::is_whitespace) {
            return Err(invalid("group id must not contain whitespace".to_string()));
        }
        if self.partition_count == 0 {
            return Err(invalid("partition count must be at least 1".to_string()));
        }
        if self.group_size == 0 {
            return Err(invalid("group size must be at least 1".to_string()));
        }
        if self.group_member >= self.group_size {
            return Err(invalid(format!(
                "member {} is out of range for a group of {}",
                self.group_member, self.group_size
            )));
        }
        if self.batch_size < 1 {
            return Err(invalid("batch size must be at least 1".to_string()));
        }

        let partitions = self.assigned_partitions();
        if partitions.is_empty() {
            return Err(invalid(format!(
                "member {} owns none of the {} partitions",
                self.group_member, self.partition_count
            )));
        }

        Ok(partitions)
    }
}

/// Lifecycle of one subscriber instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Idle,
    Subscribed,
    Running,
    Draining,
    Stopped,
    Crashed,
}

impl SubscriberState {
    pub fn can_transition_to(self, next: SubscriberState) -> bool {
        use SubscriberState::*;

        matches!(
            (self, next),
            (Idle, Subscribed)
                | (Subscribed, Running)
                | (Running, Draining)
                | (Running, Crashed)
                | (Draining, Stopped)
                | (Draining, Crashed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SubscriberState::Stopped | SubscriberState::Crashed)
    }
}

pub(crate) fn transition(state: &watch::Sender<SubscriberState>, next: SubscriberState) -> bool {
    state.send_if_modified(|current| {
        if current.can_transition_to(next) {
            info!(from = ?*current, to = ?next, "Subscriber state changed");
            *current = next;
            true
        } else {
            false
        }
    })
}

/// Why a location update was not processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The partition stopped committing at this message
    CommitHeld,
    /// The message was written to the dead-letter stream and committed past
    DeadLettered,
}

/// Report of a failed message, sent through the failure channel
#[derive(Debug, Clone)]
pub struct HandlerFailure {
    pub partition: u32,
    pub delivery_id: Option<String>,
    pub stream_name: String,
    pub global_position: i64,
    /// Handler invocations made; 0 when the payload could not be decoded
    pub attempts: u32,
    pub error: HandlerError,
    pub outcome: FailureOutcome,
}

/// Subscriber role of the pipeline, before it joins the group
pub struct LocationSubscriber {
    manager: ConnectionManager,
    handle: ConnectionHandle,
    config: SubscriberConfig,
    failures: Option<mpsc::UnboundedSender<HandlerFailure>>,
    state: Arc<watch::Sender<SubscriberState>>,
}

impl LocationSubscriber {
    pub fn new(manager: ConnectionManager, handle: ConnectionHandle, config: SubscriberConfig) -> Self {
        let (state, _) = watch::channel(SubscriberState::Idle);

        Self {
            manager,
            handle,
            config,
            failures: None,
            state: Arc::new(state),
        }
    }

    /// Receive a [`HandlerFailure`] for every message that was not processed
    pub fn with_failure_reporter(mut self, failures: mpsc::UnboundedSender<HandlerFailure>) -> Self {
        self.failures = Some(failures);
        self
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Join `group_id` on `topic` and start feeding updates to `handler`
    ///
    /// Returns once every owned partition has read its committed offset and its
    /// task is running.
    pub async fn subscribe<F, Fut>(
        self,
        topic: &str,
        group_id: &str,
        handler: F,
    ) -> Result<Subscription, SubscriptionError>
    where
        F: Fn(LocationUpdateEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let topic = Topic::new(topic)?;
        let partitions = self.config.validate(group_id)?;

        if !self.handle.is_connected() {
            return Err(SubscriptionError::NotConnected);
        }

        transition(&self.state, SubscriberState::Subscribed);

        let handler: LocationHandler = Arc::new(move |event| handler(event).boxed());
        let client = self.handle.client().clone();

        let mut trackers = Vec::with_capacity(partitions.len());
        for &partition in &partitions {
            let mut tracker = PositionTracker::new(
                client.clone(),
                topic.as_str(),
                &consumer_id(group_id, partition),
                self.config.commit_interval,
            );

            let position = tracker
                .read_position()
                .await
                .map_err(|source| SubscriptionError::Join {
                    topic: topic.to_string(),
                    group_id: group_id.to_string(),
                    source,
                })?;

            info!(
                topic = %topic,
                group_id = %group_id,
                partition,
                position,
                "Resuming partition from committed offset"
            );
            trackers.push((partition, tracker));
        }

        let (shutdown, _) = watch::channel(false);
        let workers = trackers
            .into_iter()
            .map(|(partition, tracker)| {
                let worker = PartitionWorker {
                    partition,
                    topic: topic.clone(),
                    client: client.clone(),
                    config: self.config.clone(),
                    handler: Arc::clone(&handler),
                    failures: self.failures.clone(),
                    shutdown: shutdown.subscribe(),
                    state: Arc::clone(&self.state),
                    cursor: CommitCursor::new(tracker.current_position()),
                    tracker,
                    report: PartitionReport::new(partition),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        transition(&self.state, SubscriberState::Running);
        info!(
            topic = %topic,
            group_id = %group_id,
            member = self.config.group_member,
            group_size = self.config.group_size,
            partitions = ?partitions,
            "Subscribed to location updates"
        );

        Ok(Subscription {
            topic,
            group_id: group_id.to_string(),
            partitions,
            manager: self.manager,
            handle: self.handle,
            state: self.state,
            shutdown,
            workers,
        })
    }
}

/// Position stream id of one partition of a group
fn consumer_id(group_id: &str, partition: u32) -> String {
    format!("{}+{}", group_id, partition)
}

/// Outcome of a drained subscription
#[derive(Debug, Clone)]
pub struct SubscriptionSummary {
    pub state: SubscriberState,
    pub partitions: Vec<PartitionReport>,
}

impl SubscriptionSummary {
    pub fn handled(&self) -> u64 {
        self.partitions.iter().map(|p| p.handled).sum()
    }

    pub fn failed(&self) -> u64 {
        self.partitions.iter().map(|p| p.failed).sum()
    }
}

/// A running consumer-group membership
pub struct Subscription {
    topic: Topic,
    group_id: String,
    partitions: Vec<u32>,
    manager: ConnectionManager,
    handle: ConnectionHandle,
    state: Arc<watch::Sender<SubscriberState>>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<PartitionReport>>,
}

impl Subscription {
    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Observe state changes, including a crash of a partition task
    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.subscribe()
    }

    pub fn assigned_partitions(&self) -> &[u32] {
        &self.partitions
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Drain every partition and release the subscriber connection
    ///
    /// In-flight handler calls finish and committed offsets are flushed before
    /// the connection is released.
    pub async fn shutdown(self) -> Result<SubscriptionSummary, ShutdownError> {
        transition(&self.state, SubscriberState::Draining);
        info!(topic = %self.topic, group_id = %self.group_id, "Draining subscription");

        let _ = self.shutdown.send(true);

        let mut partitions = Vec::with_capacity(self.workers.len());
        let mut join_failures = Vec::new();

        for worker in self.workers {
            match worker.await {
                Ok(report) => partitions.push(report),
                Err(err) => {
                    error!(error = %err, "Partition task could not be joined");
                    join_failures.push(err.to_string());
                }
            }
        }

        let released = self.manager.disconnect(&self.handle);

        let crashed = !join_failures.is_empty() || partitions.iter().any(|p| p.error.is_some());
        if crashed {
            transition(&self.state, SubscriberState::Crashed);
        } else {
            transition(&self.state, SubscriberState::Stopped);
        }

        released?;

        if !join_failures.is_empty() {
            return Err(ShutdownError {
                role: Role::Subscriber,
                reason: join_failures.join("; "),
            });
        }

        let summary = SubscriptionSummary {
            state: *self.state.borrow(),
            partitions,
        };

        if summary.state == SubscriberState::Crashed {
            warn!(handled = summary.handled(), failed = summary.failed(), "Subscription stopped after a crash");
        } else {
            info!(handled = summary.handled(), failed = summary.failed(), "Subscription stopped");
        }

        Ok(summary)
    }
}
