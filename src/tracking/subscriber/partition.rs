use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::message_db::{self, stream::id, CategoryReadOptions, Message, MessageDbClient, PositionTracker, WriteMessage};
use crate::tracking::error::HandlerError;
use crate::tracking::event::LocationUpdateEvent;
use crate::tracking::topic::Topic;

use super::{transition, FailureOutcome, HandlerFailure, LocationHandler, PoisonPolicy, SubscriberConfig, SubscriberState};

/// Message type of dead-lettered location updates
pub const DEAD_LETTERED: &str = "LocationUpdateDeadLettered";

/// Read and commit positions of one partition
///
/// The read position always moves past a message once it has been dealt with.
/// The commit position follows it until the first message that failed; from
/// there on it stays put for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitCursor {
    next_read: i64,
    held_at: Option<i64>,
}

impl CommitCursor {
    pub fn new(start: i64) -> Self {
        Self {
            next_read: start,
            held_at: None,
        }
    }

    pub fn next_read(&self) -> i64 {
        self.next_read
    }

    /// Global position of the first failed message, if any
    pub fn held_at(&self) -> Option<i64> {
        self.held_at
    }

    /// Mark `global_position` as processed
    ///
    /// Returns the position to commit, or `None` while the commit is held.
    pub fn advance(&mut self, global_position: i64) -> Option<i64> {
        self.next_read = self.next_read.max(global_position + 1);
        match self.held_at {
            Some(_) => None,
            None => Some(self.next_read),
        }
    }

    /// Mark `global_position` as failed
    ///
    /// Returns true if this is the first failure of the run.
    pub fn hold(&mut self, global_position: i64) -> bool {
        self.next_read = self.next_read.max(global_position + 1);
        if self.held_at.is_some() {
            return false;
        }
        self.held_at = Some(global_position);
        true
    }
}

/// Counters of one partition task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionReport {
    pub partition: u32,
    pub handled: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// Next global position a restart resumes from
    pub committed_position: i64,
    pub commit_held: bool,
    /// Set when the task gave up
    pub error: Option<String>,
}

impl PartitionReport {
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            handled: 0,
            failed: 0,
            dead_lettered: 0,
            committed_position: 1,
            commit_held: false,
            error: None,
        }
    }
}

pub(crate) struct PartitionWorker {
    pub(crate) partition: u32,
    pub(crate) topic: Topic,
    pub(crate) client: MessageDbClient,
    pub(crate) config: SubscriberConfig,
    pub(crate) handler: LocationHandler,
    pub(crate) failures: Option<mpsc::UnboundedSender<HandlerFailure>>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) state: Arc<watch::Sender<SubscriberState>>,
    pub(crate) tracker: PositionTracker,
    pub(crate) cursor: CommitCursor,
    pub(crate) report: PartitionReport,
}

impl PartitionWorker {
    /// Consume the partition until shutdown is signalled or reads keep failing
    pub(crate) async fn run(mut self) -> PartitionReport {
        debug!(partition = self.partition, position = self.cursor.next_read(), "Partition task started");

        let mut poll_failures = 0u32;

        'poll: loop {
            if self.is_draining() {
                break;
            }

            let options = CategoryReadOptions::new(self.topic.as_str())
                .with_position(self.cursor.next_read())
                .with_batch_size(self.config.batch_size)
                .with_consumer_group(self.partition as i64, self.config.partition_count as i64);

            let fetched = tokio::select! {
                _ = self.shutdown.changed() => break,
                result = self.client.get_category_messages(options) => result,
            };

            match fetched {
                Ok(messages) if messages.is_empty() => {
                    poll_failures = 0;
                    if !self.idle().await {
                        break;
                    }
                }
                Ok(messages) => {
                    poll_failures = 0;
                    for message in messages {
                        // Never start a message once draining began
                        if self.is_draining() {
                            break 'poll;
                        }
                        self.process(message).await;
                    }
                }
                Err(err) => {
                    poll_failures += 1;
                    warn!(
                        partition = self.partition,
                        attempt = poll_failures,
                        error = %err,
                        "Failed to read partition"
                    );

                    if poll_failures >= self.config.max_poll_failures.max(1) {
                        error!(partition = self.partition, error = %err, "Partition gave up after repeated read failures");
                        self.report.error = Some(err.to_string());
                        transition(&self.state, SubscriberState::Crashed);
                        break;
                    }

                    if !self.idle().await {
                        break;
                    }
                }
            }
        }

        self.finish().await
    }

    fn is_draining(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    /// Wait one polling interval; false if shutdown was signalled meanwhile
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = self.shutdown.changed() => false,
            _ = tokio::time::sleep(self.config.polling_interval) => true,
        }
    }

    async fn process(&mut self, message: Message) {
        let global_position = message.global_position;

        let (attempts, result) = match LocationUpdateEvent::from_message(&message) {
            Ok(event) => self.invoke(event).await,
            Err(err) => (0, Err(err)),
        };

        match result {
            Ok(()) => {
                self.report.handled += 1;
                debug!(
                    partition = self.partition,
                    stream_name = %message.stream_name,
                    global_position,
                    "Location update handled"
                );
                self.commit(global_position).await;
            }
            Err(err) => self.fail(message, attempts, err).await,
        }
    }

    /// Run the handler up to `max_attempts` times
    ///
    /// A panicking handler counts as a rejection. Retries stop early once draining began.
    async fn invoke(&mut self, event: LocationUpdateEvent) -> (u32, Result<(), HandlerError>) {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let handler = Arc::clone(&self.handler);
            let update = event.clone();
            let result = AssertUnwindSafe(async move { handler(update).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(HandlerError::Rejected(panic_message(panic.as_ref()))));

            match result {
                Ok(()) => return (attempt, Ok(())),
                Err(err) if attempt >= max_attempts || self.is_draining() => return (attempt, Err(err)),
                Err(err) => {
                    warn!(
                        partition = self.partition,
                        delivery_id = %event.delivery_id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "Handler failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
            }
        }
    }

    async fn fail(&mut self, message: Message, attempts: u32, err: HandlerError) {
        let global_position = message.global_position;
        let delivery_id = id(&message.stream_name).map(str::to_string);
        let exhausted = attempts == 0 || attempts >= self.config.max_attempts.max(1);

        self.report.failed += 1;

        let outcome = match self.config.poison_policy {
            PoisonPolicy::DeadLetter if exhausted => {
                match self.dead_letter(&message, delivery_id.as_deref(), attempts, &err).await {
                    Ok(()) => FailureOutcome::DeadLettered,
                    Err(dl_err) => {
                        error!(
                            partition = self.partition,
                            global_position,
                            error = %dl_err,
                            "Failed to dead-letter location update"
                        );
                        FailureOutcome::CommitHeld
                    }
                }
            }
            _ => FailureOutcome::CommitHeld,
        };

        match outcome {
            FailureOutcome::DeadLettered => {
                self.report.dead_lettered += 1;
                warn!(
                    partition = self.partition,
                    delivery_id = delivery_id.as_deref().unwrap_or_default(),
                    global_position,
                    attempts,
                    error = %err,
                    "Location update dead-lettered"
                );
                self.commit(global_position).await;
            }
            FailureOutcome::CommitHeld => {
                if self.cursor.hold(global_position) {
                    self.report.commit_held = true;
                    warn!(
                        partition = self.partition,
                        delivery_id = delivery_id.as_deref().unwrap_or_default(),
                        global_position,
                        attempts,
                        error = %err,
                        "Location update failed, holding partition offset"
                    );
                } else {
                    warn!(
                        partition = self.partition,
                        delivery_id = delivery_id.as_deref().unwrap_or_default(),
                        global_position,
                        attempts,
                        error = %err,
                        "Location update failed"
                    );
                }
            }
        }

        if let Some(failures) = &self.failures {
            let _ = failures.send(HandlerFailure {
                partition: self.partition,
                delivery_id,
                stream_name: message.stream_name,
                global_position,
                attempts,
                error: err,
                outcome,
            });
        }
    }

    async fn dead_letter(
        &self,
        message: &Message,
        delivery_id: Option<&str>,
        attempts: u32,
        err: &HandlerError,
    ) -> message_db::Result<()> {
        let stream = self
            .topic
            .dead_letter_stream_for(delivery_id.unwrap_or("unknown"));

        let msg = WriteMessage::new(
            stream,
            DEAD_LETTERED,
            json!({
                "originalMessageId": message.id,
                "originalStreamName": message.stream_name,
                "globalPosition": message.global_position,
                "attempts": attempts,
                "error": err.to_string(),
                "payload": message.data,
            }),
        );

        self.client.write_message(msg).await?;
        Ok(())
    }

    async fn commit(&mut self, global_position: i64) {
        let Some(next) = self.cursor.advance(global_position) else {
            return;
        };

        // A failed write is retried by the next commit or the final flush
        if let Err(err) = self.tracker.update_position(next).await {
            warn!(partition = self.partition, position = next, error = %err, "Failed to commit partition offset");
        }
    }

    async fn finish(mut self) -> PartitionReport {
        match self.tracker.flush().await {
            Ok(true) => debug!(partition = self.partition, position = self.tracker.current_position(), "Flushed partition offset"),
            Ok(false) => {}
            Err(err) => warn!(partition = self.partition, error = %err, "Failed to flush partition offset"),
        }

        self.report.committed_position = self.tracker.current_position();

        info!(
            partition = self.partition,
            handled = self.report.handled,
            failed = self.report.failed,
            committed_position = self.report.committed_position,
            commit_held = self.report.commit_held,
            "Partition task stopped"
        );

        self.report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {}", message)
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_commits_while_healthy() {
        let mut cursor = CommitCursor::new(1);
        assert_eq!(cursor.advance(1), Some(2));
        assert_eq!(cursor.advance(5), Some(6));
        assert_eq!(cursor.next_read(), 6);
        assert_eq!(cursor.held_at(), None);
    }

    #[test]
    fn test_cursor_holds_at_first_failure() {
        let mut cursor = CommitCursor::new(1);
        assert_eq!(cursor.advance(1), Some(2));

        assert!(cursor.hold(2));
        assert_eq!(cursor.next_read(), 3);

        // Later successes move the read position only
        assert_eq!(cursor.advance(3), None);
        assert_eq!(cursor.advance(4), None);
        assert_eq!(cursor.next_read(), 5);

        // A second failure keeps the first hold
        assert!(!cursor.hold(5));
        assert_eq!(cursor.held_at(), Some(2));
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut cursor = CommitCursor::new(10);
        assert_eq!(cursor.advance(3), Some(10));
        assert_eq!(cursor.next_read(), 10);
    }

    #[test]
    fn test_panic_message() {
        let panic = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "handler panicked: boom");

        let panic = std::panic::catch_unwind(|| panic!("{} failed", "geocoder")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "handler panicked: geocoder failed");
    }

    #[test]
    fn test_report_starts_at_first_position() {
        let report = PartitionReport::new(2);
        assert_eq!(report.partition, 2);
        assert_eq!(report.committed_position, 1);
        assert!(!report.commit_held);
    }
}
