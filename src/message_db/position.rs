use serde_json::json;

use crate::message_db::{error::Result, message::WriteMessage, stream::stream_name, MessageDbClient};

/// Message type of position records
pub const POSITION_UPDATED: &str = "PositionUpdated";

/// Position tracking for consumers
///
/// Manages reading and writing consumer position to a position stream.
/// Position streams follow the naming convention: `{category}:position-{consumer_id}`.
///
/// The stored value is the next global position to read, so a consumer that
/// restarts resumes right after the last committed message.
pub struct PositionTracker {
    client: MessageDbClient,
    position_stream_name: String,
    update_interval: usize,
    messages_since_update: usize,
    current_position: i64,
}

impl PositionTracker {
    /// Create a new position tracker
    ///
    /// # Arguments
    ///
    /// * `client` - Message DB client
    /// * `category` - Category being consumed
    /// * `consumer_id` - Unique identifier for this consumer
    /// * `update_interval` - Write position after this many updates
    pub fn new(
        client: MessageDbClient,
        category: &str,
        consumer_id: &str,
        update_interval: usize,
    ) -> Self {
        Self {
            client,
            position_stream_name: position_stream_name(category, consumer_id),
            update_interval: update_interval.max(1),
            messages_since_update: 0,
            current_position: 1, // Category positions start at 1
        }
    }

    /// Get the position stream name
    pub fn position_stream_name(&self) -> &str {
        &self.position_stream_name
    }

    /// Read the last stored position from the position stream
    ///
    /// Returns 1 (the default starting position for categories) if no position has been stored.
    pub async fn read_position(&mut self) -> Result<i64> {
        let position = match self
            .client
            .get_last_stream_message(&self.position_stream_name, Some(POSITION_UPDATED))
            .await?
        {
            Some(msg) => msg
                .data
                .get("position")
                .and_then(|v| v.as_i64())
                .unwrap_or(1),
            None => 1,
        };

        self.current_position = position;
        self.messages_since_update = 0;
        Ok(position)
    }

    /// Update the current position and potentially write to position stream
    ///
    /// The position is only written to the stream after `update_interval` updates,
    /// to balance resumability with write overhead.
    pub async fn update_position(&mut self, next_position: i64) -> Result<()> {
        self.current_position = next_position;
        self.messages_since_update += 1;

        if self.messages_since_update >= self.update_interval {
            self.write_position().await?;
            self.messages_since_update = 0;
        }

        Ok(())
    }

    /// Write the current position if updates are pending
    ///
    /// Returns whether a write happened.
    pub async fn flush(&mut self) -> Result<bool> {
        if self.messages_since_update == 0 {
            return Ok(false);
        }

        self.write_position().await?;
        self.messages_since_update = 0;
        Ok(true)
    }

    /// Force write the current position to the position stream
    pub async fn write_position(&self) -> Result<()> {
        let msg = WriteMessage::new(
            self.position_stream_name.as_str(),
            POSITION_UPDATED,
            json!({ "position": self.current_position }),
        );

        self.client.write_message(msg).await?;
        Ok(())
    }

    /// Get the current position value
    pub fn current_position(&self) -> i64 {
        self.current_position
    }

    /// Get the number of updates since last position write
    pub fn messages_since_update(&self) -> usize {
        self.messages_since_update
    }
}

/// Name of the position stream for a consumer of a category
pub fn position_stream_name(category: &str, consumer_id: &str) -> String {
    stream_name(&format!("{}:position", category), consumer_id)
}
