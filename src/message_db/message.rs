use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::message_db::error::{Error, Result};

/// A message about to be appended to a stream
#[derive(Debug, Clone)]
pub struct WriteMessage {
    pub id: Uuid,
    pub stream_name: String,
    pub message_type: String,
    pub data: Value,
}

impl WriteMessage {
    /// Message with a fresh id and the given payload
    pub fn new(stream_name: impl Into<String>, message_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream_name: stream_name.into(),
            message_type: message_type.into(),
            data,
        }
    }
}

/// A stored message
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub stream_name: String,
    pub message_type: String,
    pub data: Value,

    /// Position within its stream, from 0
    pub position: i64,

    /// Position within the whole store, from 1
    pub global_position: i64,

    pub time: DateTime<Utc>,
}

impl TryFrom<&Row> for Message {
    type Error = Error;

    /// Rows of `get_category_messages` and `get_last_stream_message`
    ///
    /// The functions return `id` and `data` as text and `time` without a zone (UTC).
    fn try_from(row: &Row) -> Result<Self> {
        let id: String = row.try_get("id")?;
        let data: String = row.try_get("data")?;
        let time: NaiveDateTime = row.try_get("time")?;

        Ok(Self {
            id: Uuid::parse_str(&id)
                .map_err(|e| Error::DatabaseError(format!("message id '{}': {}", id, e)))?,
            stream_name: row.try_get("stream_name")?,
            message_type: row.try_get("type")?,
            data: serde_json::from_str(&data)
                .map_err(|e| Error::DatabaseError(format!("message data: {}", e)))?,
            position: row.try_get("position")?,
            global_position: row.try_get("global_position")?,
            time: DateTime::<Utc>::from_naive_utc_and_offset(time, Utc),
        })
    }
}
