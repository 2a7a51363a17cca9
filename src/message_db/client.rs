use deadpool_postgres::Pool;

use crate::message_db::{
    connection::MessageDbConfig,
    error::Result,
    message::{Message, WriteMessage},
};

/// Category read: where to start, how much, and which consumer-group slice
#[derive(Debug, Clone)]
pub struct CategoryReadOptions {
    pub category: String,

    /// First global position to return (global positions start at 1)
    pub position: i64,

    pub batch_size: i64,

    /// `(member, size)`; Message DB hashes each stream's id onto one member
    pub consumer_group: Option<(i64, i64)>,
}

impl CategoryReadOptions {
    pub fn new(category: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            position: 1,
            batch_size: 1000,
            consumer_group: None,
        }
    }

    pub fn with_position(mut self, position: i64) -> Self {
        self.position = position;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_consumer_group(mut self, member: i64, size: i64) -> Self {
        self.consumer_group = Some((member, size));
        self
    }
}

/// Pooled access to the Message DB functions
///
/// Cloning is cheap; clones share one pool, so `close` on any clone closes it for all.
#[derive(Clone)]
pub struct MessageDbClient {
    pool: Pool,
    schema: String,
}

impl MessageDbClient {
    /// Build the pool and check out one connection
    ///
    /// An unreachable or misconfigured server fails here rather than on first use.
    pub async fn new(config: MessageDbConfig) -> Result<Self> {
        let pool = config.build_pool()?;
        drop(pool.get().await?);

        Ok(Self {
            pool,
            schema: config.schema_name,
        })
    }

    /// Append to a stream, returning the message's stream position
    pub async fn write_message(&self, msg: WriteMessage) -> Result<i64> {
        let conn = self.pool.get().await?;
        let sql = format!("SELECT {}.write_message($1, $2, $3, $4)", self.schema);

        let row = conn
            .query_one(
                &sql,
                &[
                    &msg.id.to_string(),
                    &msg.stream_name,
                    &msg.message_type,
                    &msg.data,
                ],
            )
            .await?;

        Ok(row.try_get(0)?)
    }

    /// Messages of every stream in a category, in global order
    ///
    /// With a consumer group only the member's streams are returned; each
    /// stream still comes back in its own order.
    pub async fn get_category_messages(&self, options: CategoryReadOptions) -> Result<Vec<Message>> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "SELECT * FROM {}.get_category_messages($1, $2, $3, NULL, $4, $5)",
            self.schema
        );
        let (member, size) = options.consumer_group.unzip();

        let rows = conn
            .query(
                &sql,
                &[
                    &options.category,
                    &options.position,
                    &options.batch_size,
                    &member,
                    &size,
                ],
            )
            .await?;

        rows.iter().map(Message::try_from).collect()
    }

    /// Latest message of a stream, optionally of one type
    pub async fn get_last_stream_message(
        &self,
        stream_name: &str,
        message_type: Option<&str>,
    ) -> Result<Option<Message>> {
        let conn = self.pool.get().await?;
        let sql = format!(
            "SELECT * FROM {}.get_last_stream_message($1, $2)",
            self.schema
        );

        let rows = conn.query(&sql, &[&stream_name, &message_type]).await?;
        rows.first().map(Message::try_from).transpose()
    }

    /// Close the pool
    ///
    /// Idle connections are dropped now, checked-out ones when returned. Every
    /// later checkout fails with a closed-pool error.
    pub fn close(&self) {
        self.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
