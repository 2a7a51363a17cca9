use thiserror::Error;

/// Result type for Message DB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Message DB client operations
#[derive(Debug, Error)]
pub enum Error {
    /// Validation error - invalid input data
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Connection error - database unreachable or authentication failure
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Database error - SQL errors, constraint violations
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Pool error - connection pool issues, including a closed pool
    #[error("Pool error: {0}")]
    PoolError(String),
}

impl Error {
    /// Whether the error came from the pool having been closed
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::PoolError(msg) if msg.contains("closed"))
    }
}

/// Convert tokio-postgres errors to Message DB errors
impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_error) = err.as_db_error() {
            return Error::DatabaseError(format!(
                "{}: {}",
                db_error.code().code(),
                db_error.message()
            ));
        }

        // Socket-level failures surface without a database error payload
        if err.is_closed() {
            return Error::ConnectionError(err.to_string());
        }

        Error::DatabaseError(format!("{:?}", err))
    }
}

/// Convert deadpool errors to Message DB errors
impl From<deadpool_postgres::PoolError> for Error {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        match err {
            deadpool_postgres::PoolError::Backend(e) => Error::ConnectionError(e.to_string()),
            deadpool_postgres::PoolError::Closed => Error::PoolError("pool is closed".to_string()),
            other => Error::PoolError(other.to_string()),
        }
    }
}

/// Convert deadpool build errors to Message DB errors
impl From<deadpool_postgres::BuildError> for Error {
    fn from(err: deadpool_postgres::BuildError) -> Self {
        Error::ConnectionError(err.to_string())
    }
}

/// Convert JSON errors to Message DB errors
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ValidationError(format!("JSON error: {}", err))
    }
}
