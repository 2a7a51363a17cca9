//! Error types of the tracking pipeline

use thiserror::Error;

use crate::message_db;
use crate::tracking::lifecycle::Role;
use crate::tracking::topic::TopicError;

/// Transport unreachable or handshake rejected
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("{role} connection failed: {source}")]
    Handshake {
        role: Role,
        #[source]
        source: message_db::Error,
    },

    #[error("{role} is already connected")]
    AlreadyConnected { role: Role },
}

impl ConnectionError {
    pub fn role(&self) -> Role {
        match self {
            ConnectionError::Handshake { role, .. } => *role,
            ConnectionError::AlreadyConnected { role } => *role,
        }
    }
}

/// Releasing a role's connection did not complete cleanly
#[derive(Debug, Error)]
#[error("{role} shutdown failed: {reason}")]
pub struct ShutdownError {
    pub role: Role,
    pub reason: String,
}

/// A location update was not accepted by the transport
#[derive(Debug, Error)]
#[error("publish for delivery '{delivery_id}' failed: {cause}")]
pub struct PublishError {
    pub delivery_id: String,
    #[source]
    pub cause: PublishFailure,
}

#[derive(Debug, Error)]
pub enum PublishFailure {
    #[error("delivery id must not be empty")]
    EmptyDeliveryId,

    #[error("coordinates ({latitude}, {longitude}) are not a valid position")]
    InvalidCoordinates { latitude: f64, longitude: f64 },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("publisher connection has been released")]
    NotConnected,

    #[error("transport rejected the message: {0}")]
    Transport(#[from] message_db::Error),
}

/// Joining the consumer group or subscribing to the topic failed
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error("invalid consumer group '{group_id}': {reason}")]
    InvalidGroup { group_id: String, reason: String },

    #[error("subscriber connection has been released")]
    NotConnected,

    #[error("failed to join group '{group_id}' on topic '{topic}': {source}")]
    Join {
        topic: String,
        group_id: String,
        #[source]
        source: message_db::Error,
    },
}

/// Failure inside the consumer callback, contained per message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("handler rejected the update: {0}")]
    Rejected(String),

    #[error("malformed location update: {0}")]
    Malformed(String),
}

impl HandlerError {
    pub fn rejected(reason: impl std::fmt::Display) -> Self {
        HandlerError::Rejected(reason.to_string())
    }
}
