// Service configuration
pub mod config;

// Message DB client library
pub mod message_db;

// Logging setup
pub mod telemetry;

// Location tracking pipeline
pub mod tracking;
