//! Error types for the placement side

use thiserror::Error;

/// Cluster error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("No servers available")]
    NoServersAvailable,

    #[error("Insufficient capacity on server {server_id}: {requested} units requested, {available} available")]
    InsufficientCapacity {
        server_id: String,
        requested: u64,
        available: u64,
    },

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Room forwarding failed: {0}")]
    Forward(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, Error>;
