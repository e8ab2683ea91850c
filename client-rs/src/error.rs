//! Error types for the ksbus client

use thiserror::Error;

/// Errors that can occur when using the ksbus client
#[derive(Error, Debug)]
pub enum BusError {
    /// The transport could not be established, or it dropped
    #[error("Connection error: {0}")]
    Connection(String),

    /// An inbound frame could not be decoded into a bus message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Reading from or writing to an open transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// No live connection to send on
    #[error("Not connected")]
    NotConnected,

    /// No reply arrived before the deadline
    #[error("Operation timed out")]
    Timeout,

    /// Topic name rejected before sending
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Failed to serialize/deserialize message
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The client has been closed
    #[error("Client shut down")]
    Shutdown,
}

/// Result type for ksbus operations
pub type Result<T> = std::result::Result<T, BusError>;
