//! Error types for wiregate.

use thiserror::Error;

/// Main error type for all wiregate operations.
#[derive(Debug, Error)]
pub enum GateError {
    /// I/O error on a socket or listener.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid startup configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Declared frame length is below the configured minimum.
    #[error("message too short: {len} < {min}")]
    MessageTooShort { len: u32, min: u32 },

    /// Declared frame length is above the configured maximum.
    #[error("message too long: {len} > {max}")]
    MessageTooLong { len: u64, max: u32 },

    /// Frame payload is not a single-key JSON object.
    #[error("invalid json data: {0}")]
    InvalidData(String),

    /// Message kind was never registered.
    #[error("message {0} not registered")]
    NotRegistered(String),

    /// Message kind registered twice.
    #[error("message {0} is already registered")]
    AlreadyRegistered(String),

    /// Message type cannot be registered (e.g. empty kind).
    #[error("invalid message registration: {0}")]
    InvalidRegistration(String),

    /// A handler, router or raw handler was attached twice.
    #[error("{slot} already set for message {kind}")]
    AlreadySet { kind: String, slot: &'static str },

    /// Connection closed or destroyed.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using GateError.
pub type Result<T> = std::result::Result<T, GateError>;
