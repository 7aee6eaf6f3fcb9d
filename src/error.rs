//! Error handling for the mining service
//!
//! One error type covers request validation, the nonce search, transport
//! faults and configuration. Only some of these ever reach a client; see
//! [`Error::is_wire_visible`].

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Result type alias for mining service operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the mining service
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed frame or missing/invalid request field
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// Requested difficulty is above the accepted ceiling
    #[error("Target too high: requested {requested} leading zero bits, maximum is {max}")]
    TargetTooHigh { requested: u64, max: u32 },

    /// Job was superseded or its connection closed
    #[error("Operation was cancelled: {operation}")]
    Cancelled { operation: String },

    /// Unexpected fault while mining or serializing
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Job exceeded its time budget
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

impl Error {
    /// Create an invalid request error
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a target-too-high error
    pub fn target_too_high(requested: u64, max: u32) -> Self {
        Self::TargetTooHigh { requested, max }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Whether this error should be reported to the client as an `Err` frame.
    ///
    /// Cancellation is an internal signal: a superseded job produces no frame.
    pub fn is_wire_visible(&self) -> bool {
        !matches!(self, Error::Cancelled { .. })
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidRequest { .. } => "invalid_request",
            Error::TargetTooHigh { .. } => "target_too_high",
            Error::Cancelled { .. } => "cancelled",
            Error::Internal { .. } => "internal",
            Error::Timeout { .. } => "timeout",
            Error::Config { .. } => "config",
            Error::Json(_) => "json",
            Error::Io(_) => "io",
            Error::WebSocket(_) => "websocket",
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::config(err.to_string())
    }
}
