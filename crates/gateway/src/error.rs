//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Event bus error (publish, consume or commit).
    #[error("Bus error: {0}")]
    Bus(#[from] anyhow::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file could not be read.
    #[error("Config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Configuration document is invalid.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Registry rejected an operation.
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// No produce topic is mapped for a routing key.
    #[error("No topic mapped for action: {0}")]
    UnmappedAction(String),

    /// Publish did not complete within the configured bound.
    #[error("Publish to {topic} timed out after {attempts} attempt(s)")]
    PublishTimeout { topic: String, attempts: u32 },

    /// The hub actor is gone (shutdown or crash).
    #[error("Hub unavailable")]
    HubClosed,

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),
}

/// Connection registry errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The identity source kept yielding identities already in use.
    #[error("Failed to generate a unique client id after {0} attempts")]
    IdentityExhausted(usize),
}

/// Failure writing one frame into a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    /// The session's socket is closed or closing.
    #[error("session closed")]
    Closed,
    /// The session did not accept the frame within the write timeout.
    #[error("write timed out")]
    Timeout,
}

impl From<axum::Error> for GatewayError {
    fn from(e: axum::Error) -> Self {
        GatewayError::WebSocket(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GatewayError::HubClosed
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
