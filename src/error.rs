use thiserror::Error;

use crate::request::RequestId;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors that can occur in the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Waiting room is at capacity; surfaced to callers as a 503-equivalent.
    #[error("queue full for backend {0}")]
    QueueFull(String),

    /// Request id is not known to the queue or the store.
    #[error("request not found: {0}")]
    RequestNotFound(RequestId),

    /// Backend name does not match any configured backend.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// Priority label outside the closed {high, normal, low} set.
    #[error("unknown priority label: {0}")]
    InvalidPriority(String),

    /// Resolution mode outside the closed {tiny, small, base, large, gundam} set.
    #[error("unknown resolution mode: {0}")]
    InvalidResolution(String),

    /// Backend child process could not be spawned.
    #[error("failed to spawn backend process: {0}")]
    Spawn(String),

    /// Backend never served a healthy response within the startup window.
    #[error("backend {backend} failed health check within {timeout_s}s")]
    HealthCheckTimeout { backend: String, timeout_s: u64 },

    /// A persisted row contradicts the request state machine.
    #[error("invalid state for request {0}: {1}")]
    InvalidState(RequestId, String),

    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(String),

    /// HTTP request failed (health probe).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}
