//! Core types for queued requests.
//!
//! This module defines the type-safe request lifecycle using the typestate pattern.
//! Each request progresses through distinct phases, enforced at compile time: a
//! request that has never been dispatched carries no `started_at`, so it cannot
//! be completed, failed, or timed out by construction.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::GatewayError;

/// Unique identifier for a request in the system.
pub type RequestId = Uuid;

/// Marker trait for valid request phases.
///
/// This trait enables the typestate pattern, ensuring that operations
/// are only performed on requests in valid phases.
pub trait RequestState: Send + Sync {}

/// A unit of work admitted by a queue.
///
/// Uses the typestate pattern to ensure type-safe transitions.
/// The generic parameter `T` represents the current phase of the request.
#[derive(Debug, Clone)]
pub struct Request<T: RequestState> {
    /// The current phase of the request.
    pub state: T,
    /// Admission data, constant across phases.
    pub data: RequestData,
}

/// Caller-supplied data plus admission metadata.
///
/// The payload is opaque: the queue orders and dispatches it but never
/// inspects it.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestData {
    /// Identifier assigned at admission.
    pub id: RequestId,

    /// Name of the backend that owns this request.
    pub backend: String,

    /// Short task label (e.g. "chat", "ocr"); opaque to the queue.
    pub task_kind: String,

    /// Opaque caller identifier.
    pub client: String,

    /// Opaque request body.
    pub payload: Value,

    pub priority: Priority,

    pub created_at: DateTime<Utc>,

    /// Processing deadline in seconds, measured from dispatch.
    pub timeout_s: u32,

    /// Retry budget; a request is dispatched at most `max_retries + 1` times.
    pub max_retries: u32,
}

/// Request priority levels.
///
/// Lower rank sorts earlier in the waiting room. There is no starvation
/// guard: a continuous flood of HIGH requests may indefinitely delay LOW.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Sort key: HIGH before NORMAL before LOW.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl FromStr for Priority {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(GatewayError::InvalidPriority(other.to_string())),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        f.write_str(label)
    }
}

/// Persisted request status, the runtime mirror of the typestate phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    #[serde(rename = "timeout")]
    TimedOut,
    Cancelled,
}

impl RequestStatus {
    /// Terminal statuses are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed
                | RequestStatus::Failed
                | RequestStatus::TimedOut
                | RequestStatus::Cancelled
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::TimedOut => "timeout",
            RequestStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

// ============================================================================
// Request Phases
// ============================================================================

/// Request is waiting in the admission queue.
///
/// This is the initial phase for all newly admitted requests, and the phase a
/// request returns to when a failure leaves retry budget.
#[derive(Debug, Clone)]
pub struct Queued {
    /// Number of dispatch attempts already consumed.
    pub retries: u32,
    /// Most recent failure, carried for observability across requeues.
    pub last_error: Option<String>,
}

impl RequestState for Queued {}

/// Request has been handed to a worker slot and is in flight.
#[derive(Debug, Clone)]
pub struct Processing {
    pub started_at: DateTime<Utc>,
    pub retries: u32,
}

impl RequestState for Processing {}

/// Request finished successfully.
#[derive(Debug, Clone)]
pub struct Completed {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub retries: u32,
    pub result: Option<Value>,
}

impl RequestState for Completed {}

/// Request failed after exhausting its retry budget.
#[derive(Debug, Clone)]
pub struct Failed {
    /// Absent when the request never reached a worker (e.g. abandoned during
    /// recovery).
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub retries: u32,
    pub error: String,
}

impl RequestState for Failed {}

/// Request exceeded its processing deadline. Timed-out requests are not
/// retried.
#[derive(Debug, Clone)]
pub struct TimedOut {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub retries: u32,
}

impl RequestState for TimedOut {}

/// Request was cancelled by the caller before completion.
#[derive(Debug, Clone)]
pub struct Cancelled {
    pub completed_at: DateTime<Utc>,
    pub retries: u32,
}

impl RequestState for Cancelled {}

impl Request<Processing> {
    /// True once the request has been in flight longer than its deadline.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        (now - self.state.started_at).num_seconds() > i64::from(self.data.timeout_s)
    }
}

// ============================================================================
// Unified Request Representation
// ============================================================================

/// Enum that can hold a request in any phase.
///
/// Used for storage, recovery, and status APIs where requests are handled
/// uniformly regardless of their current phase.
#[derive(Debug, Clone)]
pub enum AnyRequest {
    Queued(Request<Queued>),
    Processing(Request<Processing>),
    Completed(Request<Completed>),
    Failed(Request<Failed>),
    TimedOut(Request<TimedOut>),
    Cancelled(Request<Cancelled>),
}

impl AnyRequest {
    /// Get the request ID regardless of phase.
    pub fn id(&self) -> RequestId {
        self.data().id
    }

    /// Get the owning backend regardless of phase.
    pub fn backend(&self) -> &str {
        &self.data().backend
    }

    pub fn data(&self) -> &RequestData {
        match self {
            AnyRequest::Queued(r) => &r.data,
            AnyRequest::Processing(r) => &r.data,
            AnyRequest::Completed(r) => &r.data,
            AnyRequest::Failed(r) => &r.data,
            AnyRequest::TimedOut(r) => &r.data,
            AnyRequest::Cancelled(r) => &r.data,
        }
    }

    pub fn status(&self) -> RequestStatus {
        match self {
            AnyRequest::Queued(_) => RequestStatus::Queued,
            AnyRequest::Processing(_) => RequestStatus::Processing,
            AnyRequest::Completed(_) => RequestStatus::Completed,
            AnyRequest::Failed(_) => RequestStatus::Failed,
            AnyRequest::TimedOut(_) => RequestStatus::TimedOut,
            AnyRequest::Cancelled(_) => RequestStatus::Cancelled,
        }
    }

    /// Check if this request is in a terminal phase.
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

impl From<Request<Queued>> for AnyRequest {
    fn from(r: Request<Queued>) -> Self {
        AnyRequest::Queued(r)
    }
}

impl From<Request<Processing>> for AnyRequest {
    fn from(r: Request<Processing>) -> Self {
        AnyRequest::Processing(r)
    }
}

impl From<Request<Completed>> for AnyRequest {
    fn from(r: Request<Completed>) -> Self {
        AnyRequest::Completed(r)
    }
}

impl From<Request<Failed>> for AnyRequest {
    fn from(r: Request<Failed>) -> Self {
        AnyRequest::Failed(r)
    }
}

impl From<Request<TimedOut>> for AnyRequest {
    fn from(r: Request<TimedOut>) -> Self {
        AnyRequest::TimedOut(r)
    }
}

impl From<Request<Cancelled>> for AnyRequest {
    fn from(r: Request<Cancelled>) -> Self {
        AnyRequest::Cancelled(r)
    }
}
