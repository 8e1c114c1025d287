//! Persisted document shape for requests.
//!
//! Documents are keyed by `request_id` and carry an explicit status plus
//! optional phase timestamps as RFC 3339 strings. Converting a document back
//! into a typed request re-validates the phase invariants, so a corrupted row
//! cannot re-enter the state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

use super::types::{
    AnyRequest, Cancelled, Completed, Failed, Priority, Processing, Queued, Request, RequestData,
    RequestId, RequestState, RequestStatus, TimedOut,
};

/// The document persisted for every request transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: RequestId,
    pub backend: String,
    pub task_kind: String,
    pub client: String,
    pub payload: Value,
    pub priority: Priority,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_s: u32,
    pub retries: u32,
    pub max_retries: u32,
    pub error: Option<String>,
    pub result: Option<Value>,
}

impl<T: RequestState + Clone> Request<T>
where
    AnyRequest: From<Request<T>>,
{
    /// Snapshot this request as its persisted document form.
    pub fn to_record(&self) -> RequestRecord {
        RequestRecord::from(&AnyRequest::from(self.clone()))
    }
}

impl From<&AnyRequest> for RequestRecord {
    fn from(request: &AnyRequest) -> Self {
        let data = request.data();
        let mut record = RequestRecord {
            request_id: data.id,
            backend: data.backend.clone(),
            task_kind: data.task_kind.clone(),
            client: data.client.clone(),
            payload: data.payload.clone(),
            priority: data.priority,
            status: request.status(),
            created_at: data.created_at,
            started_at: None,
            completed_at: None,
            timeout_s: data.timeout_s,
            retries: 0,
            max_retries: data.max_retries,
            error: None,
            result: None,
        };

        match request {
            AnyRequest::Queued(r) => {
                record.retries = r.state.retries;
                record.error = r.state.last_error.clone();
            }
            AnyRequest::Processing(r) => {
                record.retries = r.state.retries;
                record.started_at = Some(r.state.started_at);
            }
            AnyRequest::Completed(r) => {
                record.retries = r.state.retries;
                record.started_at = Some(r.state.started_at);
                record.completed_at = Some(r.state.completed_at);
                record.result = r.state.result.clone();
            }
            AnyRequest::Failed(r) => {
                record.retries = r.state.retries;
                record.started_at = r.state.started_at;
                record.completed_at = Some(r.state.completed_at);
                record.error = Some(r.state.error.clone());
            }
            AnyRequest::TimedOut(r) => {
                record.retries = r.state.retries;
                record.started_at = Some(r.state.started_at);
                record.completed_at = Some(r.state.completed_at);
            }
            AnyRequest::Cancelled(r) => {
                record.retries = r.state.retries;
                record.completed_at = Some(r.state.completed_at);
            }
        }

        record
    }
}

impl TryFrom<RequestRecord> for AnyRequest {
    type Error = GatewayError;

    fn try_from(record: RequestRecord) -> Result<Self, Self::Error> {
        let id = record.request_id;
        let data = RequestData {
            id,
            backend: record.backend,
            task_kind: record.task_kind,
            client: record.client,
            payload: record.payload,
            priority: record.priority,
            created_at: record.created_at,
            timeout_s: record.timeout_s,
            max_retries: record.max_retries,
        };

        let invalid = |detail: &str| GatewayError::InvalidState(id, detail.to_string());

        let request = match record.status {
            RequestStatus::Queued => {
                if record.started_at.is_some() {
                    return Err(invalid("queued row carries a dispatch timestamp"));
                }
                AnyRequest::Queued(Request {
                    state: Queued {
                        retries: record.retries,
                        last_error: record.error,
                    },
                    data,
                })
            }
            RequestStatus::Processing => AnyRequest::Processing(Request {
                state: Processing {
                    started_at: record
                        .started_at
                        .ok_or_else(|| invalid("processing row without started_at"))?,
                    retries: record.retries,
                },
                data,
            }),
            RequestStatus::Completed => AnyRequest::Completed(Request {
                state: Completed {
                    started_at: record
                        .started_at
                        .ok_or_else(|| invalid("completed row without started_at"))?,
                    completed_at: record
                        .completed_at
                        .ok_or_else(|| invalid("completed row without completed_at"))?,
                    retries: record.retries,
                    result: record.result,
                },
                data,
            }),
            RequestStatus::Failed => AnyRequest::Failed(Request {
                state: Failed {
                    started_at: record.started_at,
                    completed_at: record
                        .completed_at
                        .ok_or_else(|| invalid("failed row without completed_at"))?,
                    retries: record.retries,
                    error: record.error.unwrap_or_else(|| "unknown error".to_string()),
                },
                data,
            }),
            RequestStatus::TimedOut => AnyRequest::TimedOut(Request {
                state: TimedOut {
                    started_at: record
                        .started_at
                        .ok_or_else(|| invalid("timeout row without started_at"))?,
                    completed_at: record
                        .completed_at
                        .ok_or_else(|| invalid("timeout row without completed_at"))?,
                    retries: record.retries,
                },
                data,
            }),
            RequestStatus::Cancelled => AnyRequest::Cancelled(Request {
                state: Cancelled {
                    completed_at: record
                        .completed_at
                        .ok_or_else(|| invalid("cancelled row without completed_at"))?,
                    retries: record.retries,
                },
                data,
            }),
        };

        Ok(request)
    }
}
