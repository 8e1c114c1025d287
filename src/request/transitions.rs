//! Phase transitions for the request state machine.
//!
//! QUEUED → PROCESSING (dispatch) → COMPLETED | FAILED | TIMEOUT, with a
//! failure re-entering QUEUED while retry budget remains. Transitions are pure
//! state moves; the owning queue persists the resulting document before the
//! operation is acknowledged.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::{
    Cancelled, Completed, Failed, Processing, Queued, Request, TimedOut,
};

/// Result of failing an in-flight request: either back to the waiting room or
/// terminally failed once the retry budget is spent.
#[derive(Debug)]
pub enum FailOutcome {
    Requeued(Request<Queued>),
    Exhausted(Request<Failed>),
}

impl Request<Queued> {
    /// Hand the request to a worker slot.
    pub fn dispatch(self, now: DateTime<Utc>) -> Request<Processing> {
        Request {
            state: Processing {
                started_at: now,
                retries: self.state.retries,
            },
            data: self.data,
        }
    }

    /// Cancel a request that has not yet been dispatched.
    pub fn cancel(self, now: DateTime<Utc>) -> Request<Cancelled> {
        Request {
            state: Cancelled {
                completed_at: now,
                retries: self.state.retries,
            },
            data: self.data,
        }
    }

    /// Terminally fail a waiting request without dispatching it (used when a
    /// retry cannot be re-admitted).
    pub fn abandon(self, error: impl Into<String>, now: DateTime<Utc>) -> Request<Failed> {
        Request {
            state: Failed {
                started_at: None,
                completed_at: now,
                retries: self.state.retries,
                error: error.into(),
            },
            data: self.data,
        }
    }
}

impl Request<Processing> {
    /// Mark the request as successfully completed.
    pub fn complete(self, result: Option<Value>, now: DateTime<Utc>) -> Request<Completed> {
        Request {
            state: Completed {
                started_at: self.state.started_at,
                completed_at: now,
                retries: self.state.retries,
                result,
            },
            data: self.data,
        }
    }

    /// Record a failure. While budget remains the request re-enters the
    /// waiting room at its current priority with the dispatch timestamp
    /// cleared; otherwise it is terminally FAILED.
    pub fn fail(self, error: impl Into<String>, now: DateTime<Utc>) -> FailOutcome {
        let error = error.into();
        if self.state.retries < self.data.max_retries {
            FailOutcome::Requeued(Request {
                state: Queued {
                    retries: self.state.retries + 1,
                    last_error: Some(error),
                },
                data: self.data,
            })
        } else {
            FailOutcome::Exhausted(Request {
                state: Failed {
                    started_at: Some(self.state.started_at),
                    completed_at: now,
                    retries: self.state.retries,
                    error,
                },
                data: self.data,
            })
        }
    }

    /// Expire a request that exceeded its processing deadline. Distinct from
    /// failure: timed-out requests are never retried.
    pub fn time_out(self, now: DateTime<Utc>) -> Request<TimedOut> {
        Request {
            state: TimedOut {
                started_at: self.state.started_at,
                completed_at: now,
                retries: self.state.retries,
            },
            data: self.data,
        }
    }

    /// Cancel an in-flight request.
    pub fn cancel(self, now: DateTime<Utc>) -> Request<Cancelled> {
        Request {
            state: Cancelled {
                completed_at: now,
                retries: self.state.retries,
            },
            data: self.data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::types::{Priority, RequestData, RequestId};
    use super::*;

    fn sample_data(max_retries: u32) -> RequestData {
        RequestData {
            id: RequestId::new_v4(),
            backend: "gemma".to_string(),
            task_kind: "chat".to_string(),
            client: "client-1".to_string(),
            payload: serde_json::json!({"prompt": "hi"}),
            priority: Priority::Normal,
            created_at: Utc::now(),
            timeout_s: 300,
            max_retries,
        }
    }

    #[test]
    fn dispatch_sets_started_at() {
        let request = Request {
            state: Queued {
                retries: 0,
                last_error: None,
            },
            data: sample_data(3),
        };
        let now = Utc::now();
        let dispatched = request.dispatch(now);
        assert_eq!(dispatched.state.started_at, now);
        assert_eq!(dispatched.state.retries, 0);
    }

    #[test]
    fn failing_request_is_dispatched_budget_plus_one_times() {
        for budget in 0u32..4 {
            let mut queued = Request {
                state: Queued {
                    retries: 0,
                    last_error: None,
                },
                data: sample_data(budget),
            };
            let mut dispatches = 0u32;
            loop {
                let processing = queued.dispatch(Utc::now());
                dispatches += 1;
                match processing.fail("boom", Utc::now()) {
                    FailOutcome::Requeued(next) => queued = next,
                    FailOutcome::Exhausted(failed) => {
                        assert_eq!(failed.state.error, "boom");
                        assert!(failed.state.completed_at >= failed.data.created_at);
                        break;
                    }
                }
            }
            assert_eq!(dispatches, budget + 1);
        }
    }

    #[test]
    fn requeue_clears_dispatch_and_records_error() {
        let queued = Request {
            state: Queued {
                retries: 0,
                last_error: None,
            },
            data: sample_data(2),
        };
        let processing = queued.dispatch(Utc::now());
        match processing.fail("transient", Utc::now()) {
            FailOutcome::Requeued(next) => {
                assert_eq!(next.state.retries, 1);
                assert_eq!(next.state.last_error.as_deref(), Some("transient"));
            }
            FailOutcome::Exhausted(_) => panic!("budget should remain"),
        }
    }

    #[test]
    fn expiry_is_measured_from_dispatch() {
        let mut data = sample_data(0);
        data.timeout_s = 60;
        let started = Utc::now() - chrono::Duration::seconds(61);
        let processing = Request {
            state: Processing {
                started_at: started,
                retries: 0,
            },
            data,
        };
        assert!(processing.is_expired(Utc::now()));

        let fresh = Request {
            state: Processing {
                started_at: Utc::now(),
                retries: 0,
            },
            data: sample_data(0),
        };
        assert!(!fresh.is_expired(Utc::now()));
    }

    #[test]
    fn timeout_is_terminal_and_not_a_failure() {
        let queued = Request {
            state: Queued {
                retries: 0,
                last_error: None,
            },
            data: sample_data(3),
        };
        let timed_out = queued.dispatch(Utc::now()).time_out(Utc::now());
        // No retry path exists from the TimedOut phase; this compiles only
        // because time_out consumes the request.
        assert_eq!(timed_out.state.retries, 0);
    }
}
