//! Persistence layer for queue state.
//!
//! The contract is deliberately small: idempotent upserts keyed by request id,
//! a keyed lookup, a backend+status scan for crash recovery, and a retention
//! sweep. Any durable key/document store satisfying these operations suffices;
//! this crate ships an in-memory implementation for tests and ephemeral runs
//! and a JSON-file-backed implementation that survives process restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::request::{RequestId, RequestRecord, RequestStatus};

pub mod in_memory;
pub mod json_file;

pub use in_memory::InMemoryStore;
pub use json_file::JsonFileStore;

/// Storage trait for persisting and querying request documents.
///
/// Implementations don't validate state transitions; the typed request model
/// guarantees only legal documents reach the store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or replace the document for `record.request_id`. Idempotent.
    async fn upsert(&self, record: &RequestRecord) -> Result<()>;

    /// Fetch a single document by request id.
    async fn find_by_id(&self, id: RequestId) -> Result<Option<RequestRecord>>;

    /// All documents for `backend` whose status is in `statuses`, ordered by
    /// `created_at` so recovery preserves FIFO within a priority.
    async fn find_by_backend_and_status(
        &self,
        backend: &str,
        statuses: &[RequestStatus],
    ) -> Result<Vec<RequestRecord>>;

    /// Retention sweep: delete terminal documents completed before `cutoff`.
    /// Returns the number of deleted documents.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
