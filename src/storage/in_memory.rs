//! In-memory storage implementation.
//!
//! Stores all documents in a concurrent map. Suitable for testing and
//! deployments that opt out of persistence; documents are lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::error::Result;
use crate::request::{RequestId, RequestRecord, RequestStatus};

use super::Store;

/// In-memory implementation of the [`Store`] trait.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    documents: Arc<RwLock<HashMap<RequestId, RequestRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently held. Test helper.
    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert(&self, record: &RequestRecord) -> Result<()> {
        self.documents
            .write()
            .insert(record.request_id, record.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: RequestId) -> Result<Option<RequestRecord>> {
        Ok(self.documents.read().get(&id).cloned())
    }

    async fn find_by_backend_and_status(
        &self,
        backend: &str,
        statuses: &[RequestStatus],
    ) -> Result<Vec<RequestRecord>> {
        let mut rows: Vec<RequestRecord> = self
            .documents
            .read()
            .values()
            .filter(|r| r.backend == backend && statuses.contains(&r.status))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut documents = self.documents.write();
        let before = documents.len();
        documents.retain(|_, r| {
            !(r.status.is_terminal() && r.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        Ok((before - documents.len()) as u64)
    }
}
