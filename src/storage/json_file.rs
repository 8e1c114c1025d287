//! Durable JSON-file-backed storage.
//!
//! Documents are held in memory and the full set is rewritten atomically
//! (temp file + rename) on every mutation. Adequate at the intended scale:
//! the waiting room is bounded per backend, and terminal rows are swept by
//! retention. The file survives process crashes, which is what the queue's
//! recovery scan depends on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{GatewayError, Result};
use crate::request::{RequestId, RequestRecord, RequestStatus};

use super::Store;

/// File-backed implementation of the [`Store`] trait.
pub struct JsonFileStore {
    path: PathBuf,
    documents: RwLock<HashMap<RequestId, RequestRecord>>,
}

impl JsonFileStore {
    /// Open the store, loading any documents persisted by a previous process.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let documents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) if !contents.trim().is_empty() => {
                let rows: Vec<RequestRecord> = serde_json::from_str(&contents)?;
                rows.into_iter().map(|r| (r.request_id, r)).collect()
            }
            Ok(_) => HashMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            path = %path.display(),
            documents = documents.len(),
            "opened queue state store"
        );

        Ok(Self {
            path,
            documents: RwLock::new(documents),
        })
    }

    /// Rewrite the backing file. Called with the write lock held so writers
    /// are serialized and the file always reflects a consistent snapshot.
    async fn flush(&self, documents: &HashMap<RequestId, RequestRecord>) -> Result<()> {
        let mut rows: Vec<&RequestRecord> = documents.values().collect();
        rows.sort_by_key(|r| r.created_at);
        let contents = serde_json::to_vec_pretty(&rows)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &contents).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| GatewayError::Store(format!("rename {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl Store for JsonFileStore {
    async fn upsert(&self, record: &RequestRecord) -> Result<()> {
        let mut documents = self.documents.write().await;
        documents.insert(record.request_id, record.clone());
        self.flush(&documents).await
    }

    async fn find_by_id(&self, id: RequestId) -> Result<Option<RequestRecord>> {
        Ok(self.documents.read().await.get(&id).cloned())
    }

    async fn find_by_backend_and_status(
        &self,
        backend: &str,
        statuses: &[RequestStatus],
    ) -> Result<Vec<RequestRecord>> {
        let mut rows: Vec<RequestRecord> = self
            .documents
            .read()
            .await
            .values()
            .filter(|r| r.backend == backend && statuses.contains(&r.status))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut documents = self.documents.write().await;
        let before = documents.len();
        documents.retain(|_, r| {
            !(r.status.is_terminal() && r.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        let deleted = (before - documents.len()) as u64;
        if deleted > 0 {
            self.flush(&documents).await?;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{Priority, Queued, Request, RequestData};

    fn sample_record(backend: &str) -> RequestRecord {
        Request {
            state: Queued {
                retries: 0,
                last_error: None,
            },
            data: RequestData {
                id: RequestId::new_v4(),
                backend: backend.to_string(),
                task_kind: "chat".to_string(),
                client: "c".to_string(),
                payload: serde_json::json!({"prompt": "hello"}),
                priority: Priority::Normal,
                created_at: Utc::now(),
                timeout_s: 300,
                max_retries: 3,
            },
        }
        .to_record()
    }

    #[tokio::test]
    async fn documents_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let record = sample_record("gemma");
        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store.upsert(&record).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        let found = reopened.find_by_id(record.request_id).await.unwrap();
        assert_eq!(found, Some(record));
    }

    #[tokio::test]
    async fn open_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::open(dir.path().join("missing.json"))
            .await
            .unwrap();
        assert!(store
            .find_by_backend_and_status("gemma", &[RequestStatus::Queued])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn retention_sweep_rewrites_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::open(&path).await.unwrap();

        let mut done = sample_record("gemma");
        done.status = RequestStatus::Completed;
        done.started_at = Some(Utc::now() - chrono::Duration::days(20));
        done.completed_at = Some(Utc::now() - chrono::Duration::days(20));
        store.upsert(&done).await.unwrap();

        let deleted = store
            .delete_older_than(Utc::now() - chrono::Duration::days(15))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert!(reopened.find_by_id(done.request_id).await.unwrap().is_none());
    }
}
