//! Crash-proof per-backend request queue.
//!
//! One instance per backend: bounded admission, priority-aware ordering,
//! persistence of every transition, timeout detection on a fixed cadence,
//! bounded retries, and recovery of in-flight work after a crash.
//!
//! All in-memory mutations run under a single async mutex, so the queue has
//! exactly one mutator at a time; persistence happens while the mutation lock
//! is held, which is what makes the ordering guarantees (FIFO within a
//! priority, persisted-before-returned) observable.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, Result};
use crate::lifecycle::WorkloadProbe;
use crate::request::{
    AnyRequest, FailOutcome, Priority, Processing, Queued, Request, RequestData, RequestId,
    RequestRecord, RequestStatus,
};
use crate::storage::Store;

#[cfg(test)]
mod tests;

/// Per-queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of worker slots.
    pub max_concurrent: usize,
    /// Waiting-room bound; admissions beyond it are rejected.
    pub max_waiting: usize,
    /// Default processing deadline for requests that don't carry one.
    pub default_timeout_s: u32,
    /// Default retry budget.
    pub default_max_retries: u32,
    /// When false, insertion degrades to pure FIFO.
    pub priority_enabled: bool,
    /// When false, the store is never touched (no recovery either).
    pub persistence_enabled: bool,
    /// Cadence of the timeout-detection loop.
    pub recovery_check_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_waiting: 10,
            default_timeout_s: 300,
            default_max_retries: 3,
            priority_enabled: true,
            persistence_enabled: true,
            recovery_check_interval: Duration::from_secs(60),
        }
    }
}

/// An admission: everything the caller supplies at enqueue time.
#[derive(Debug, Clone)]
pub struct Submission {
    pub payload: Value,
    pub task_kind: String,
    pub client: String,
    pub priority: Priority,
    /// Override of the queue's default processing deadline.
    pub timeout_s: Option<u32>,
    /// Override of the queue's default retry budget.
    pub max_retries: Option<u32>,
}

/// Queue counters. The totals are strictly monotonic within a process
/// lifetime.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueMetrics {
    pub backend: String,
    pub processing: usize,
    pub waiting: usize,
    pub max_concurrent: usize,
    pub max_waiting: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_timeout: u64,
    pub utilization: f64,
}

struct QueueState {
    waiting: VecDeque<Request<Queued>>,
    processing: HashMap<RequestId, Request<Processing>>,
    total_processed: u64,
    total_failed: u64,
    total_timeout: u64,
}

/// Crash-proof queue for one backend.
pub struct CrashProofQueue<S> {
    backend: String,
    config: QueueConfig,
    store: Arc<S>,
    state: Mutex<QueueState>,
    reaper: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<S: Store + 'static> CrashProofQueue<S> {
    pub fn new(backend: impl Into<String>, config: QueueConfig, store: Arc<S>) -> Self {
        let backend = backend.into();
        tracing::info!(
            backend = %backend,
            max_concurrent = config.max_concurrent,
            max_waiting = config.max_waiting,
            "initialized crash-proof queue"
        );
        Self {
            backend,
            config,
            store,
            state: Mutex::new(QueueState {
                waiting: VecDeque::new(),
                processing: HashMap::new(),
                total_processed: 0,
                total_failed: 0,
                total_timeout: 0,
            }),
            reaper: parking_lot::Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Recover persisted work and start the timeout-detection loop. Must run
    /// before the queue accepts traffic.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let recovered = self.recover_from_crash().await?;
        if recovered > 0 {
            tracing::info!(backend = %self.backend, recovered, "recovered requests from store");
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let queue = Arc::clone(self);
            let token = token.clone();
            async move { queue.timeout_loop(token).await }
        });

        if let Some((old_token, old_handle)) = self.reaper.lock().replace((token, handle)) {
            old_token.cancel();
            old_handle.abort();
        }

        tracing::info!(backend = %self.backend, "queue started");
        Ok(())
    }

    /// Stop the timeout loop and flush all in-memory requests to the store.
    pub async fn stop(&self) {
        let slot = self.reaper.lock().take();
        if let Some((token, handle)) = slot {
            token.cancel();
            let _ = handle.await;
        }
        self.flush().await;
        tracing::info!(backend = %self.backend, "queue stopped");
    }

    /// Admit a request. The new document is persisted before the id is
    /// returned.
    pub async fn enqueue(&self, submission: Submission) -> Result<RequestId> {
        let mut state = self.state.lock().await;

        if state.waiting.len() >= self.config.max_waiting {
            return Err(GatewayError::QueueFull(self.backend.clone()));
        }

        let request = Request {
            state: Queued {
                retries: 0,
                last_error: None,
            },
            data: RequestData {
                id: RequestId::new_v4(),
                backend: self.backend.clone(),
                task_kind: submission.task_kind,
                client: submission.client,
                payload: submission.payload,
                priority: submission.priority,
                created_at: Utc::now(),
                timeout_s: submission.timeout_s.unwrap_or(self.config.default_timeout_s),
                max_retries: submission
                    .max_retries
                    .unwrap_or(self.config.default_max_retries),
            },
        };
        let id = request.data.id;
        let record = request.to_record();

        self.insert_by_priority(&mut state.waiting, request);
        self.persist(&record).await;

        tracing::info!(request_id = %id, backend = %self.backend, "request admitted");
        Ok(id)
    }

    /// Hand the next request to a worker slot, or `None` when the waiting
    /// room is empty or every slot is taken. The returned snapshot is already
    /// persisted as PROCESSING.
    pub async fn dequeue(&self) -> Option<Request<Processing>> {
        let mut state = self.state.lock().await;

        if state.processing.len() >= self.config.max_concurrent {
            return None;
        }
        let request = state.waiting.pop_front()?;

        let dispatched = request.dispatch(Utc::now());
        let record = dispatched.to_record();
        state.processing.insert(dispatched.data.id, dispatched.clone());
        self.persist(&record).await;

        tracing::info!(
            request_id = %dispatched.data.id,
            backend = %self.backend,
            "request dispatched"
        );
        Some(dispatched)
    }

    /// Mark an in-flight request completed. No-op with a warning if the id is
    /// not in a worker slot.
    pub async fn complete(&self, id: RequestId, result: Option<Value>) {
        let mut state = self.state.lock().await;
        let Some(request) = state.processing.remove(&id) else {
            tracing::warn!(request_id = %id, backend = %self.backend, "complete for unknown in-flight request");
            return;
        };

        let completed = request.complete(result, Utc::now());
        state.total_processed += 1;
        self.persist(&completed.to_record()).await;

        tracing::info!(request_id = %id, backend = %self.backend, "request completed");
    }

    /// Record a failure for an in-flight request: re-admitted at its current
    /// priority while retry budget remains, terminally FAILED otherwise.
    pub async fn fail(&self, id: RequestId, error: impl Into<String>) {
        let mut state = self.state.lock().await;
        let Some(request) = state.processing.remove(&id) else {
            tracing::warn!(request_id = %id, backend = %self.backend, "fail for unknown in-flight request");
            return;
        };

        match request.fail(error, Utc::now()) {
            FailOutcome::Requeued(queued) => {
                if state.waiting.len() >= self.config.max_waiting {
                    // The waiting-room bound holds even for retries; without
                    // room the retry is abandoned.
                    tracing::warn!(
                        request_id = %id,
                        backend = %self.backend,
                        "waiting room full, abandoning retry"
                    );
                    let failed = queued.abandon("retry rejected: queue full", Utc::now());
                    state.total_failed += 1;
                    self.persist(&failed.to_record()).await;
                    return;
                }
                tracing::warn!(
                    request_id = %id,
                    backend = %self.backend,
                    retries = queued.state.retries,
                    max_retries = queued.data.max_retries,
                    "request failed, requeued"
                );
                let record = queued.to_record();
                self.insert_by_priority(&mut state.waiting, queued);
                self.persist(&record).await;
            }
            FailOutcome::Exhausted(failed) => {
                tracing::error!(
                    request_id = %id,
                    backend = %self.backend,
                    retries = failed.state.retries,
                    "request failed permanently"
                );
                state.total_failed += 1;
                self.persist(&failed.to_record()).await;
            }
        }
    }

    /// Cancel a request that is waiting or in flight. Requests already in a
    /// terminal state cannot be cancelled.
    pub async fn cancel(&self, id: RequestId) -> Result<()> {
        let mut state = self.state.lock().await;

        if let Some(position) = state.waiting.iter().position(|r| r.data.id == id) {
            if let Some(request) = state.waiting.remove(position) {
                let cancelled = request.cancel(Utc::now());
                self.persist(&cancelled.to_record()).await;
                tracing::info!(request_id = %id, backend = %self.backend, "request cancelled");
            }
            return Ok(());
        }

        if let Some(request) = state.processing.remove(&id) {
            let cancelled = request.cancel(Utc::now());
            self.persist(&cancelled.to_record()).await;
            tracing::info!(request_id = %id, backend = %self.backend, "in-flight request cancelled");
            return Ok(());
        }

        Err(GatewayError::RequestNotFound(id))
    }

    /// Current snapshot of a request: worker slots first, then the waiting
    /// room, then the store.
    pub async fn status(&self, id: RequestId) -> Result<Option<RequestRecord>> {
        {
            let state = self.state.lock().await;
            if let Some(request) = state.processing.get(&id) {
                return Ok(Some(request.to_record()));
            }
            if let Some(request) = state.waiting.iter().find(|r| r.data.id == id) {
                return Ok(Some(request.to_record()));
            }
        }
        if !self.config.persistence_enabled {
            return Ok(None);
        }
        self.store.find_by_id(id).await
    }

    pub async fn metrics(&self) -> QueueMetrics {
        let state = self.state.lock().await;
        let utilization = if self.config.max_concurrent > 0 {
            state.processing.len() as f64 / self.config.max_concurrent as f64
        } else {
            0.0
        };
        QueueMetrics {
            backend: self.backend.clone(),
            processing: state.processing.len(),
            waiting: state.waiting.len(),
            max_concurrent: self.config.max_concurrent,
            max_waiting: self.config.max_waiting,
            total_processed: state.total_processed,
            total_failed: state.total_failed,
            total_timeout: state.total_timeout,
            utilization,
        }
    }

    /// Scan the store for unfinished work left behind by a previous process.
    ///
    /// Rows still marked PROCESSING were interrupted mid-flight: they return
    /// to the waiting room with one retry consumed, or are terminally FAILED
    /// once the budget is gone. Idempotent: rows already resident in memory
    /// are skipped.
    pub async fn recover_from_crash(&self) -> Result<usize> {
        if !self.config.persistence_enabled {
            return Ok(0);
        }

        let rows = self
            .store
            .find_by_backend_and_status(
                &self.backend,
                &[RequestStatus::Queued, RequestStatus::Processing],
            )
            .await?;

        let mut state = self.state.lock().await;
        let mut recovered = 0usize;

        for row in rows {
            let id = row.request_id;
            if state.processing.contains_key(&id)
                || state.waiting.iter().any(|r| r.data.id == id)
            {
                continue;
            }

            let request = match AnyRequest::try_from(row) {
                Ok(request) => request,
                Err(e) => {
                    tracing::error!(request_id = %id, error = %e, "failed to recover request");
                    continue;
                }
            };

            let queued = match request {
                AnyRequest::Queued(queued) => queued,
                AnyRequest::Processing(interrupted) => {
                    tracing::warn!(
                        request_id = %id,
                        backend = %self.backend,
                        "recovering interrupted in-flight request"
                    );
                    Request {
                        state: Queued {
                            retries: interrupted.state.retries + 1,
                            last_error: Some("interrupted by gateway restart".to_string()),
                        },
                        data: interrupted.data,
                    }
                }
                _ => continue,
            };

            if queued.state.retries < queued.data.max_retries {
                let record = queued.to_record();
                self.insert_by_priority(&mut state.waiting, queued);
                self.persist(&record).await;
                recovered += 1;
            } else {
                let failed = queued.abandon("retry budget exhausted during recovery", Utc::now());
                state.total_failed += 1;
                self.persist(&failed.to_record()).await;
            }
        }

        Ok(recovered)
    }

    async fn timeout_loop(self: Arc<Self>, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.recovery_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.expire_stale().await;
                }
                _ = token.cancelled() => {
                    tracing::debug!(backend = %self.backend, "timeout loop stopping");
                    return;
                }
            }
        }
    }

    /// Transition every in-flight request past its deadline to TIMEOUT.
    /// Detection does not depend on the worker ever calling back.
    async fn expire_stale(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let expired: Vec<RequestId> = state
            .processing
            .values()
            .filter(|r| r.is_expired(now))
            .map(|r| r.data.id)
            .collect();

        for id in expired {
            let Some(request) = state.processing.remove(&id) else {
                continue;
            };
            tracing::warn!(
                request_id = %id,
                backend = %self.backend,
                timeout_s = request.data.timeout_s,
                "request timed out"
            );
            let timed_out = request.time_out(now);
            state.total_timeout += 1;
            self.persist(&timed_out.to_record()).await;
        }
    }

    /// Persist every in-memory request, called on `stop`.
    async fn flush(&self) {
        if !self.config.persistence_enabled {
            return;
        }
        let state = self.state.lock().await;
        for request in state.waiting.iter() {
            self.persist(&request.to_record()).await;
        }
        for request in state.processing.values() {
            self.persist(&request.to_record()).await;
        }
    }

    /// Best-effort upsert: store errors are logged, the in-memory transition
    /// stands, and the next transition's upsert catches the row up.
    async fn persist(&self, record: &RequestRecord) {
        if !self.config.persistence_enabled {
            return;
        }
        if let Err(e) = self.store.upsert(record).await {
            tracing::error!(
                request_id = %record.request_id,
                backend = %self.backend,
                error = %e,
                "failed to persist request"
            );
        }
    }

    /// Insert into the waiting room before the first entry with a strictly
    /// lower priority; equal priorities keep FIFO order.
    fn insert_by_priority(&self, waiting: &mut VecDeque<Request<Queued>>, request: Request<Queued>) {
        if !self.config.priority_enabled {
            waiting.push_back(request);
            return;
        }
        let rank = request.data.priority.rank();
        match waiting
            .iter()
            .position(|existing| rank < existing.data.priority.rank())
        {
            Some(index) => waiting.insert(index, request),
            None => waiting.push_back(request),
        }
    }
}

// ============================================================================
// Queue registry
// ============================================================================

/// Registry of one queue per enabled backend, shared by the lifecycle manager
/// (drain checks) and the auto-switcher (idle checks).
#[derive(Default)]
pub struct QueueSet<S> {
    queues: HashMap<String, Arc<CrashProofQueue<S>>>,
}

impl<S: Store + 'static> QueueSet<S> {
    pub fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    pub fn insert(&mut self, backend: impl Into<String>, queue: Arc<CrashProofQueue<S>>) {
        self.queues.insert(backend.into(), queue);
    }

    pub fn get(&self, backend: &str) -> Result<&Arc<CrashProofQueue<S>>> {
        self.queues
            .get(backend)
            .ok_or_else(|| GatewayError::UnknownBackend(backend.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<CrashProofQueue<S>>)> {
        self.queues.iter()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Run recovery and start the timeout loop on every queue.
    pub async fn start_all(&self) -> Result<()> {
        for queue in self.queues.values() {
            queue.start().await?;
        }
        Ok(())
    }

    /// Stop and flush every queue.
    pub async fn stop_all(&self) {
        for queue in self.queues.values() {
            queue.stop().await;
        }
    }

    /// True iff no queue has an in-flight request.
    pub async fn all_idle(&self) -> bool {
        for queue in self.queues.values() {
            if queue.metrics().await.processing > 0 {
                return false;
            }
        }
        true
    }

    pub async fn all_metrics(&self) -> Vec<QueueMetrics> {
        let mut metrics = Vec::with_capacity(self.queues.len());
        for queue in self.queues.values() {
            metrics.push(queue.metrics().await);
        }
        metrics.sort_by(|a, b| a.backend.cmp(&b.backend));
        metrics
    }
}

#[async_trait]
impl<S: Store + 'static> WorkloadProbe for QueueSet<S> {
    async fn active_requests(&self, backend: &str) -> usize {
        match self.queues.get(backend) {
            Some(queue) => queue.metrics().await.processing,
            None => 0,
        }
    }
}
