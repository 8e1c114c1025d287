//! Gateway core for locally hosted, GPU-resident inference backends.
//!
//! GPU memory constrains how many model servers can run at once, so this
//! crate mediates contention instead of multiplexing: per-backend
//! admission-controlled queues that survive process restarts, a lifecycle
//! manager that owns the backend child processes, and a usage-driven policy
//! loop that decides which single backend deserves the GPU.
//!
//! The three subsystems:
//!
//! - [`queue::CrashProofQueue`] — bounded, priority-ordered, persistent,
//!   with timeout detection, bounded retries, and recovery of in-flight work
//!   after a crash.
//! - [`lifecycle::BackendManager`] — starts, health-gates, gracefully stops,
//!   and swaps backend processes; resolution switches are stop/restart under
//!   a single switch lock.
//! - [`switcher::AutoSwitcher`] — periodically inspects historical usage and
//!   swaps the resident backend when every queue is idle and the cooldown has
//!   elapsed.
//!
//! [`gateway::Gateway`] wires them together from configuration; dispatch from
//! the waiting room to the actual inference call is driven by an external
//! worker through `dequeue`/`complete`/`fail`.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use corral::{CrashProofQueue, InMemoryStore, Priority, QueueConfig, Submission};
//!
//! #[tokio::main]
//! async fn main() -> corral::Result<()> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let queue = Arc::new(CrashProofQueue::new("gemma", QueueConfig::default(), store));
//!
//!     // Recovery runs before the queue accepts traffic.
//!     queue.start().await?;
//!
//!     let id = queue
//!         .enqueue(Submission {
//!             payload: serde_json::json!({"prompt": "hello"}),
//!             task_kind: "chat".to_string(),
//!             client: "cli".to_string(),
//!             priority: Priority::High,
//!             timeout_s: None,
//!             max_retries: None,
//!         })
//!         .await?;
//!
//!     // An external worker drives dispatch and completion.
//!     if let Some(request) = queue.dequeue().await {
//!         queue.complete(request.data.id, None).await;
//!     }
//!
//!     println!("request {id} processed");
//!     queue.stop().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod queue;
pub mod request;
pub mod storage;
pub mod switcher;
pub mod telemetry;

// Re-export commonly used types at the crate root for convenience. These form
// the public interface most users interact with: the queue and its admission
// types, the lifecycle manager and its trait seams, the policy layer, the
// storage contract, and error handling.
pub use config::Config;
pub use error::{GatewayError, Result};
pub use gateway::Gateway;
pub use lifecycle::{
    BackendManager, BackendSnapshot, BackendStatus, HealthProbe, HttpHealthProbe, LaunchSpec,
    Launcher, LifecycleTimings, MockHealthProbe, MockLauncher, ProcessHandle, Resolution,
    VllmLauncher, WorkloadProbe,
};
pub use queue::{CrashProofQueue, QueueConfig, QueueMetrics, QueueSet, Submission};
pub use request::*;
pub use storage::{InMemoryStore, JsonFileStore, Store};
pub use switcher::{
    AutoSwitcher, HistoryEntry, InMemoryHistory, PatternAnalyzer, RequestHistory, UsageAnalysis,
};
