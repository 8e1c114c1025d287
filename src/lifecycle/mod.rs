//! Backend lifecycle management.
//!
//! The manager owns the registry of backend child processes and serializes
//! every lifecycle transition behind a single switch lock: the resource being
//! stewarded (GPU memory) is singular, so callers on different backends still
//! go through the one lock. Swaps and resolution switches are stop/start
//! sequences under that lock.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use crate::config::BackendSettings;
use crate::error::{GatewayError, Result};

pub mod health;
pub mod process;

pub use health::{HealthProbe, HttpHealthProbe, MockHealthProbe};
pub use process::{LaunchSpec, Launcher, MockLauncher, ProcessHandle, ServerProcess, VllmLauncher};

/// Backend runtime status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendStatus::Stopped => "stopped",
            BackendStatus::Starting => "starting",
            BackendStatus::Running => "running",
            BackendStatus::Stopping => "stopping",
            BackendStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// OCR input-resolution modes. The set is closed; unknown values are rejected
/// at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// 512×512
    Tiny,
    /// 640×640
    Small,
    /// 1024×1024
    Base,
    /// 1280×1280
    Large,
    /// Dynamic n×640×640 + 1×1024×1024
    Gundam,
}

impl FromStr for Resolution {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tiny" => Ok(Resolution::Tiny),
            "small" => Ok(Resolution::Small),
            "base" => Ok(Resolution::Base),
            "large" => Ok(Resolution::Large),
            "gundam" => Ok(Resolution::Gundam),
            other => Err(GatewayError::InvalidResolution(other.to_string())),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Resolution::Tiny => "tiny",
            Resolution::Small => "small",
            Resolution::Base => "base",
            Resolution::Large => "large",
            Resolution::Gundam => "gundam",
        };
        f.write_str(label)
    }
}

/// Read-only view of in-flight work, used by graceful stop to drain a backend
/// before signalling its process. Implemented by the queue registry.
#[async_trait]
pub trait WorkloadProbe: Send + Sync {
    async fn active_requests(&self, backend: &str) -> usize;
}

/// Workload probe reporting no active requests; for managers without queues.
pub struct NoWorkload;

#[async_trait]
impl WorkloadProbe for NoWorkload {
    async fn active_requests(&self, _backend: &str) -> usize {
        0
    }
}

/// Timing knobs for lifecycle transitions.
#[derive(Debug, Clone)]
pub struct LifecycleTimings {
    /// Cadence of health probes while a backend is starting.
    pub health_poll_interval: Duration,
    /// Bound on the startup health gate; expiry marks the backend ERROR.
    pub health_wait_timeout: Duration,
    /// Grace between the polite termination signal and force-kill.
    pub stop_grace: Duration,
    /// Default bound on draining active requests during graceful stop.
    pub stop_timeout: Duration,
    /// Cadence of active-request polls while draining.
    pub drain_poll_interval: Duration,
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self {
            health_poll_interval: Duration::from_secs(2),
            health_wait_timeout: Duration::from_secs(120),
            stop_grace: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(60),
            drain_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Registry entry for one backend.
struct BackendEntry {
    settings: BackendSettings,
    status: BackendStatus,
    process: Option<Box<dyn ProcessHandle>>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
    current_resolution: Option<Resolution>,
}

struct ManagerState {
    backends: HashMap<String, BackendEntry>,
    /// The backend currently resident on the GPU, if any.
    current: Option<String>,
}

/// Point-in-time view of one backend, including a live health probe.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub name: String,
    pub status: BackendStatus,
    pub port: u16,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub uptime_s: i64,
    pub resolution: Option<Resolution>,
    pub healthy: bool,
}

/// Manages backend child processes: start, health-gate, graceful stop, swap,
/// and resolution switch.
pub struct BackendManager {
    state: RwLock<ManagerState>,
    /// The single serialization point for any lifecycle change.
    switch_lock: Mutex<()>,
    launcher: Arc<dyn Launcher>,
    health: Arc<dyn HealthProbe>,
    workload: Arc<dyn WorkloadProbe>,
    timings: LifecycleTimings,
    log_dir: PathBuf,
}

impl BackendManager {
    pub fn new(
        backends: HashMap<String, BackendSettings>,
        launcher: Arc<dyn Launcher>,
        health: Arc<dyn HealthProbe>,
        workload: Arc<dyn WorkloadProbe>,
        timings: LifecycleTimings,
        log_dir: PathBuf,
    ) -> Self {
        let entries = backends
            .into_iter()
            .map(|(name, settings)| {
                let entry = BackendEntry {
                    current_resolution: settings.resolution_mode,
                    settings,
                    status: BackendStatus::Stopped,
                    process: None,
                    started_at: None,
                    stopped_at: None,
                };
                (name, entry)
            })
            .collect();

        Self {
            state: RwLock::new(ManagerState {
                backends: entries,
                current: None,
            }),
            switch_lock: Mutex::new(()),
            launcher,
            health,
            workload,
            timings,
            log_dir,
        }
    }

    /// Name of the backend currently resident on the GPU.
    pub async fn current(&self) -> Option<String> {
        self.state.read().await.current.clone()
    }

    /// Start a backend and wait for it to become healthy.
    ///
    /// Returns `Ok(true)` once healthy (no-op success if already running),
    /// `Ok(false)` on spawn failure or health-gate expiry (backend marked
    /// ERROR). Unknown backends surface as an error.
    pub async fn start(&self, backend: &str, resolution: Option<Resolution>) -> Result<bool> {
        let _guard = self.switch_lock.lock().await;
        self.start_locked(backend, resolution).await
    }

    /// Stop a backend, draining active requests first when `graceful`.
    ///
    /// Returns `Ok(true)` on clean stop (no-op success if already stopped).
    pub async fn stop(
        &self,
        backend: &str,
        graceful: bool,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let _guard = self.switch_lock.lock().await;
        self.stop_locked(backend, graceful, timeout.unwrap_or(self.timings.stop_timeout))
            .await
    }

    /// Swap the resident backend: gracefully stop the current one (if any and
    /// different), then start `target`.
    pub async fn swap(&self, target: &str, resolution: Option<Resolution>) -> Result<bool> {
        let _guard = self.switch_lock.lock().await;

        if !self.state.read().await.backends.contains_key(target) {
            return Err(GatewayError::UnknownBackend(target.to_string()));
        }

        let current = self.state.read().await.current.clone();
        if let Some(current) = current {
            if current != target {
                tracing::info!(from = %current, to = %target, "swapping resident backend");
                self.stop_locked(&current, true, self.timings.stop_timeout)
                    .await?;
            }
        }

        self.start_locked(target, resolution).await
    }

    /// Restart the resolution-capable backend in a different resolution mode.
    /// No-op success if already at `target`.
    pub async fn switch_resolution(&self, target: Resolution, graceful: bool) -> Result<bool> {
        let name = {
            let state = self.state.read().await;
            state
                .backends
                .iter()
                .find(|(_, e)| e.settings.resolution_mode.is_some())
                .map(|(n, _)| n.clone())
                .ok_or_else(|| {
                    GatewayError::InvalidConfig(
                        "no resolution-capable backend configured".to_string(),
                    )
                })?
        };

        let _guard = self.switch_lock.lock().await;

        let (at_target, running) = {
            let state = self.state.read().await;
            let entry = state
                .backends
                .get(&name)
                .ok_or_else(|| GatewayError::UnknownBackend(name.clone()))?;
            (
                entry.current_resolution == Some(target),
                entry.status == BackendStatus::Running,
            )
        };

        if at_target {
            tracing::info!(backend = %name, resolution = %target, "already at requested resolution");
            return Ok(true);
        }

        tracing::info!(backend = %name, resolution = %target, graceful, "switching resolution");

        if running {
            self.stop_locked(&name, graceful, self.timings.stop_timeout)
                .await?;
        }
        self.start_locked(&name, Some(target)).await
    }

    /// Snapshot one backend, probing its health and detecting a child that
    /// exited behind our back.
    pub async fn status(&self, backend: &str) -> Result<BackendSnapshot> {
        let (snapshot, port) = {
            let mut guard = self.state.write().await;
            let ManagerState { backends, current } = &mut *guard;
            let entry = backends
                .get_mut(backend)
                .ok_or_else(|| GatewayError::UnknownBackend(backend.to_string()))?;

            if entry.status == BackendStatus::Running {
                if let Some(process) = entry.process.as_mut() {
                    if process.has_exited() {
                        tracing::warn!(backend, "backend process exited unexpectedly");
                        entry.status = BackendStatus::Error;
                        entry.process = None;
                        entry.stopped_at = Some(Utc::now());
                        if current.as_deref() == Some(backend) {
                            *current = None;
                        }
                    }
                }
            }

            let uptime_s = match (entry.status, entry.started_at) {
                (BackendStatus::Running, Some(started)) => (Utc::now() - started).num_seconds(),
                _ => 0,
            };
            let snapshot = BackendSnapshot {
                name: backend.to_string(),
                status: entry.status,
                port: entry.settings.port,
                started_at: entry.started_at,
                stopped_at: entry.stopped_at,
                uptime_s,
                resolution: entry.current_resolution,
                healthy: false,
            };
            (snapshot, entry.settings.port)
        };

        let healthy = self.health.check(port).await;
        Ok(BackendSnapshot { healthy, ..snapshot })
    }

    /// Snapshot every configured backend, sorted by name.
    pub async fn all_status(&self) -> Vec<BackendSnapshot> {
        let mut names: Vec<String> = {
            let state = self.state.read().await;
            state.backends.keys().cloned().collect()
        };
        names.sort();

        let mut snapshots = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(snapshot) = self.status(&name).await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    async fn start_locked(&self, backend: &str, resolution: Option<Resolution>) -> Result<bool> {
        // Phase 1: mark STARTING and build the launch spec.
        let spec = {
            let mut guard = self.state.write().await;
            let entry = guard
                .backends
                .get_mut(backend)
                .ok_or_else(|| GatewayError::UnknownBackend(backend.to_string()))?;

            if entry.status == BackendStatus::Running {
                tracing::info!(backend, "backend already running");
                return Ok(true);
            }

            let resolution_capable = entry.settings.resolution_mode.is_some();
            if resolution.is_some() && !resolution_capable {
                tracing::warn!(backend, "resolution ignored for non-OCR backend");
            }

            entry.status = BackendStatus::Starting;
            let effective_resolution = if resolution_capable {
                resolution.or(entry.current_resolution)
            } else {
                None
            };

            LaunchSpec {
                backend: backend.to_string(),
                model: entry.settings.name.clone(),
                port: entry.settings.port,
                gpu_memory: entry.settings.gpu_memory,
                max_model_len: entry.settings.max_model_len,
                max_concurrent: entry.settings.max_concurrent,
                resolution: effective_resolution,
                python_env: entry.settings.python_env.clone(),
                log_path: self.log_dir.join(format!("{backend}_server.log")),
            }
        };

        tracing::info!(backend, port = spec.port, "starting backend");

        let handle = match self.launcher.launch(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(backend, error = %e, "failed to spawn backend");
                if let Some(entry) = self.state.write().await.backends.get_mut(backend) {
                    entry.status = BackendStatus::Error;
                }
                return Ok(false);
            }
        };

        {
            let mut guard = self.state.write().await;
            let entry = guard
                .backends
                .get_mut(backend)
                .ok_or_else(|| GatewayError::UnknownBackend(backend.to_string()))?;
            entry.process = Some(handle);
            entry.started_at = Some(Utc::now());
            if entry.settings.resolution_mode.is_some() {
                entry.current_resolution = spec.resolution;
            }
        }

        // Phase 2: health gate, without holding the registry lock.
        let healthy = self.wait_for_health(spec.port).await;

        let mut guard = self.state.write().await;
        let ManagerState { backends, current } = &mut *guard;
        let entry = backends
            .get_mut(backend)
            .ok_or_else(|| GatewayError::UnknownBackend(backend.to_string()))?;

        if healthy {
            entry.status = BackendStatus::Running;
            *current = Some(backend.to_string());
            tracing::info!(backend, "backend started");
            Ok(true)
        } else {
            tracing::error!(
                backend,
                timeout_s = self.timings.health_wait_timeout.as_secs(),
                "backend failed to become healthy"
            );
            entry.status = BackendStatus::Error;
            Ok(false)
        }
    }

    async fn stop_locked(&self, backend: &str, graceful: bool, timeout: Duration) -> Result<bool> {
        {
            let mut guard = self.state.write().await;
            let entry = guard
                .backends
                .get_mut(backend)
                .ok_or_else(|| GatewayError::UnknownBackend(backend.to_string()))?;

            if entry.status == BackendStatus::Stopped {
                tracing::info!(backend, "backend already stopped");
                return Ok(true);
            }
            entry.status = BackendStatus::Stopping;
        }

        tracing::info!(backend, graceful, "stopping backend");

        if graceful {
            self.drain(backend, timeout).await;
        }

        let process = {
            let mut guard = self.state.write().await;
            guard
                .backends
                .get_mut(backend)
                .and_then(|entry| entry.process.take())
        };

        if let Some(mut handle) = process {
            if let Err(e) = handle.terminate().await {
                tracing::warn!(backend, error = %e, "polite termination failed");
            }
            match tokio::time::timeout(self.timings.stop_grace, handle.wait()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(backend, error = %e, "error waiting for backend process");
                }
                Err(_) => {
                    tracing::warn!(
                        backend,
                        grace_s = self.timings.stop_grace.as_secs(),
                        "backend did not exit within grace period, force killing"
                    );
                    if let Err(e) = handle.kill().await {
                        tracing::error!(backend, error = %e, "force kill failed");
                    }
                }
            }
        }

        let mut guard = self.state.write().await;
        let ManagerState { backends, current } = &mut *guard;
        if let Some(entry) = backends.get_mut(backend) {
            entry.status = BackendStatus::Stopped;
            entry.stopped_at = Some(Utc::now());
        }
        if current.as_deref() == Some(backend) {
            *current = None;
        }

        tracing::info!(backend, "backend stopped");
        Ok(true)
    }

    /// Wait for active requests on `backend` to reach zero, bounded by
    /// `timeout`.
    async fn drain(&self, backend: &str, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let active = self.workload.active_requests(backend).await;
            if active == 0 {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    backend,
                    active,
                    timeout_s = timeout.as_secs(),
                    "graceful stop timed out waiting for active requests"
                );
                return;
            }
            tokio::time::sleep(self.timings.drain_poll_interval).await;
        }
    }

    /// Poll the health endpoint until it answers healthy or the startup
    /// window expires.
    async fn wait_for_health(&self, port: u16) -> bool {
        let deadline = tokio::time::Instant::now() + self.timings.health_wait_timeout;
        loop {
            if self.health.check(port).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.timings.health_poll_interval).await;
        }
    }
}
