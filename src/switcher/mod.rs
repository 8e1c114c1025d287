//! Usage-driven automatic backend switching.
//!
//! A long-lived control loop that periodically asks the pattern analyzer
//! which backend deserves the GPU and, when every queue is idle and the
//! cooldown has elapsed, swaps through the lifecycle manager. A failed swap
//! is not retried within the iteration; the next pass re-evaluates.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AutoSwitchSettings;
use crate::error::Result;
use crate::lifecycle::BackendManager;
use crate::queue::QueueSet;
use crate::storage::Store;

pub mod patterns;

pub use patterns::{
    HistoryEntry, InMemoryHistory, PatternAnalyzer, RequestHistory, UsageAnalysis, MIN_CONFIDENCE,
};

/// Observability snapshot of the switcher.
#[derive(Debug, Clone, Serialize)]
pub struct SwitcherStatus {
    pub enabled: bool,
    pub running: bool,
    pub last_switch: Option<DateTime<Utc>>,
    pub current: Option<String>,
    pub analysis: UsageAnalysis,
}

/// Periodic task that keeps the most-used backend resident.
pub struct AutoSwitcher<S> {
    settings: AutoSwitchSettings,
    manager: Arc<BackendManager>,
    queues: Arc<QueueSet<S>>,
    analyzer: PatternAnalyzer,
    last_switch: Mutex<Option<DateTime<Utc>>>,
    task: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<S: Store + 'static> AutoSwitcher<S> {
    pub fn new(
        settings: AutoSwitchSettings,
        manager: Arc<BackendManager>,
        queues: Arc<QueueSet<S>>,
        history: Arc<dyn RequestHistory>,
    ) -> Self {
        let analyzer = PatternAnalyzer::new(
            history,
            settings.pattern_window_days,
            settings.min_requests_for_switch,
        );
        tracing::info!(enabled = settings.enabled, "auto-switcher initialized");
        Self {
            settings,
            manager,
            queues,
            analyzer,
            last_switch: Mutex::new(None),
            task: parking_lot::Mutex::new(None),
        }
    }

    /// Spawn the switching loop. Does nothing when auto-switching is
    /// disabled in configuration.
    pub fn start(self: &Arc<Self>) {
        if !self.settings.enabled {
            tracing::info!("auto-switching is disabled");
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let switcher = Arc::clone(self);
            let token = token.clone();
            async move { switcher.run(token).await }
        });

        if let Some((old_token, old_handle)) = self.task.lock().replace((token, handle)) {
            old_token.cancel();
            old_handle.abort();
        }
        tracing::info!("auto-switching service started");
    }

    /// Cancel the switching loop and wait for it to finish.
    pub async fn stop(&self) {
        let slot = self.task.lock().take();
        if let Some((token, handle)) = slot {
            token.cancel();
            let _ = handle.await;
            tracing::info!("auto-switching service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    pub async fn last_switch(&self) -> Option<DateTime<Utc>> {
        *self.last_switch.lock().await
    }

    pub async fn status(&self) -> Result<SwitcherStatus> {
        Ok(SwitcherStatus {
            enabled: self.settings.enabled,
            running: self.is_running(),
            last_switch: self.last_switch().await,
            current: self.manager.current().await,
            analysis: self.analyzer.analyze().await?,
        })
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        let interval = self.cooldown();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = token.cancelled() => {
                    tracing::debug!("switching loop stopping");
                    return;
                }
            }
            if let Err(e) = self.evaluate_once().await {
                tracing::error!(error = %e, "error in auto-switching pass");
            }
        }
    }

    /// One pass of the control loop. Returns true iff a swap happened.
    pub async fn evaluate_once(&self) -> Result<bool> {
        let now = Utc::now();

        // Cooldown is measured end-to-end between successful swaps.
        if let Some(last) = *self.last_switch.lock().await {
            let elapsed = now - last;
            if elapsed < chrono::Duration::from_std(self.cooldown()).unwrap_or_default() {
                tracing::debug!(
                    since_last_s = elapsed.num_seconds(),
                    "within cooldown, skipping evaluation"
                );
                return Ok(false);
            }
        }

        let current = self.manager.current().await;
        let Some(target) = self.analyzer.should_switch(current.as_deref()).await? else {
            return Ok(false);
        };

        if !self.queues.all_idle().await {
            tracing::info!(target = %target, "queues not idle, postponing switch");
            return Ok(false);
        }

        tracing::info!(from = ?current, to = %target, "auto-switching resident backend");
        if self.manager.swap(&target, None).await? {
            *self.last_switch.lock().await = Some(Utc::now());
            tracing::info!(target = %target, "auto-switch complete");
            Ok(true)
        } else {
            tracing::error!(target = %target, "auto-switch failed");
            Ok(false)
        }
    }

    fn cooldown(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.settings.switch_cooldown_minutes * 60)
    }
}
