//! Top-level runtime context.
//!
//! Owns the store, the lifecycle manager, one crash-proof queue per enabled
//! backend, and the auto-switcher, and wires them together with explicit
//! dependency injection so tests can construct ephemeral gateways from mocks.
//!
//! Startup order: open store → construct the manager from configuration →
//! construct and start each queue (which runs crash recovery) → start the
//! auto-switcher → start the retention sweep. Shutdown reverses.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::lifecycle::{BackendManager, HealthProbe, Launcher, WorkloadProbe};
use crate::queue::{CrashProofQueue, QueueSet};
use crate::storage::Store;
use crate::switcher::{AutoSwitcher, RequestHistory};

/// Cadence of the retention sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// The assembled gateway core.
pub struct Gateway<S> {
    config: Config,
    store: Arc<S>,
    manager: Arc<BackendManager>,
    queues: Arc<QueueSet<S>>,
    switcher: Arc<AutoSwitcher<S>>,
    sweeper: parking_lot::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl<S: Store + 'static> Gateway<S> {
    /// Assemble the gateway from configuration and injected collaborators.
    pub fn new(
        config: Config,
        store: Arc<S>,
        launcher: Arc<dyn Launcher>,
        health: Arc<dyn HealthProbe>,
        history: Arc<dyn RequestHistory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let mut queues = QueueSet::new();
        for (name, settings) in config.backends.iter().filter(|(_, s)| s.enabled) {
            queues.insert(
                name.clone(),
                Arc::new(CrashProofQueue::new(
                    name.clone(),
                    config.queue_config_for(settings),
                    store.clone(),
                )),
            );
        }
        let queues = Arc::new(queues);

        let manager = Arc::new(BackendManager::new(
            config.backends.clone(),
            launcher,
            health,
            queues.clone() as Arc<dyn WorkloadProbe>,
            config.lifecycle_timings(),
            config.lifecycle.log_dir.clone(),
        ));

        let switcher = Arc::new(AutoSwitcher::new(
            config.auto_switch.clone(),
            manager.clone(),
            queues.clone(),
            history,
        ));

        Ok(Arc::new(Self {
            config,
            store,
            manager,
            queues,
            switcher,
            sweeper: parking_lot::Mutex::new(None),
        }))
    }

    /// Start every subsystem. Queues run crash recovery before the gateway
    /// reports ready.
    pub async fn start(&self) -> Result<()> {
        self.queues.start_all().await?;
        self.switcher.start();
        self.spawn_retention_sweep();
        tracing::info!(
            backends = self.queues.len(),
            "gateway started"
        );
        Ok(())
    }

    /// Tear down in reverse startup order, gracefully stopping any resident
    /// backend last.
    pub async fn shutdown(&self) {
        tracing::info!("gateway shutting down");

        self.switcher.stop().await;

        let sweeper = self.sweeper.lock().take();
        if let Some((token, handle)) = sweeper {
            token.cancel();
            let _ = handle.await;
        }

        self.queues.stop_all().await;

        if let Some(current) = self.manager.current().await {
            if let Err(e) = self.manager.stop(&current, true, None).await {
                tracing::error!(backend = %current, error = %e, "failed to stop resident backend");
            }
        }

        tracing::info!("gateway stopped");
    }

    pub fn manager(&self) -> &Arc<BackendManager> {
        &self.manager
    }

    pub fn queues(&self) -> &Arc<QueueSet<S>> {
        &self.queues
    }

    pub fn switcher(&self) -> &Arc<AutoSwitcher<S>> {
        &self.switcher
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn spawn_retention_sweep(&self) {
        let store = self.store.clone();
        let retention_days = i64::from(self.config.storage.history_retention_days);
        let token = CancellationToken::new();

        let handle = tokio::spawn({
            let token = token.clone();
            async move {
                let mut interval = tokio::time::interval(SWEEP_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let cutoff = Utc::now() - chrono::Duration::days(retention_days);
                            match store.delete_older_than(cutoff).await {
                                Ok(0) => {}
                                Ok(deleted) => {
                                    tracing::info!(deleted, "retention sweep removed old records");
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "retention sweep failed");
                                }
                            }
                        }
                        _ = token.cancelled() => return,
                    }
                }
            }
        });

        if let Some((old_token, old_handle)) = self.sweeper.lock().replace((token, handle)) {
            old_token.cancel();
            old_handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendSettings;
    use crate::lifecycle::{MockHealthProbe, MockLauncher, Resolution};
    use crate::queue::Submission;
    use crate::request::{Priority, Queued, Request, RequestData, RequestId, RequestStatus};
    use crate::storage::InMemoryStore;
    use crate::switcher::InMemoryHistory;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.backends.insert(
            "gemma".to_string(),
            BackendSettings {
                name: "google/gemma-3-12b-it".to_string(),
                port: 8001,
                gpu_memory: 0.85,
                max_model_len: 8192,
                max_concurrent: 2,
                enabled: true,
                resolution_mode: None,
                python_env: None,
            },
        );
        config.backends.insert(
            "deepseek".to_string(),
            BackendSettings {
                name: "deepseek-ai/DeepSeek-OCR".to_string(),
                port: 8002,
                gpu_memory: 0.9,
                max_model_len: 4096,
                max_concurrent: 1,
                enabled: true,
                resolution_mode: Some(Resolution::Large),
                python_env: None,
            },
        );
        config.backends.insert(
            "disabled".to_string(),
            BackendSettings {
                name: "org/disabled".to_string(),
                port: 8003,
                gpu_memory: 0.5,
                max_model_len: 1024,
                max_concurrent: 1,
                enabled: false,
                resolution_mode: None,
                python_env: None,
            },
        );
        config
    }

    fn build(store: Arc<InMemoryStore>) -> (Arc<Gateway<InMemoryStore>>, MockHealthProbe) {
        let probe = MockHealthProbe::new();
        let gateway = Gateway::new(
            test_config(),
            store,
            Arc::new(MockLauncher::new()),
            Arc::new(probe.clone()),
            Arc::new(InMemoryHistory::new()),
        )
        .unwrap();
        (gateway, probe)
    }

    fn submission() -> Submission {
        Submission {
            payload: serde_json::json!({"prompt": "hi"}),
            task_kind: "chat".to_string(),
            client: "c".to_string(),
            priority: Priority::Normal,
            timeout_s: None,
            max_retries: None,
        }
    }

    #[tokio::test]
    async fn gateway_wires_queues_for_enabled_backends_only() {
        let (gateway, _probe) = build(Arc::new(InMemoryStore::new()));
        assert_eq!(gateway.queues().len(), 2);
        assert!(gateway.queues().get("gemma").is_ok());
        assert!(gateway.queues().get("disabled").is_err());
    }

    #[tokio::test]
    async fn full_request_round_trip() {
        let store = Arc::new(InMemoryStore::new());
        let (gateway, probe) = build(store.clone());
        probe.set_healthy(8001);
        gateway.start().await.unwrap();

        let queue = gateway.queues().get("gemma").unwrap();
        let id = queue.enqueue(submission()).await.unwrap();
        let dispatched = queue.dequeue().await.unwrap();
        assert_eq!(dispatched.data.id, id);
        queue
            .complete(id, Some(serde_json::json!({"text": "done"})))
            .await;

        let record = store.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.status, RequestStatus::Completed);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn startup_recovers_persisted_work() {
        let store = Arc::new(InMemoryStore::new());

        // A row a previous process left mid-flight.
        let data = RequestData {
            id: RequestId::new_v4(),
            backend: "gemma".to_string(),
            task_kind: "chat".to_string(),
            client: "orphan".to_string(),
            payload: serde_json::json!({}),
            priority: Priority::Normal,
            created_at: Utc::now() - chrono::Duration::minutes(5),
            timeout_s: 300,
            max_retries: 3,
        };
        let id = data.id;
        let in_flight = Request {
            state: Queued {
                retries: 0,
                last_error: None,
            },
            data,
        }
        .dispatch(Utc::now() - chrono::Duration::minutes(4));
        store.upsert(&in_flight.to_record()).await.unwrap();

        let (gateway, _probe) = build(store);
        gateway.start().await.unwrap();

        let queue = gateway.queues().get("gemma").unwrap();
        assert_eq!(queue.metrics().await.waiting, 1);
        assert_eq!(queue.dequeue().await.unwrap().data.id, id);

        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_resident_backend() {
        let (gateway, probe) = build(Arc::new(InMemoryStore::new()));
        probe.set_healthy(8001);
        gateway.start().await.unwrap();

        assert!(gateway.manager().start("gemma", None).await.unwrap());
        gateway.shutdown().await;
        assert!(gateway.manager().current().await.is_none());
    }
}
