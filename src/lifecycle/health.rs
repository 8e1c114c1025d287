//! Backend health probing.
//!
//! A backend is healthy iff a GET to `/health` on its port returns 200 within
//! a short timeout. The probe is abstracted behind a trait so lifecycle logic
//! is testable without a serving process.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

/// Timeout for a single health probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// True iff the backend on `port` answered healthy.
    async fn check(&self, port: u16) -> bool;
}

/// Production probe using reqwest against the local backend port.
#[derive(Clone, Default)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{port}/health");
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::trace!(port, error = %e, "health probe failed");
                false
            }
        }
    }
}

/// Mock probe for tests: a port is healthy iff marked so.
#[derive(Clone, Default)]
pub struct MockHealthProbe {
    healthy: Arc<RwLock<HashSet<u16>>>,
    checks: Arc<std::sync::atomic::AtomicUsize>,
}

impl MockHealthProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, port: u16) {
        self.healthy.write().insert(port);
    }

    pub fn set_unhealthy(&self, port: u16) {
        self.healthy.write().remove(&port);
    }

    pub fn check_count(&self) -> usize {
        self.checks.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl HealthProbe for MockHealthProbe {
    async fn check(&self, port: u16) -> bool {
        self.checks
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.healthy.read().contains(&port)
    }
}
