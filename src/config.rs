//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` but can be set via the
//! `-f` flag or the `CORRAL_CONFIG` environment variable.
//!
//! ## Loading priority
//!
//! 1. **YAML config file** - base configuration
//! 2. **Environment variables** - `CORRAL_`-prefixed variables override YAML
//!    values; nested fields use double underscores, e.g.
//!    `CORRAL_QUEUE__MAX_WAITING=32`.
//!
//! Validation happens at load time: out-of-range GPU fractions, non-positive
//! bounds, duplicate ports, and resolution modes outside the closed set are
//! all rejected before anything starts.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::lifecycle::{LifecycleTimings, Resolution};
use crate::queue::QueueConfig;

/// Simple CLI args - just for specifying the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "CORRAL_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the gateway.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub queue: QueueSettings,
    pub auto_switch: AutoSwitchSettings,
    pub lifecycle: LifecycleSettings,
    pub storage: StorageSettings,
    /// Backend registry, keyed by backend name.
    pub backends: HashMap<String, BackendSettings>,
}

/// Queue system configuration, shared by every per-backend queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    pub max_waiting: usize,
    pub timeout_s: u32,
    pub max_retries: u32,
    pub priority_enabled: bool,
    /// Crash recovery; turning this off also disables the recovery scan.
    pub persistence_enabled: bool,
    pub recovery_check_interval_s: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_waiting: 10,
            timeout_s: 300,
            max_retries: 3,
            priority_enabled: true,
            persistence_enabled: true,
            recovery_check_interval_s: 60,
        }
    }
}

/// Auto-switching configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoSwitchSettings {
    pub enabled: bool,
    pub pattern_window_days: u32,
    pub min_requests_for_switch: u64,
    pub switch_cooldown_minutes: u64,
}

impl Default for AutoSwitchSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            pattern_window_days: 7,
            min_requests_for_switch: 10,
            switch_cooldown_minutes: 5,
        }
    }
}

/// Lifecycle manager configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleSettings {
    /// Working directory the serving command runs in.
    pub work_dir: PathBuf,
    /// Directory for per-backend server logs.
    pub log_dir: PathBuf,
    pub health_poll_interval_s: u64,
    pub health_wait_timeout_s: u64,
    pub stop_grace_s: u64,
    pub stop_timeout_s: u64,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            log_dir: PathBuf::from("logs"),
            health_poll_interval_s: 2,
            health_wait_timeout_s: 120,
            stop_grace_s: 10,
            stop_timeout_s: 60,
        }
    }
}

/// Persistent store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageSettings {
    /// Queue-state document file.
    pub path: PathBuf,
    /// Terminal rows older than this are swept.
    pub history_retention_days: u32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("corral_state.json"),
            history_retention_days: 15,
        }
    }
}

/// Individual backend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackendSettings {
    /// Model identifier handed to the serving command.
    pub name: String,
    pub port: u16,
    /// GPU memory fraction in (0, 1].
    pub gpu_memory: f64,
    pub max_model_len: u32,
    pub max_concurrent: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Starting resolution mode; present only on the OCR backend.
    #[serde(default)]
    pub resolution_mode: Option<Resolution>,
    /// Python environment activated before serving.
    #[serde(default)]
    pub python_env: Option<PathBuf>,
}

fn default_enabled() -> bool {
    true
}

impl Config {
    /// Load and validate configuration from the file and environment.
    pub fn load(args: &Args) -> Result<Self> {
        let figment = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("CORRAL_").split("__"));

        let config: Config = figment
            .extract()
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |detail: String| Err(GatewayError::InvalidConfig(detail));

        if self.queue.max_waiting == 0 {
            return invalid("queue.max_waiting must be positive".to_string());
        }
        if self.queue.timeout_s == 0 {
            return invalid("queue.timeout_s must be positive".to_string());
        }
        if self.queue.recovery_check_interval_s == 0 {
            return invalid("queue.recovery_check_interval_s must be positive".to_string());
        }
        if self.auto_switch.pattern_window_days == 0 {
            return invalid("auto_switch.pattern_window_days must be positive".to_string());
        }
        if self.auto_switch.min_requests_for_switch == 0 {
            return invalid("auto_switch.min_requests_for_switch must be positive".to_string());
        }
        if self.auto_switch.switch_cooldown_minutes == 0 {
            return invalid("auto_switch.switch_cooldown_minutes must be positive".to_string());
        }

        let mut ports = HashSet::new();
        let mut resolution_capable = 0usize;
        for (backend, settings) in &self.backends {
            if !(settings.gpu_memory > 0.0 && settings.gpu_memory <= 1.0) {
                return invalid(format!(
                    "backend {backend}: gpu_memory must be in (0, 1], got {}",
                    settings.gpu_memory
                ));
            }
            if settings.max_model_len == 0 {
                return invalid(format!("backend {backend}: max_model_len must be positive"));
            }
            if settings.max_concurrent == 0 {
                return invalid(format!("backend {backend}: max_concurrent must be positive"));
            }
            if !ports.insert(settings.port) {
                return invalid(format!(
                    "backend {backend}: port {} is used by another backend",
                    settings.port
                ));
            }
            if settings.resolution_mode.is_some() {
                resolution_capable += 1;
            }
        }
        if resolution_capable > 1 {
            return invalid("at most one backend may carry a resolution_mode".to_string());
        }

        Ok(())
    }

    /// Queue configuration for one backend.
    pub fn queue_config_for(&self, backend: &BackendSettings) -> QueueConfig {
        QueueConfig {
            max_concurrent: backend.max_concurrent as usize,
            max_waiting: self.queue.max_waiting,
            default_timeout_s: self.queue.timeout_s,
            default_max_retries: self.queue.max_retries,
            priority_enabled: self.queue.priority_enabled,
            persistence_enabled: self.queue.persistence_enabled,
            recovery_check_interval: Duration::from_secs(self.queue.recovery_check_interval_s),
        }
    }

    pub fn lifecycle_timings(&self) -> LifecycleTimings {
        LifecycleTimings {
            health_poll_interval: Duration::from_secs(self.lifecycle.health_poll_interval_s),
            health_wait_timeout: Duration::from_secs(self.lifecycle.health_wait_timeout_s),
            stop_grace: Duration::from_secs(self.lifecycle.stop_grace_s),
            stop_timeout: Duration::from_secs(self.lifecycle.stop_timeout_s),
            ..LifecycleTimings::default()
        }
    }
}
