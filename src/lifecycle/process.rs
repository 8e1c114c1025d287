//! Child-process ownership for backend servers.
//!
//! The lifecycle manager is the only component that touches backend child
//! processes. Spawning is abstracted behind [`Launcher`] so the manager can be
//! exercised in tests without a GPU or a vLLM installation, mirroring the
//! health-probe abstraction.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{GatewayError, Result};

use super::Resolution;

/// Everything needed to launch one backend serving process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Backend name (registry key).
    pub backend: String,
    /// Model identifier handed to the serving command.
    pub model: String,
    pub port: u16,
    pub gpu_memory: f64,
    pub max_model_len: u32,
    pub max_concurrent: u32,
    /// OCR resolution mode; `None` for backends without one.
    pub resolution: Option<Resolution>,
    /// Python environment to activate before serving.
    pub python_env: Option<PathBuf>,
    /// Per-backend log file the child's output is appended to.
    pub log_path: PathBuf,
}

/// Exclusive handle to one running backend child process.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// True if the child has already exited.
    fn has_exited(&mut self) -> bool;

    /// Send the polite termination signal.
    async fn terminate(&mut self) -> Result<()>;

    /// Wait for the child to exit.
    async fn wait(&mut self) -> Result<()>;

    /// Force-kill the child and reap it.
    async fn kill(&mut self) -> Result<()>;
}

/// Spawns backend serving processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Launches backends with `vllm serve` inside their Python environment.
pub struct VllmLauncher {
    work_dir: PathBuf,
}

impl VllmLauncher {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn command_line(&self, spec: &LaunchSpec) -> String {
        let mut line = String::new();
        if let Some(env) = &spec.python_env {
            line.push_str(&format!("source {}/bin/activate && ", env.display()));
        }
        line.push_str(&format!(
            "exec vllm serve {} --host 0.0.0.0 --port {} \
             --gpu-memory-utilization {} --max-model-len {} --max-num-seqs {}",
            spec.model, spec.port, spec.gpu_memory, spec.max_model_len, spec.max_concurrent
        ));
        line
    }
}

#[async_trait]
impl Launcher for VllmLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        if let Some(parent) = spec.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)?;

        let mut command = tokio::process::Command::new("bash");
        command
            .arg("-c")
            .arg(self.command_line(spec))
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true);

        // The restart is authoritative for the resolution mode; the serving
        // process reads it from the environment.
        if let Some(resolution) = spec.resolution {
            command.env("OCR_RESOLUTION", resolution.to_string());
        }

        let child = command
            .spawn()
            .map_err(|e| GatewayError::Spawn(format!("{}: {e}", spec.backend)))?;

        tracing::info!(
            backend = %spec.backend,
            port = spec.port,
            pid = child.id(),
            "spawned backend process"
        );

        Ok(Box::new(ServerProcess { child }))
    }
}

/// Handle to a real OS child process.
pub struct ServerProcess {
    child: tokio::process::Child,
}

#[async_trait]
impl ProcessHandle for ServerProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    async fn terminate(&mut self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.child.id() {
                return kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                    .map_err(|e| GatewayError::Internal(format!("SIGTERM failed: {e}")));
            }
        }

        // No pid (already reaped) or no signal support: force path.
        self.child.start_kill()?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        self.child.wait().await?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.child.kill().await?;
        Ok(())
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

#[derive(Debug, Default)]
pub struct MockProcessState {
    pub terminated: bool,
    pub killed: bool,
    pub exited: bool,
    /// When set, the polite signal is swallowed and the process only dies on
    /// `kill`, exercising the force-kill path.
    pub ignore_terminate: bool,
}

/// Mock launcher recording every launch and handing out scriptable processes.
#[derive(Clone, Default)]
pub struct MockLauncher {
    launches: Arc<Mutex<Vec<LaunchSpec>>>,
    processes: Arc<Mutex<Vec<Arc<Mutex<MockProcessState>>>>>,
    fail_next: Arc<Mutex<bool>>,
    ignore_terminate: Arc<Mutex<bool>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `launch` call fail with a spawn error.
    pub fn fail_next_launch(&self) {
        *self.fail_next.lock() = true;
    }

    /// Subsequently launched processes ignore the polite termination signal.
    pub fn ignore_terminate(&self) {
        *self.ignore_terminate.lock() = true;
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.launches.lock().clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    pub fn last_process(&self) -> Option<Arc<Mutex<MockProcessState>>> {
        self.processes.lock().last().cloned()
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            return Err(GatewayError::Spawn(format!("{}: mock spawn failure", spec.backend)));
        }

        self.launches.lock().push(spec.clone());
        let state = Arc::new(Mutex::new(MockProcessState {
            ignore_terminate: *self.ignore_terminate.lock(),
            ..Default::default()
        }));
        self.processes.lock().push(state.clone());
        Ok(Box::new(MockProcess { state }))
    }
}

pub struct MockProcess {
    state: Arc<Mutex<MockProcessState>>,
}

#[async_trait]
impl ProcessHandle for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn has_exited(&mut self) -> bool {
        self.state.lock().exited
    }

    async fn terminate(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.terminated = true;
        if !state.ignore_terminate {
            state.exited = true;
        }
        Ok(())
    }

    async fn wait(&mut self) -> Result<()> {
        loop {
            if self.state.lock().exited {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn kill(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.killed = true;
        state.exited = true;
        Ok(())
    }
}
