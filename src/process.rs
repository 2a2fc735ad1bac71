//! Companion process lifecycle
//!
//! Owns long-running processes the node depends on (the radio stack) so
//! they can be restarted when the network underneath changes.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::ProcessError;
use crate::peer::RestartHook;

/// Registered name of the radio-stack daemon
pub const RADIO_STACK: &str = "radio-stack";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    /// From a `[program, args...]` list; `None` when empty
    pub fn from_command(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Stopped,
    Exited,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub restarts: u32,
}

struct ManagedProcess {
    spec: ProcessSpec,
    child: Option<Child>,
    restarts: u32,
}

pub struct ProcessManager {
    processes: Mutex<HashMap<String, ManagedProcess>>,
    restart_pause: Duration,
    /// How long a process gets to exit after SIGTERM before it is killed
    stop_grace: Duration,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::with_restart_pause(Duration::from_secs(1))
    }

    pub fn with_restart_pause(restart_pause: Duration) -> Self {
        Self {
            processes: Mutex::new(HashMap::new()),
            restart_pause,
            stop_grace: Duration::from_secs(5),
        }
    }

    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    /// Register (or replace the spec of) a named process without starting it
    pub async fn register(&self, name: &str, spec: ProcessSpec) {
        let mut processes = self.processes.lock().await;
        processes
            .entry(name.to_string())
            .and_modify(|p| p.spec = spec.clone())
            .or_insert(ManagedProcess {
                spec,
                child: None,
                restarts: 0,
            });
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.processes.lock().await.contains_key(name)
    }

    /// Start the process if it is not already running; returns its pid
    pub async fn start(&self, name: &str) -> Result<Option<u32>, ProcessError> {
        let mut processes = self.processes.lock().await;
        let process = processes
            .get_mut(name)
            .ok_or_else(|| ProcessError::Unknown(name.to_string()))?;

        if let Some(child) = process.child.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(child.id());
            }
        }

        let child = Command::new(&process.spec.program)
            .args(&process.spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                name: name.to_string(),
                source,
            })?;

        let pid = child.id();
        info!(process = name, pid = ?pid, program = %process.spec.program, "Process started");
        process.child = Some(child);
        Ok(pid)
    }

    /// Stop the process and wait for it to exit: SIGTERM first, SIGKILL if
    /// it is still running after the grace period. Stopping a process that
    /// is not running is fine.
    pub async fn stop(&self, name: &str) -> Result<(), ProcessError> {
        let mut processes = self.processes.lock().await;
        let process = processes
            .get_mut(name)
            .ok_or_else(|| ProcessError::Unknown(name.to_string()))?;

        let Some(mut child) = process.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            info!(process = name, code = ?status.code(), "Process had already exited");
            return Ok(());
        }

        let stop_error = |source| ProcessError::Stop {
            name: name.to_string(),
            source,
        };

        if terminate(&child) {
            match tokio::time::timeout(self.stop_grace, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(process = name, code = ?status.code(), "Process stopped");
                    return Ok(());
                }
                Ok(Err(source)) => return Err(stop_error(source)),
                Err(_) => {
                    warn!(
                        process = name,
                        grace_ms = self.stop_grace.as_millis() as u64,
                        "Process ignored SIGTERM, killing"
                    );
                }
            }
        }

        child.kill().await.map_err(stop_error)?;
        info!(process = name, "Process killed");
        Ok(())
    }

    /// Stop, pause, start
    pub async fn restart(&self, name: &str) -> Result<Option<u32>, ProcessError> {
        self.stop(name).await?;
        tokio::time::sleep(self.restart_pause).await;
        let pid = self.start(name).await?;

        if let Some(process) = self.processes.lock().await.get_mut(name) {
            process.restarts += 1;
        }
        Ok(pid)
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.processes.lock().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!(process = %name, error = %e, "Failed to stop process");
            }
        }
    }

    pub async fn info(&self, name: &str) -> Option<ProcessInfo> {
        let mut processes = self.processes.lock().await;
        let process = processes.get_mut(name)?;

        let (status, pid, exit_code) = match process.child.as_mut() {
            None => (ProcessStatus::Stopped, None, None),
            Some(child) => match child.try_wait() {
                Ok(None) => (ProcessStatus::Running, child.id(), None),
                Ok(Some(exit)) => (ProcessStatus::Exited, None, exit.code()),
                Err(_) => (ProcessStatus::Exited, None, None),
            },
        };

        Some(ProcessInfo {
            name: name.to_string(),
            pid,
            status,
            exit_code,
            restarts: process.restarts,
        })
    }
}

/// Send SIGTERM; `false` when it could not be delivered
#[cfg(target_os = "linux")]
fn terminate(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // pid belongs to a child we own and have not reaped yet
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(target_os = "linux"))]
fn terminate(_child: &Child) -> bool {
    false
}

/// Restart hook that restarts `name`, or only logs when nothing is
/// registered under it
pub fn restart_hook(manager: Arc<ProcessManager>, name: &'static str) -> RestartHook {
    Arc::new(move || {
        let manager = manager.clone();
        async move {
            if !manager.is_registered(name).await {
                info!(process = name, "No process configured, skipping restart");
                return;
            }
            if let Err(e) = manager.restart(name).await {
                warn!(process = name, error = %e, "Restart failed");
            }
        }
        .boxed()
    })
}
