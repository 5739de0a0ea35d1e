//! Start/stop primitives for backend processes.
use crate::command::LaunchCommand;
use crate::descriptor::ProcessSlot;
use crate::errors::OrchestratorError;
use async_trait::async_trait;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Bounds applied while stopping a backend.
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    /// Upper bound for the configured stop command
    pub command_timeout: Duration,
    /// Time between SIGTERM and SIGKILL
    pub grace: Duration,
}

/// Process lifecycle operations used by the orchestrator.
///
/// The slot passed in is owned by the orchestrator and only ever touched while it holds
/// its gate.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Ensure a process is running for `backend`.
    ///
    /// Returns `Ok(true)` when a process is running afterwards, either freshly spawned or
    /// still alive from an earlier call, and `Ok(false)` when there is nothing to launch.
    async fn start(
        &self,
        backend: &str,
        slot: &mut ProcessSlot,
        launch: Option<&LaunchCommand>,
    ) -> Result<bool, OrchestratorError>;

    /// Best-effort stop. A no-op unless a live process is tracked in `slot`. Failures are
    /// logged, never returned.
    async fn stop(
        &self,
        backend: &str,
        slot: &mut ProcessSlot,
        stop_command: Option<&LaunchCommand>,
        policy: StopPolicy,
    );

    /// Stop a backend that was started outside this supervisor. Only the stop command can
    /// reach such a process; it is bounded like in [`ProcessSupervisor::stop`].
    async fn stop_external(&self, backend: &str, stop_command: &LaunchCommand, policy: StopPolicy);

    /// Whether the process tracked for `backend` is still alive.
    fn is_running(&self, backend: &str, slot: &mut ProcessSlot) -> bool;
}

/// Supervisor that spawns real OS processes.
#[derive(Debug, Default, Clone)]
pub struct OsSupervisor;

impl OsSupervisor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessSupervisor for OsSupervisor {
    async fn start(
        &self,
        backend: &str,
        slot: &mut ProcessSlot,
        launch: Option<&LaunchCommand>,
    ) -> Result<bool, OrchestratorError> {
        if slot.is_alive() {
            info!(backend = %backend, pid = ?slot.pid(), "Backend process already running");
            return Ok(true);
        }

        let Some(launch) = launch else {
            warn!(backend = %backend, "No start command configured, not launching");
            return Ok(false);
        };

        info!(backend = %backend, command = %launch, "Starting backend process");

        let child = Command::new(&launch.program)
            .args(&launch.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| OrchestratorError::SpawnFailed {
                backend: backend.to_string(),
                reason: e.to_string(),
            })?;

        debug!(backend = %backend, pid = ?child.id(), "Backend process spawned");
        slot.set(child);
        Ok(true)
    }

    async fn stop(
        &self,
        backend: &str,
        slot: &mut ProcessSlot,
        stop_command: Option<&LaunchCommand>,
        policy: StopPolicy,
    ) {
        if !slot.is_alive() {
            debug!(backend = %backend, "Nothing to stop");
            return;
        }

        info!(backend = %backend, pid = ?slot.pid(), "Stopping backend");

        if let Some(command) = stop_command {
            run_stop_command(backend, command, policy.command_timeout).await;
        }

        if let Some(child) = slot.take() {
            match shutdown_child(child, policy.grace).await {
                Ok(status) => info!(backend = %backend, status = %status, "Backend stopped"),
                Err(e) => warn!(backend = %backend, error = %e, "Failed to stop backend process"),
            }
        }
    }

    async fn stop_external(&self, backend: &str, stop_command: &LaunchCommand, policy: StopPolicy) {
        info!(backend = %backend, "Stopping externally started backend");
        run_stop_command(backend, stop_command, policy.command_timeout).await;
    }

    fn is_running(&self, _backend: &str, slot: &mut ProcessSlot) -> bool {
        slot.is_alive()
    }
}

async fn run_stop_command(backend: &str, command: &LaunchCommand, limit: Duration) {
    debug!(backend = %backend, command = %command, "Running stop command");

    let status = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();

    match tokio::time::timeout(limit, status).await {
        Ok(Ok(status)) if status.success() => {}
        Ok(Ok(status)) => {
            warn!(backend = %backend, status = %status, "Stop command exited unsuccessfully")
        }
        Ok(Err(e)) => warn!(backend = %backend, error = %e, "Failed to run stop command"),
        Err(_) => warn!(backend = %backend, timeout = ?limit, "Stop command timed out"),
    }
}

/// Terminate a child with SIGTERM, escalate to SIGKILL after `grace`, and reap it.
pub async fn shutdown_child(mut child: Child, grace: Duration) -> io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        shutdown_unix(&mut child, grace).await
    }

    #[cfg(not(unix))]
    {
        let _ = grace;
        child.kill().await?;
        child.wait().await
    }
}

#[cfg(unix)]
async fn shutdown_unix(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    // Already reaped
    let Some(pid) = child.id() else {
        return child.wait().await;
    };
    let pid = i32::try_from(pid).map_err(io::Error::other)?;

    if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        if e == Errno::ESRCH {
            return child.wait().await;
        }
        return Err(io::Error::other(e));
    }

    if let Ok(result) = tokio::time::timeout(grace, child.wait()).await {
        return result;
    }

    warn!(pid, grace = ?grace, "Process ignored SIGTERM, sending SIGKILL");
    child.kill().await?;
    child.wait().await
}
