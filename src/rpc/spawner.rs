//! Agent process launching and termination.
//!
//! The real launcher spawns the agent binary with:
//! - `kill_on_drop(true)` so an abandoned session never leaks a process.
//! - `env_clear()` plus an allowlist (and configured pass-through names) so
//!   unrelated host secrets never reach the child.
//! - piped stdin/stdout for the JSON-RPC stream and piped stderr for
//!   diagnostics.
//!
//! Launching sits behind [`AgentLauncher`] so the transport can be driven by
//! in-memory pipes in tests.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::AppServerConfig;
use crate::{AppError, Result};

/// Environment variables always inherited by the agent process.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "RUST_LOG",
    "LANG",
    "TMPDIR",
    "CODEX_HOME",
    "OPENAI_API_KEY",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
];

/// Write half of the agent's stdio.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// Read half of the agent's stdio.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Future returned by [`AgentLauncher::launch`].
pub type LaunchFuture<'a> = Pin<Box<dyn Future<Output = Result<AgentProcess>> + Send + 'a>>;

/// Streams and (optionally) the OS handle of one launched agent.
pub struct AgentProcess {
    /// Agent input (requests, notifications, replies).
    pub stdin: BoxedWriter,
    /// Agent output (responses, notifications, server requests).
    pub stdout: BoxedReader,
    /// Agent diagnostics, when captured.
    pub stderr: Option<BoxedReader>,
    /// OS process handle; `None` for in-memory transports.
    pub child: Option<Child>,
}

impl fmt::Debug for AgentProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentProcess")
            .field("pid", &self.child.as_ref().and_then(Child::id))
            .field("stderr", &self.stderr.is_some())
            .finish_non_exhaustive()
    }
}

/// Produces a fresh agent process each time the transport (re)starts.
pub trait AgentLauncher: Send + Sync {
    /// Launch one agent instance.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Handshake`] when the process cannot be spawned.
    fn launch(&self) -> LaunchFuture<'_>;
}

/// Launcher for a real agent binary.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    command: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env_passthrough: Vec<String>,
}

impl ProcessLauncher {
    /// Build a launcher from app-server settings.
    #[must_use]
    pub fn from_config(config: &AppServerConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            cwd: config.cwd.clone(),
            env_passthrough: config.env_passthrough.clone(),
        }
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);

        cmd.env_clear();
        let names = ALLOWED_ENV_VARS
            .iter()
            .copied()
            .chain(self.env_passthrough.iter().map(String::as_str));
        for key in names {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

impl AgentLauncher for ProcessLauncher {
    fn launch(&self) -> LaunchFuture<'_> {
        Box::pin(async move {
            let mut child = self.build_command().spawn().map_err(|err| {
                AppError::Handshake(format!("failed to spawn agent `{}`: {err}", self.command))
            })?;

            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Handshake("failed to capture agent stdin".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Handshake("failed to capture agent stdout".into()))?;
            let stderr = child.stderr.take();

            info!(command = %self.command, pid = child.id(), "agent process spawned");

            Ok(AgentProcess {
                stdin: Box::new(stdin),
                stdout: Box::new(stdout),
                stderr: stderr.map(|s| Box::new(s) as BoxedReader),
                child: Some(child),
            })
        })
    }
}

/// Stop `child`: graceful termination signal, bounded wait, then kill.
pub async fn terminate(mut child: Child, grace: Duration) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }

    send_terminate(&child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(?status, "agent process exited after termination signal");
        }
        Ok(Err(err)) => {
            warn!(%err, "error waiting for agent process; killing");
            child.kill().await.ok();
        }
        Err(_elapsed) => {
            warn!(?grace, "agent process ignored termination signal; killing");
            child.kill().await.ok();
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!(pid, %err, "SIGTERM delivery failed");
    }
}

#[cfg(not(unix))]
fn send_terminate(_child: &Child) {
    // No portable graceful signal; the bounded wait falls through to kill.
}
