//! Starting `tetherd`.
//!
//! The daemon runs in its own session (`setsid`) so terminal signals aimed
//! at the supervisor never reach it. It is not waited on: once it prints its
//! `{pid, startTime}` line it is on its own, and its stderr keeps flowing into
//! a [`StderrTail`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tether_core::process::kill_gracefully;
use tether_core::{sidecar, ProcessIdentity, SessionId, StderrTail};

use super::sockets::remove_if_socket;
use crate::error::ManagerError;

/// How long a daemon that failed to start gets to exit after being killed.
const ABORT_WAIT: Duration = Duration::from_secs(1);

/// How long to wait for the last stderr bytes after the daemon is gone.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// The single JSON argument `tetherd` expects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DaemonArgs {
    pub command: String,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub cols: u16,
    pub rows: u16,
    pub socket_path: PathBuf,
    pub keep_alive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_lines: Option<usize>,
}

/// A daemon that announced readiness.
#[derive(Debug)]
pub(crate) struct SpawnedDaemon {
    pub child: Child,
    pub identity: ProcessIdentity,
    pub stderr: Arc<Mutex<StderrTail>>,
    stderr_pump: JoinHandle<()>,
}

impl SpawnedDaemon {
    /// Stops a daemon that started but could not be used, removes its socket
    /// and returns what it wrote to stderr.
    pub async fn abort(mut self, socket_path: &Path) -> Vec<String> {
        if let Err(e) = kill_gracefully(self.identity.pid, ABORT_WAIT).await {
            warn!(pid = self.identity.pid, error = %e, "failed to stop daemon");
        }
        let _ = timeout(ABORT_WAIT, self.child.wait()).await;
        let _ = timeout(STDERR_DRAIN, self.stderr_pump).await;
        remove_if_socket(socket_path).await;
        sidecar::remove(socket_path);
        snapshot(&self.stderr)
    }
}

/// Runs `binary '<args>'` and waits up to `startup_timeout` for readiness.
pub(crate) async fn spawn_daemon(
    session_id: &SessionId,
    binary: &Path,
    args: &DaemonArgs,
    startup_timeout: Duration,
) -> Result<SpawnedDaemon, ManagerError> {
    let failed = |reason: String, stderr: Vec<String>| ManagerError::SpawnFailed {
        session_id: session_id.clone(),
        reason,
        stderr,
    };

    let json = serde_json::to_string(args).map_err(|e| failed(e.to_string(), Vec::new()))?;

    let mut command = Command::new(binary);
    command
        .arg(json)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);
    // SAFETY: setsid is async-signal-safe and only affects the child.
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = command.spawn().map_err(|e| {
        failed(
            format!("failed to execute {}: {e}", binary.display()),
            Vec::new(),
        )
    })?;
    let child_pid = child.id();
    debug!(session_id = %session_id, pid = ?child_pid, binary = %binary.display(), "daemon spawned");

    let stderr = Arc::new(Mutex::new(StderrTail::default()));
    let stderr_pump = match child.stderr.take() {
        Some(pipe) => tokio::spawn(pump_stderr(pipe, Arc::clone(&stderr))),
        None => tokio::spawn(async {}),
    };

    let ready = match child.stdout.take() {
        Some(stdout) => read_ready_line(stdout, startup_timeout).await,
        None => Err("daemon stdout is not captured".to_string()),
    };
    let ready = ready.and_then(|identity| match child_pid {
        Some(pid) if pid != identity.pid => Err(format!(
            "daemon announced pid {}, but spawned pid is {pid}",
            identity.pid
        )),
        _ => Ok(identity),
    });

    match ready {
        Ok(identity) => {
            info!(
                session_id = %session_id,
                pid = identity.pid,
                start_time = identity.start_time,
                "daemon ready"
            );
            Ok(SpawnedDaemon {
                child,
                identity,
                stderr,
                stderr_pump,
            })
        }
        Err(mut reason) => {
            let _ = child.start_kill();
            if let Ok(Ok(status)) = timeout(ABORT_WAIT, child.wait()).await {
                reason = format!("{reason} ({status})");
            }
            let _ = timeout(STDERR_DRAIN, stderr_pump).await;
            let stderr = snapshot(&stderr);
            warn!(session_id = %session_id, reason = %reason, stderr_lines = stderr.len(), "daemon failed to start");
            Err(failed(reason, stderr))
        }
    }
}

async fn read_ready_line(
    stdout: tokio::process::ChildStdout,
    limit: Duration,
) -> Result<ProcessIdentity, String> {
    let mut lines = BufReader::new(stdout).lines();
    match timeout(limit, lines.next_line()).await {
        Ok(Ok(Some(line))) => serde_json::from_str(line.trim())
            .map_err(|e| format!("invalid readiness line {line:?}: {e}")),
        Ok(Ok(None)) => Err("daemon exited before announcing readiness".to_string()),
        Ok(Err(e)) => Err(format!("failed to read readiness line: {e}")),
        Err(_) => Err(format!("no readiness line within {limit:?}")),
    }
}

async fn pump_stderr(mut pipe: ChildStderr, tail: Arc<Mutex<StderrTail>>) {
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let mut tail = tail.lock().unwrap_or_else(|p| p.into_inner());
                tail.push(buf.get(..n).unwrap_or_default());
            }
        }
    }
}

/// Current contents of a stderr tail.
pub(crate) fn snapshot(tail: &Mutex<StderrTail>) -> Vec<String> {
    tail.lock().unwrap_or_else(|p| p.into_inner()).lines()
}
