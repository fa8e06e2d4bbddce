//! The `tetherd` process contract.
//!
//! `tetherd '<json>'` binds the session socket, starts the process on a pty,
//! writes the identity sidecar and prints exactly one line to stdout:
//!
//! ```text
//! {"pid":12345,"startTime":987654}
//! ```
//!
//! after which stdout points at `/dev/null`. Diagnostics go to stderr.
//! SIGTERM and SIGINT stop the daemon and remove the socket and sidecar;
//! SIGHUP is ignored.

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tether_core::ring_buffer::DEFAULT_REPLAY_LINES;
use tether_core::{sidecar, ProcessIdentity};

use crate::daemon::listener::{bind_socket, remove_if_socket};
use crate::daemon::{DaemonConfig, DaemonError, SessionDaemon};
use crate::pty::{NativePtySpawner, PtySpawner, SpawnSpec, TermSize};

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Configuration passed as the single argument of `tetherd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    pub socket_path: PathBuf,
    #[serde(default)]
    pub keep_alive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_lines: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_linger_ms: Option<u64>,
}

impl BootstrapConfig {
    pub fn from_json(raw: &str) -> Result<Self, BootstrapError> {
        serde_json::from_str(raw).map_err(BootstrapError::Config)
    }

    pub fn spawn_spec(&self) -> SpawnSpec {
        SpawnSpec {
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        }
    }

    pub fn daemon_config(&self, identity: ProcessIdentity) -> DaemonConfig {
        let mut config = DaemonConfig::new(self.spawn_spec(), TermSize::new(self.cols, self.rows))
            .keep_alive(self.keep_alive)
            .replay_lines(self.replay_lines.unwrap_or(DEFAULT_REPLAY_LINES));
        if let Some(ms) = self.exit_linger_ms {
            config = config.exit_linger(Duration::from_millis(ms));
        }
        config.identity = identity;
        config
    }
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Invalid configuration: {0}")]
    Config(#[source] serde_json::Error),

    #[error("Cannot read own process identity")]
    Identity,

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error("Failed to write identity sidecar for {path}: {source}")]
    Sidecar {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to announce readiness on stdout: {0}")]
    Announce(#[source] std::io::Error),

    #[error("Failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

/// Runs a daemon on a real pty until it stops.
pub async fn run(config: BootstrapConfig) -> Result<(), BootstrapError> {
    run_with_spawner(config, Arc::new(NativePtySpawner::new())).await
}

/// Runs a daemon with the given pty backend until it stops.
pub async fn run_with_spawner(
    config: BootstrapConfig,
    spawner: Arc<dyn PtySpawner>,
) -> Result<(), BootstrapError> {
    let socket_path = config.socket_path.clone();
    let identity = ProcessIdentity::current().ok_or(BootstrapError::Identity)?;

    // Handlers go in before readiness is announced so an early SIGTERM still
    // cleans up.
    let signals = ShutdownSignals::install()?;

    let listener = bind_socket(&socket_path)?;

    let daemon = match SessionDaemon::start(config.daemon_config(identity), spawner) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(command = %config.command, error = %e, "failed to start session");
            remove_if_socket(&socket_path);
            return Err(e.into());
        }
    };

    let ready = sidecar::write(&socket_path, &identity)
        .map_err(|source| BootstrapError::Sidecar {
            path: socket_path.clone(),
            source,
        })
        .and_then(|_| announce_ready(&identity));
    if let Err(e) = ready {
        daemon.shutdown();
        daemon.serve(listener).await;
        cleanup(&socket_path);
        return Err(e);
    }

    info!(
        pid = identity.pid,
        socket = %socket_path.display(),
        command = %config.command,
        "daemon ready"
    );

    let watcher = tokio::spawn(signals.watch(daemon.shutdown_token()));
    daemon.serve(listener).await;
    watcher.abort();

    cleanup(&socket_path);
    info!("daemon exiting");
    Ok(())
}

fn cleanup(socket_path: &Path) {
    remove_if_socket(socket_path);
    sidecar::remove(socket_path);
}

/// Prints the readiness line and detaches stdout.
fn announce_ready(identity: &ProcessIdentity) -> Result<(), BootstrapError> {
    let line = serde_json::to_string(identity)
        .map_err(|e| BootstrapError::Announce(std::io::Error::other(e)))?;
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{line}").map_err(BootstrapError::Announce)?;
        stdout.flush().map_err(BootstrapError::Announce)?;
    }
    redirect_stdout_to_null().map_err(BootstrapError::Announce)
}

fn redirect_stdout_to_null() -> std::io::Result<()> {
    let devnull = std::fs::OpenOptions::new().write(true).open("/dev/null")?;
    // SAFETY: both descriptors are valid; dup2 atomically replaces fd 1.
    let rc = unsafe { libc::dup2(devnull.as_raw_fd(), libc::STDOUT_FILENO) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

struct ShutdownSignals {
    term: Signal,
    int: Signal,
    hup: Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self, BootstrapError> {
        Ok(Self {
            term: signal(SignalKind::terminate()).map_err(BootstrapError::Signals)?,
            int: signal(SignalKind::interrupt()).map_err(BootstrapError::Signals)?,
            hup: signal(SignalKind::hangup()).map_err(BootstrapError::Signals)?,
        })
    }

    async fn watch(mut self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = self.term.recv() => {
                    info!("received SIGTERM");
                    break;
                }
                _ = self.int.recv() => {
                    info!("received SIGINT");
                    break;
                }
                _ = self.hup.recv() => {
                    info!("received SIGHUP, ignoring");
                }
            }
        }
        shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = BootstrapConfig::from_json(r#"{"command":"bash","socketPath":"/tmp/x.sock"}"#)
            .unwrap();
        assert_eq!(config.cols, 80);
        assert_eq!(config.rows, 24);
        assert!(!config.keep_alive);
        assert!(config.args.is_empty());

        let daemon = config.daemon_config(ProcessIdentity::new(1, 2));
        assert_eq!(daemon.replay_lines, DEFAULT_REPLAY_LINES);
        assert_eq!(daemon.identity, ProcessIdentity::new(1, 2));
    }

    #[test]
    fn test_config_full() {
        let raw = r#"{
            "command": "sh",
            "args": ["-c", "echo hi"],
            "cwd": "/tmp",
            "env": {"FOO": "bar"},
            "cols": 132,
            "rows": 43,
            "socketPath": "/run/tether/a.sock",
            "keepAlive": true,
            "replayLines": 50,
            "exitLingerMs": 100
        }"#;
        let config = BootstrapConfig::from_json(raw).unwrap();
        let daemon = config.daemon_config(ProcessIdentity::new(1, 2));
        assert!(daemon.keep_alive);
        assert_eq!(daemon.size, TermSize::new(132, 43));
        assert_eq!(daemon.replay_lines, 50);
        assert_eq!(daemon.exit_linger, Duration::from_millis(100));
        assert_eq!(daemon.spec.env.get("FOO").map(String::as_str), Some("bar"));
    }

    #[test]
    fn test_config_rejects_missing_socket() {
        assert!(matches!(
            BootstrapConfig::from_json(r#"{"command":"bash"}"#),
            Err(BootstrapError::Config(_))
        ));
    }
}
