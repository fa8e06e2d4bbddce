//! Adopting a running daemon.
//!
//! Before connecting, the recorded identity is checked against `/proc` and
//! the socket path is checked with `lstat`. After the handshake the daemon's
//! own report of its identity must match.

use std::io::ErrorKind;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use tether_core::{IdentityCheck, ProcessIdentity, SessionId};

use super::commands::Connection;
use crate::client::SessionClient;
use crate::config::ManagerConfig;
use crate::error::ReconnectFailure;

/// Retry schedule for automatic reconnection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Backoff {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Backoff {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            attempts: config.reconnect_attempts.max(1),
            initial_delay: config.reconnect_initial_delay(),
            max_delay: config.reconnect_max_delay(),
            multiplier: config.reconnect_multiplier,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        let next_ms = (delay.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay)
    }
}

/// Verifies the daemon behind `socket_path` is `expected` and connects to it.
pub(crate) async fn verify_and_connect(
    socket_path: &Path,
    expected: ProcessIdentity,
    connect_timeout: Duration,
) -> Result<Connection, ReconnectFailure> {
    match expected.check() {
        IdentityCheck::Alive => {}
        IdentityCheck::Dead => return Err(ReconnectFailure::ProcessDead { pid: expected.pid }),
        IdentityCheck::PidReused { current_start_time } => {
            return Err(ReconnectFailure::PidReused {
                pid: expected.pid,
                expected: expected.start_time,
                actual: current_start_time,
            })
        }
    }

    check_socket(socket_path).await?;

    let (client, welcome, events) = SessionClient::connect(socket_path, connect_timeout)
        .await
        .map_err(|e| ReconnectFailure::ConnectFailed {
            path: socket_path.to_path_buf(),
            reason: e.to_string(),
        })?;

    if welcome.pid != expected.pid {
        return Err(ReconnectFailure::SocketInvalid {
            path: socket_path.to_path_buf(),
            reason: format!(
                "served by pid {}, expected pid {}",
                welcome.pid, expected.pid
            ),
        });
    }
    if welcome.start_time != expected.start_time {
        return Err(ReconnectFailure::PidReused {
            pid: expected.pid,
            expected: expected.start_time,
            actual: welcome.start_time,
        });
    }

    Ok(Connection {
        client,
        welcome,
        events,
    })
}

async fn check_socket(path: &Path) -> Result<(), ReconnectFailure> {
    let invalid = |reason: String| ReconnectFailure::SocketInvalid {
        path: path.to_path_buf(),
        reason,
    };
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.file_type().is_symlink() => Err(invalid("is a symlink".to_string())),
        Ok(meta) if !meta.file_type().is_socket() => Err(invalid("not a socket".to_string())),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(invalid("missing".to_string())),
        Err(e) => Err(invalid(format!("lstat failed: {e}"))),
    }
}

/// [`verify_and_connect`] with exponential backoff on retryable failures.
pub(crate) async fn reconnect_with_backoff(
    session_id: &SessionId,
    socket_path: &Path,
    expected: ProcessIdentity,
    connect_timeout: Duration,
    backoff: Backoff,
) -> Result<Connection, ReconnectFailure> {
    let mut delay = backoff.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        debug!(session_id = %session_id, attempt, "attempting to reconnect");

        match verify_and_connect(socket_path, expected, connect_timeout).await {
            Ok(connection) => return Ok(connection),
            Err(failure) if failure.is_retryable() && attempt < backoff.attempts => {
                debug!(
                    session_id = %session_id,
                    attempt,
                    reason = failure.reason(),
                    error = %failure,
                    "reconnect attempt failed"
                );
                sleep(delay).await;
                delay = backoff.next_delay(delay);
            }
            Err(failure) => return Err(failure),
        }
    }
}
