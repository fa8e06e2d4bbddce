//! Error types for the supervisor.
//!
//! Three layers, each with its own enum:
//! - [`ClientError`]: one connection to a daemon
//! - [`ReconnectFailure`]: why an existing daemon could not be adopted
//! - [`ManagerError`]: what the [`SessionManager`](crate::SessionManager) API returns

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use tether_core::{DomainError, ProcessError, SessionId};
use tether_protocol::{FrameType, ProtocolError, ProtocolVersion};

/// Errors raised by a [`SessionClient`](crate::SessionClient).
#[derive(Error, Debug)]
pub enum ClientError {
    /// The socket could not be connected.
    #[error("Failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Connecting or the handshake took longer than allowed.
    #[error("Timed out after {0:?} waiting for the daemon")]
    Timeout(Duration),

    /// The daemon speaks an incompatible protocol major version.
    #[error("Protocol version mismatch: client {ours}, daemon {theirs}")]
    VersionMismatch {
        ours: ProtocolVersion,
        theirs: ProtocolVersion,
    },

    /// The daemon sent something other than the expected handshake frame.
    #[error("Expected {expected} during handshake, got {got}")]
    UnexpectedFrame { expected: FrameType, got: FrameType },

    /// The daemon closed the connection during the handshake.
    #[error("Daemon closed the connection during the handshake")]
    HandshakeClosed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The connection is closed; nothing can be sent.
    #[error("Not connected")]
    NotConnected,
}

/// Why [`reconnect_session`](crate::SessionManager::reconnect_session) refused
/// or failed to adopt a daemon.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconnectFailure {
    /// No process with the recorded pid is running.
    #[error("Daemon process {pid} is not running")]
    ProcessDead { pid: u32 },

    /// The pid now belongs to a different process.
    #[error("Pid {pid} was reused (start time {expected} expected, found {actual})")]
    PidReused { pid: u32, expected: u64, actual: u64 },

    /// The socket path is missing, not a socket, or unreadable.
    #[error("Invalid socket {path}: {reason}")]
    SocketInvalid { path: PathBuf, reason: String },

    /// The daemon is alive but connecting failed; worth retrying.
    #[error("Failed to connect to {path}: {reason}")]
    ConnectFailed { path: PathBuf, reason: String },
}

impl ReconnectFailure {
    /// Short machine-friendly label, used as the `reason` log field.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ProcessDead { .. } => "process_dead",
            Self::PidReused { .. } => "pid_reused",
            Self::SocketInvalid { .. } => "socket_invalid",
            Self::ConnectFailed { .. } => "connect_failed",
        }
    }

    /// Only a failed connection to a live daemon is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectFailed { .. })
    }
}

/// Errors returned by the session manager.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// `tetherd` could not be started or never became ready.
    ///
    /// `stderr` holds whatever the daemon wrote before it failed.
    #[error("Failed to start session {session_id}: {reason}")]
    SpawnFailed {
        session_id: SessionId,
        reason: String,
        stderr: Vec<String>,
    },

    #[error("Failed to reconnect session {session_id}: {failure}")]
    Reconnect {
        session_id: SessionId,
        failure: ReconnectFailure,
    },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Failed to scan socket directory {path}: {source}")]
    SocketDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manager actor has stopped.
    #[error("Session manager has shut down")]
    ChannelClosed,
}

impl ManagerError {
    /// Captured daemon stderr, if this error carries any.
    pub fn stderr(&self) -> &[String] {
        match self {
            Self::SpawnFailed { stderr, .. } => stderr,
            _ => &[],
        }
    }
}
