//! Session identifiers and lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Maximum length of a session id.
///
/// The id doubles as the socket file stem, and Unix socket paths are limited
/// to ~108 bytes, so ids are kept short.
pub const MAX_SESSION_ID_LEN: usize = 64;

/// Unique identifier for a persistent session.
///
/// Used as the key of the manager's session table and as the file stem of the
/// session's socket (`<socket_dir>/<id>.sock`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a new SessionId from a string without validation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Creates a SessionId, rejecting values that are unsafe as a file name.
    ///
    /// Only ASCII alphanumerics, `-` and `_` are accepted so the id can never
    /// introduce a path separator or `..` component into a socket path.
    pub fn parse(id: impl Into<String>) -> DomainResult<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(DomainError::InvalidSessionId {
                value: id,
                reason: "empty".to_string(),
            });
        }

        if id.len() > MAX_SESSION_ID_LEN {
            return Err(DomainError::InvalidSessionId {
                reason: format!("longer than {MAX_SESSION_ID_LEN} bytes"),
                value: id,
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DomainError::InvalidSessionId {
                value: id,
                reason: "only [A-Za-z0-9_-] allowed".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of this session's socket.
    pub fn socket_file_name(&self) -> String {
        format!("{}.sock", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Lifecycle state of a managed session, as seen by the supervisor.
///
/// ```text
/// Connected -> (Disconnected <-> Reconnecting) -> Exited | Killed
///     ^  |
///     |  v  exit with restarts left
///   Starting
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The process exited and a restart is scheduled but not yet sent
    Starting,
    /// Client attached and receiving output
    Connected,
    /// Client lost its connection; daemon may still be alive
    Disconnected,
    /// A reconnection attempt is in flight
    Reconnecting,
    /// The foreground process exited and will not be restarted
    Exited,
    /// The session was torn down with `kill_session`
    Killed,
}

impl SessionState {
    /// Returns true if the session can no longer produce output.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Killed)
    }

    /// Returns a short lowercase label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Exited => "exited",
            Self::Killed => "killed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
