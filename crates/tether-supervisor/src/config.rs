//! Supervisor configuration.
//!
//! Every field is optional in TOML; missing fields take their defaults.
//!
//! ```toml
//! socket_dir = "/run/user/1000/tether"
//! kill_grace_ms = 3000
//!
//! [default_restart_policy]
//! enabled = true
//! maxRestarts = 3
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tether_core::{DomainError, RestartPolicy, SessionId};

/// Environment variable overriding the default socket directory.
pub const SOCKET_DIR_ENV: &str = "TETHER_SOCKET_DIR";

/// Name of the daemon executable.
pub const DAEMON_BINARY_NAME: &str = "tetherd";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] DomainError),
}

/// Settings for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Directory holding `<id>.sock` and `<id>.pid`.
    pub socket_dir: PathBuf,

    /// Explicit `tetherd` path. See [`ManagerConfig::daemon_binary`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon_binary: Option<PathBuf>,

    pub kill_grace_ms: u64,
    pub startup_timeout_ms: u64,
    pub connect_timeout_ms: u64,

    /// Applied when `create_session` is not given a policy.
    pub default_restart_policy: RestartPolicy,

    /// Reconnect automatically when a live daemon drops the connection.
    pub auto_reconnect: bool,
    pub reconnect_attempts: u32,
    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_multiplier: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            socket_dir: default_socket_dir(),
            daemon_binary: None,
            kill_grace_ms: 5_000,
            startup_timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            default_restart_policy: RestartPolicy::default(),
            auto_reconnect: true,
            reconnect_attempts: 5,
            reconnect_initial_delay_ms: 100,
            reconnect_max_delay_ms: 2_000,
            reconnect_multiplier: 2.0,
        }
    }
}

impl ManagerConfig {
    /// Config with every default except the socket directory.
    pub fn with_socket_dir(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> Result<(), DomainError> {
        if self.reconnect_multiplier.is_nan() || self.reconnect_multiplier < 1.0 {
            return Err(DomainError::InvalidFieldValue {
                field: "reconnect_multiplier".to_string(),
                value: self.reconnect_multiplier.to_string(),
                expected: "a number >= 1.0".to_string(),
            });
        }
        if self.socket_dir.as_os_str().is_empty() {
            return Err(DomainError::InvalidFieldValue {
                field: "socket_dir".to_string(),
                value: String::new(),
                expected: "a directory path".to_string(),
            });
        }
        Ok(())
    }

    /// Socket path for a session.
    pub fn socket_path(&self, id: &SessionId) -> PathBuf {
        self.socket_dir.join(id.socket_file_name())
    }

    /// The configured binary, else `tetherd` next to the current executable,
    /// else `tetherd` from `PATH`.
    pub fn daemon_binary(&self) -> PathBuf {
        if let Some(path) = &self.daemon_binary {
            return path.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|p| p.parent().map(|d| d.join(DAEMON_BINARY_NAME)))
            .filter(|p| p.exists())
            .unwrap_or_else(|| PathBuf::from(DAEMON_BINARY_NAME))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

/// `$TETHER_SOCKET_DIR`, else the runtime dir, else the state dir, else `/tmp`.
pub fn default_socket_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(SOCKET_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Some(runtime) = dirs::runtime_dir() {
        return runtime.join("tether");
    }
    if let Some(state) = dirs::state_dir() {
        return state.join("tether").join("sockets");
    }
    PathBuf::from("/tmp/tether-sockets")
}
