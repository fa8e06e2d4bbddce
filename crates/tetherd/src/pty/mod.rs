//! Pseudo-terminal adapter.
//!
//! The daemon never touches a pty directly; it is handed a [`PtySpawner`] at
//! construction and talks to the spawned process through [`PtyProcess`] and a
//! channel of [`PtyEvent`]s. [`NativePtySpawner`] is the real backend,
//! [`FakePtySpawner`] a scriptable stand-in for tests.

mod fake;
mod native;

pub use fake::{FakePtyController, FakePtySpawner};
pub use native::NativePtySpawner;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use tether_protocol::{Exit, Signal, Spawn};

/// What to run on the pty. Same shape as the SPAWN payload.
pub type SpawnSpec = Spawn;

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// How the process on the pty ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        Exit {
            code: status.code,
            signal: status.signal,
        }
    }
}

/// Output of a running pty.
///
/// `Exit` is always the last event and follows the final `Data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data(Bytes),
    Exit(ExitStatus),
}

/// Receiving side of a pty's event stream.
pub type PtyEvents = mpsc::UnboundedReceiver<PtyEvent>;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open pty: {0}")]
    Open(String),

    #[error("Failed to spawn {command:?}: {message}")]
    Spawn { command: String, message: String },

    #[error("Pty process has exited")]
    Closed,

    #[error("Pty I/O error: {0}")]
    Io(String),
}

/// Starts processes on fresh pseudo-terminals.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, spec: &SpawnSpec, size: TermSize)
        -> Result<(Box<dyn PtyProcess>, PtyEvents), PtyError>;
}

/// A process running on a pty.
pub trait PtyProcess: Send {
    /// Pid of the process, if the backend knows it.
    fn pid(&self) -> Option<u32>;

    /// Queues bytes for the pty's input. Never blocks.
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError>;

    fn resize(&mut self, size: TermSize) -> Result<(), PtyError>;

    /// Delivers `signal` to the process; `None` means SIGKILL.
    fn kill(&mut self, signal: Option<Signal>) -> Result<(), PtyError>;
}
