//! tetherd - per-session daemon library
//!
//! One `tetherd` process owns exactly one pseudo-terminal and serves it to
//! at most one attached client over a Unix socket. The pieces:
//!
//! - [`pty`]: the pseudo-terminal adapter (native backend and a fake for tests)
//! - [`daemon`]: the session actor, socket listener and per-connection handler
//! - [`bootstrap`]: the process contract used by the `tetherd` binary

pub mod bootstrap;
pub mod daemon;
pub mod pty;

pub use bootstrap::{BootstrapConfig, BootstrapError};
pub use daemon::{DaemonConfig, DaemonError, DaemonHandle, SessionDaemon};
pub use pty::{PtyError, PtyEvent, PtyProcess, PtySpawner, SpawnSpec, TermSize};
