//! tether Supervisor - owns and drives tether session daemons
//!
//! The supervisor side of tether:
//! - [`SessionClient`]: one framed connection to a session daemon
//! - [`SessionManager`]: spawns `tetherd`, reconnects to survivors, kills,
//!   restarts and cleans up after them
//! - [`ManagerConfig`]: TOML-loadable settings
//!
//! ```text
//! ┌────────────────┐  ManagerCommand  ┌──────────────┐  ClientEvent  ┌───────────────┐
//! │ SessionManager │────────────────▶│ ManagerActor │◀──────────────│ SessionClient │◀── tetherd
//! │ SessionHandle  │◀────────────────│ session table│               └───────────────┘
//! └────────────────┘   SessionEvent   └──────────────┘
//! ```
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod client;
pub mod config;
pub mod error;
pub mod manager;

pub use client::{ClientEvent, SessionClient, WelcomeInfo};
pub use config::{ConfigError, ManagerConfig};
pub use error::{ClientError, ManagerError, ReconnectFailure};
pub use manager::{
    CleanupReport, CreateSessionOptions, SessionEvent, SessionHandle, SessionInfo, SessionInput,
    SessionManager,
};
