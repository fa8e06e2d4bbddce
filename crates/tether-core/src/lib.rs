//! tether Core - Shared types for persistent terminal sessions
//!
//! This crate provides the domain types shared between the per-session
//! daemon (tetherd) and the supervisor (tether-supervisor).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod process;
pub mod restart;
pub mod ring_buffer;
pub mod session;
pub mod sidecar;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use process::{IdentityCheck, KillOutcome, ProcessError, ProcessIdentity};
pub use restart::{RestartDecision, RestartPolicy, RestartState};
pub use ring_buffer::{ReplayBuffer, RingBuffer, StderrTail};
pub use session::{SessionId, SessionState};
