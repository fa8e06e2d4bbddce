//! Manager actor commands.
//!
//! Requests from [`SessionManager`](super::SessionManager) and
//! [`SessionHandle`](super::SessionHandle) carry a oneshot `respond_to`.
//! The rest are notifications from tasks the actor spawned: client event
//! pumps, restart timers and reconnect loops.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, oneshot};

use tether_core::{ProcessIdentity, RestartPolicy, SessionId, StderrTail};
use tether_protocol::{Signal, Spawn};

use super::{SessionEvent, SessionHandle, SessionInfo};
use crate::client::{ClientEvent, SessionClient, WelcomeInfo};
use crate::error::{ManagerError, ReconnectFailure};

/// Input forwarded to a session's daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Data(Bytes),
    Resize { cols: u16, rows: u16 },
    Signal(Signal),
    Spawn(Spawn),
}

/// A connected client plus the events it produces.
#[derive(Debug)]
pub(crate) struct Connection {
    pub client: SessionClient,
    pub welcome: WelcomeInfo,
    pub events: mpsc::UnboundedReceiver<ClientEvent>,
}

/// Everything needed to put a freshly started or adopted daemon in the table.
#[derive(Debug)]
pub(crate) struct NewSession {
    pub id: SessionId,
    pub socket_path: PathBuf,
    pub identity: ProcessIdentity,
    /// Present only when this manager spawned the daemon.
    pub child: Option<Child>,
    pub connection: Connection,
    /// Command to run again on restart; unknown for adopted daemons.
    pub spawn_spec: Option<Spawn>,
    /// Spawned by this manager, so nobody has seen its output yet.
    pub started_here: bool,
    pub keep_alive: bool,
    pub restart_policy: RestartPolicy,
    pub stderr: Arc<Mutex<StderrTail>>,
}

/// What `kill_session` needs once the session has left the table.
#[derive(Debug)]
pub(crate) struct KillTarget {
    pub identity: ProcessIdentity,
    pub socket_path: PathBuf,
    pub child: Option<Child>,
    pub events: broadcast::Sender<SessionEvent>,
}

type Reply<T> = oneshot::Sender<Result<T, ManagerError>>;

#[derive(Debug)]
pub(crate) enum ManagerCommand {
    /// Claim an id before spawning so two creates cannot race for it.
    Reserve {
        session_id: SessionId,
        respond_to: Reply<()>,
    },

    /// Give up a reservation after a failed create.
    Release { session_id: SessionId },

    Register {
        session: Box<NewSession>,
        respond_to: Reply<SessionHandle>,
    },

    Input {
        session_id: SessionId,
        input: SessionInput,
        respond_to: Reply<()>,
    },

    Info {
        session_id: SessionId,
        respond_to: Reply<SessionInfo>,
    },

    StderrTail {
        session_id: SessionId,
        respond_to: Reply<Vec<String>>,
    },

    Replay {
        session_id: SessionId,
        respond_to: Reply<Bytes>,
    },

    List {
        respond_to: oneshot::Sender<Vec<SessionHandle>>,
    },

    /// Remove a session from the table and hand back what is needed to kill it.
    BeginKill {
        session_id: SessionId,
        respond_to: oneshot::Sender<Option<KillTarget>>,
    },

    /// Identities of every session, keyed by socket path.
    KnownSockets {
        respond_to: oneshot::Sender<HashMap<PathBuf, ProcessIdentity>>,
    },

    ClientEvent {
        session_id: SessionId,
        generation: u64,
        event: ClientEvent,
    },

    PerformRestart { session_id: SessionId, attempt: u32 },

    CheckRestartReset { session_id: SessionId },

    Reconnected {
        session_id: SessionId,
        connection: Box<Connection>,
    },

    ReconnectFailed {
        session_id: SessionId,
        failure: ReconnectFailure,
    },

    Shutdown { respond_to: oneshot::Sender<()> },
}
