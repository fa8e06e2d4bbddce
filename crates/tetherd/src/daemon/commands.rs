//! Commands accepted by the daemon actor.

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use tether_protocol::{Exit, Message, Signal};

use super::DaemonError;
use crate::pty::{SpawnSpec, TermSize};

/// Identifies one accepted connection for its whole life.
pub type ConnectionId = u64;

/// Input from the attached client, already validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    Data(Bytes),
    Resize(TermSize),
    Signal(Signal),
    Spawn(SpawnSpec),
}

/// What a connection receives when it becomes the active one.
///
/// `outbound` already holds WELCOME and REPLAY (and EXIT if the process is
/// gone) when the attachment is handed over. It closes when the daemon stops.
#[derive(Debug)]
pub struct Attachment {
    pub conn_id: ConnectionId,
    pub outbound: mpsc::UnboundedReceiver<Message>,
    /// Cancelled when a newer connection takes over.
    pub superseded: CancellationToken,
}

/// Point-in-time view of the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub child_pid: Option<u32>,
    pub exited: Option<Exit>,
    pub size: TermSize,
    pub attached: Option<ConnectionId>,
    pub replay_lines: usize,
    pub replay_bytes: usize,
}

#[derive(Debug)]
pub enum DaemonCommand {
    /// Make the caller the active connection, superseding any other.
    Attach {
        respond_to: oneshot::Sender<Attachment>,
    },

    /// A connection ended.
    Detach { conn_id: ConnectionId },

    /// Input from a connection; ignored unless it is the active one.
    Input {
        conn_id: ConnectionId,
        input: ClientInput,
    },

    /// Replace the foreground process.
    Spawn {
        spec: SpawnSpec,
        respond_to: oneshot::Sender<Result<Option<u32>, DaemonError>>,
    },

    Status {
        respond_to: oneshot::Sender<DaemonStatus>,
    },
}
