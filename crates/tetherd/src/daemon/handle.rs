//! Cheap-to-clone interface onto the daemon actor.

use tokio::sync::{mpsc, oneshot};

use super::commands::{Attachment, ClientInput, ConnectionId, DaemonCommand, DaemonStatus};
use super::DaemonError;
use crate::pty::SpawnSpec;

/// Handle for talking to a running daemon actor.
///
/// All methods fail with [`DaemonError::ChannelClosed`] once the actor has
/// stopped.
#[derive(Clone, Debug)]
pub struct DaemonHandle {
    sender: mpsc::Sender<DaemonCommand>,
}

impl DaemonHandle {
    pub(crate) fn new(sender: mpsc::Sender<DaemonCommand>) -> Self {
        Self { sender }
    }

    /// Attaches as the active connection, superseding the previous one.
    pub async fn attach(&self) -> Result<Attachment, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DaemonCommand::Attach { respond_to: tx })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;
        rx.await.map_err(|_| DaemonError::ChannelClosed)
    }

    pub async fn detach(&self, conn_id: ConnectionId) -> Result<(), DaemonError> {
        self.sender
            .send(DaemonCommand::Detach { conn_id })
            .await
            .map_err(|_| DaemonError::ChannelClosed)
    }

    pub async fn input(&self, conn_id: ConnectionId, input: ClientInput) -> Result<(), DaemonError> {
        self.sender
            .send(DaemonCommand::Input { conn_id, input })
            .await
            .map_err(|_| DaemonError::ChannelClosed)
    }

    /// Replaces the foreground process, returning the new pid if known.
    pub async fn spawn(&self, spec: SpawnSpec) -> Result<Option<u32>, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DaemonCommand::Spawn {
                spec,
                respond_to: tx,
            })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;
        rx.await.map_err(|_| DaemonError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<DaemonStatus, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(DaemonCommand::Status { respond_to: tx })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;
        rx.await.map_err(|_| DaemonError::ChannelClosed)
    }

    /// Returns true once the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
