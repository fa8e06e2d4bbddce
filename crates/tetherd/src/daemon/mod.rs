//! The session daemon.
//!
//! ```text
//! ┌──────────────┐  accept  ┌───────────────────┐  DaemonCommand  ┌─────────────┐
//! │ UnixListener │────────▶│ connection task   │───────────────▶│ DaemonActor │
//! └──────────────┘          │ (one per socket)  │◀───────────────│  pty, replay │
//!                           └───────────────────┘  Message queue  └──────┬──────┘
//!                                                                        │ PtyEvent
//!                                                                 ┌──────┴──────┐
//!                                                                 │ PtyProcess  │
//!                                                                 └─────────────┘
//! ```
//!
//! The actor serializes attaches, so the most recent connection always wins
//! and the previous one is told to close.

mod actor;
mod commands;
mod connection;
mod handle;
pub mod listener;

pub use actor::SPAWN_FAILED_EXIT_CODE;
pub use commands::{Attachment, ClientInput, ConnectionId, DaemonStatus};
pub use connection::ConnectionError;
pub use handle::DaemonHandle;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use tether_core::ring_buffer::DEFAULT_REPLAY_LINES;
use tether_core::ProcessIdentity;

use crate::pty::{PtyError, PtySpawner, SpawnSpec, TermSize};
use actor::DaemonActor;

/// Command channel capacity.
const COMMAND_BUFFER: usize = 256;

/// Default time a client has to send HELLO.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time an exited session waits for a client to collect its exit.
pub const DEFAULT_EXIT_LINGER: Duration = Duration::from_secs(5);

/// How long connections get to flush after the daemon stops.
const CONNECTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed `accept` before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Pty error: {0}")]
    Pty(#[from] PtyError),

    #[error("Failed to set up socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Socket {0} is owned by a running daemon")]
    SocketInUse(PathBuf),

    #[error("Refusing to replace {0}: not a socket")]
    NotASocket(PathBuf),

    #[error("Daemon actor has stopped")]
    ChannelClosed,
}

/// Settings for one daemon instance.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub spec: SpawnSpec,
    pub size: TermSize,
    /// Keep serving after the process exits, accepting SPAWN.
    pub keep_alive: bool,
    pub replay_lines: usize,
    pub exit_linger: Duration,
    pub handshake_timeout: Duration,
    /// Identity reported in WELCOME.
    pub identity: ProcessIdentity,
}

impl DaemonConfig {
    pub fn new(spec: SpawnSpec, size: TermSize) -> Self {
        let identity = ProcessIdentity::current()
            .unwrap_or_else(|| ProcessIdentity::new(std::process::id(), 0));
        Self {
            spec,
            size,
            keep_alive: false,
            replay_lines: DEFAULT_REPLAY_LINES,
            exit_linger: DEFAULT_EXIT_LINGER,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            identity,
        }
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn replay_lines(mut self, lines: usize) -> Self {
        self.replay_lines = lines;
        self
    }

    pub fn exit_linger(mut self, linger: Duration) -> Self {
        self.exit_linger = linger;
        self
    }

    pub fn handshake_timeout(mut self, limit: Duration) -> Self {
        self.handshake_timeout = limit;
        self
    }
}

/// A running daemon: the actor plus what is needed to serve connections.
pub struct SessionDaemon {
    handle: DaemonHandle,
    handshake_timeout: Duration,
    shutdown: CancellationToken,
    finished: CancellationToken,
    actor: JoinHandle<()>,
}

impl SessionDaemon {
    /// Spawns the configured process and starts the actor.
    ///
    /// A spawn failure is returned and nothing keeps running.
    pub fn start(config: DaemonConfig, spawner: Arc<dyn PtySpawner>) -> Result<Self, DaemonError> {
        let (pty, events) = spawner.spawn(&config.spec, config.size)?;

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = CancellationToken::new();
        let finished = CancellationToken::new();

        let actor = DaemonActor::new(
            rx,
            spawner,
            pty,
            events,
            &config,
            shutdown.clone(),
            finished.clone(),
        );
        let actor = tokio::spawn(actor.run());

        Ok(Self {
            handle: DaemonHandle::new(tx),
            handshake_timeout: config.handshake_timeout,
            shutdown,
            finished,
            actor,
        })
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    /// Token that stops the daemon when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Token cancelled once the actor has stopped.
    pub fn finished_token(&self) -> CancellationToken {
        self.finished.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Handshakes and serves one accepted connection until it closes or a
    /// newer client supersedes it.
    pub fn handle_connection(
        &self,
        stream: UnixStream,
    ) -> impl Future<Output = ()> + Send + 'static {
        connection::run_connection(stream, self.handle.clone(), self.handshake_timeout)
    }

    /// Accepts connections until the daemon stops, then lets open
    /// connections flush and waits for the actor.
    pub async fn serve(self, listener: UnixListener) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.finished.cancelled() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        debug!("accepted connection");
                        connections.spawn(self.handle_connection(stream));
                    }
                    Err(e) => {
                        error!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        debug!(error = %e, "connection task failed");
                    }
                }
            }
        }
        drop(listener);

        let drained = tokio::time::timeout(CONNECTION_DRAIN_TIMEOUT, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            debug!(remaining = connections.len(), "aborting lingering connections");
            connections.shutdown().await;
        }

        if let Err(e) = self.actor.await {
            error!(error = %e, "daemon actor task failed");
        }
    }
}
