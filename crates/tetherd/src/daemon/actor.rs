//! The daemon actor: sole owner of the pty, the replay buffer and the
//! active connection.
//!
//! # Panic-Free Guarantees
//!
//! Pty and channel failures are logged and folded into state; nothing in the
//! actor loop unwraps.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use tether_core::{ProcessIdentity, ReplayBuffer};
use tether_protocol::{Exit, Message, ProtocolVersion, Welcome, MAX_PAYLOAD_LEN};

use super::commands::{
    Attachment, ClientInput, ConnectionId, DaemonCommand, DaemonStatus,
};
use super::{DaemonConfig, DaemonError};
use crate::pty::{PtyEvent, PtyEvents, PtyProcess, PtySpawner, SpawnSpec, TermSize};

/// Exit code reported when a SPAWN request cannot start its command.
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;

struct ActiveClient {
    conn_id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
    superseded: CancellationToken,
}

pub(crate) struct DaemonActor {
    receiver: mpsc::Receiver<DaemonCommand>,
    spawner: Arc<dyn PtySpawner>,
    pty: Option<Box<dyn PtyProcess>>,
    pty_events: PtyEvents,
    events_open: bool,
    replay: ReplayBuffer,
    active: Option<ActiveClient>,
    next_conn_id: ConnectionId,
    exited: Option<Exit>,
    size: TermSize,
    keep_alive: bool,
    exit_linger: Duration,
    linger_until: Option<Instant>,
    terminate: bool,
    identity: ProcessIdentity,
    shutdown: CancellationToken,
    finished: CancellationToken,
}

impl DaemonActor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        receiver: mpsc::Receiver<DaemonCommand>,
        spawner: Arc<dyn PtySpawner>,
        pty: Box<dyn PtyProcess>,
        pty_events: PtyEvents,
        config: &DaemonConfig,
        shutdown: CancellationToken,
        finished: CancellationToken,
    ) -> Self {
        Self {
            receiver,
            spawner,
            pty: Some(pty),
            pty_events,
            events_open: true,
            replay: ReplayBuffer::new(config.replay_lines),
            active: None,
            next_conn_id: 1,
            exited: None,
            size: config.size,
            keep_alive: config.keep_alive,
            exit_linger: config.exit_linger,
            linger_until: None,
            terminate: false,
            identity: config.identity,
            shutdown,
            finished,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            pid = self.identity.pid,
            child_pid = ?self.child_pid(),
            keep_alive = self.keep_alive,
            "session daemon started"
        );

        loop {
            let linger = self.linger_until;
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("daemon shutdown requested");
                    break;
                }

                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },

                event = self.pty_events.recv(), if self.events_open => {
                    self.handle_pty_event(event);
                }

                _ = sleep_until(linger.unwrap_or_else(Instant::now)), if linger.is_some() => {
                    info!(
                        linger_ms = self.exit_linger.as_millis() as u64,
                        "no client collected the exit status, stopping"
                    );
                    break;
                }
            }

            if self.terminate {
                break;
            }
        }

        self.stop();
    }

    fn child_pid(&self) -> Option<u32> {
        self.pty.as_ref().and_then(|p| p.pid())
    }

    fn stop(&mut self) {
        if self.exited.is_none() {
            if let Some(mut pty) = self.pty.take() {
                if let Err(e) = pty.kill(None) {
                    debug!(error = %e, "failed to kill pty process on stop");
                }
            }
        }
        // Dropping the sender lets the connection flush what is queued.
        self.active = None;
        self.receiver.close();
        self.finished.cancel();
        info!("session daemon stopped");
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, cmd: DaemonCommand) {
        match cmd {
            DaemonCommand::Attach { respond_to } => {
                let attachment = self.attach();
                if respond_to.send(attachment).is_err() {
                    debug!("connection went away before attaching");
                }
            }
            DaemonCommand::Detach { conn_id } => {
                if self.active.as_ref().is_some_and(|a| a.conn_id == conn_id) {
                    debug!(conn_id, "active connection detached");
                    self.active = None;
                }
            }
            DaemonCommand::Input { conn_id, input } => {
                if self.active.as_ref().is_some_and(|a| a.conn_id == conn_id) {
                    self.handle_input(input);
                } else {
                    trace!(conn_id, "ignoring input from inactive connection");
                }
            }
            DaemonCommand::Spawn { spec, respond_to } => {
                let _ = respond_to.send(self.respawn(spec));
            }
            DaemonCommand::Status { respond_to } => {
                let _ = respond_to.send(DaemonStatus {
                    child_pid: self.child_pid(),
                    exited: self.exited,
                    size: self.size,
                    attached: self.active.as_ref().map(|a| a.conn_id),
                    replay_lines: self.replay.line_count(),
                    replay_bytes: self.replay.byte_len(),
                });
            }
        }
    }

    fn attach(&mut self) -> Attachment {
        if let Some(previous) = self.active.take() {
            info!(conn_id = previous.conn_id, "superseding previous connection");
            previous.superseded.cancel();
        }

        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        let (tx, outbound) = mpsc::unbounded_channel();
        let superseded = CancellationToken::new();

        let welcome = Welcome {
            protocol_version: ProtocolVersion::CURRENT,
            pid: self.identity.pid,
            start_time: self.identity.start_time,
            child_pid: self.child_pid(),
            cols: self.size.cols,
            rows: self.size.rows,
        };
        let replay = Bytes::from(self.replay.snapshot_tail(MAX_PAYLOAD_LEN));
        let replay_len = replay.len();

        let _ = tx.send(Message::Welcome(welcome));
        let _ = tx.send(Message::Replay(replay));
        if let Some(exit) = self.exited {
            let _ = tx.send(Message::Exit(exit));
            if !self.keep_alive {
                // This client collects the exit status; nothing left to serve.
                self.terminate = true;
            }
        }

        info!(conn_id, replay_bytes = replay_len, "client attached");
        self.active = Some(ActiveClient {
            conn_id,
            tx,
            superseded: superseded.clone(),
        });

        Attachment {
            conn_id,
            outbound,
            superseded,
        }
    }

    fn handle_input(&mut self, input: ClientInput) {
        if let ClientInput::Spawn(spec) = input {
            if let Err(e) = self.respawn(spec) {
                warn!(error = %e, "SPAWN request failed");
            }
            return;
        }

        if self.exited.is_some() {
            trace!("ignoring input after exit");
            return;
        }
        let Some(pty) = self.pty.as_mut() else {
            return;
        };

        let result = match input {
            ClientInput::Data(data) => pty.write(&data),
            ClientInput::Resize(size) => {
                self.size = size;
                debug!(cols = size.cols, rows = size.rows, "resizing pty");
                pty.resize(size)
            }
            ClientInput::Signal(signal) => {
                debug!(signal = signal.name(), "forwarding signal");
                pty.kill(Some(signal))
            }
            ClientInput::Spawn(_) => Ok(()),
        };
        if let Err(e) = result {
            warn!(error = %e, "pty input failed");
        }
    }

    /// Kills the current process and starts `spec` at the current size.
    ///
    /// The replay buffer and the active connection are kept.
    fn respawn(&mut self, spec: SpawnSpec) -> Result<Option<u32>, DaemonError> {
        if let Some(mut old) = self.pty.take() {
            if self.exited.is_none() {
                if let Err(e) = old.kill(None) {
                    debug!(error = %e, "previous process already gone");
                }
            }
        }

        // Events from the old process are stale from here on.
        let (_, closed) = mpsc::unbounded_channel();
        self.pty_events = closed;
        self.events_open = false;

        match self.spawner.spawn(&spec, self.size) {
            Ok((pty, events)) => {
                let pid = pty.pid();
                info!(command = %spec.command, child_pid = ?pid, "respawned foreground process");
                self.pty = Some(pty);
                self.pty_events = events;
                self.events_open = true;
                self.exited = None;
                self.linger_until = None;
                Ok(pid)
            }
            Err(e) => {
                error!(command = %spec.command, error = %e, "failed to spawn requested process");
                self.on_child_exit(Exit {
                    code: Some(SPAWN_FAILED_EXIT_CODE),
                    signal: None,
                });
                Err(DaemonError::Pty(e))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Pty events
    // ------------------------------------------------------------------------

    fn handle_pty_event(&mut self, event: Option<PtyEvent>) {
        match event {
            Some(PtyEvent::Data(data)) => {
                self.replay.push(&data);
                self.send_to_active(Message::Data(data));
            }
            Some(PtyEvent::Exit(status)) => {
                self.events_open = false;
                self.on_child_exit(status.into());
            }
            None => {
                self.events_open = false;
                if self.exited.is_none() {
                    warn!("pty event stream ended without an exit status");
                    self.on_child_exit(Exit::default());
                }
            }
        }
    }

    fn on_child_exit(&mut self, exit: Exit) {
        info!(code = ?exit.code, signal = ?exit.signal, "foreground process exited");
        self.exited = Some(exit);
        self.pty = None;

        let delivered = self.send_to_active(Message::Exit(exit));
        if self.keep_alive {
            return;
        }
        if delivered {
            self.terminate = true;
        } else {
            self.linger_until = Some(Instant::now() + self.exit_linger);
        }
    }

    /// Queues `msg` for the active connection. Returns false if none.
    fn send_to_active(&mut self, msg: Message) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        if active.tx.send(msg).is_ok() {
            return true;
        }
        debug!(conn_id = active.conn_id, "active connection is gone");
        self.active = None;
        false
    }
}
