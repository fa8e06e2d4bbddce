//! Session manager.
//!
//! [`SessionManager`] is a cheap-to-clone handle onto a single actor task
//! that owns the session table. Each table entry is one `tetherd` process,
//! either spawned by [`SessionManager::create_session`] or adopted with
//! [`SessionManager::reconnect_session`].
//!
//! Slow work never runs inside the actor. Creating and killing sessions
//! happens in the caller's task; the actor only hands out and takes back
//! table entries.

mod actor;
mod commands;
mod reconnect;
mod sockets;
mod spawn;

pub use commands::SessionInput;
pub use sockets::CleanupReport;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use tether_core::process::kill_gracefully;
use tether_core::{
    sidecar, IdentityCheck, ProcessIdentity, RestartPolicy, SessionId, SessionState,
};
use tether_protocol::{Exit, Signal, Spawn};

use crate::client::SessionClient;
use crate::config::ManagerConfig;
use crate::error::ManagerError;
use actor::ManagerActor;
use commands::{Connection, ManagerCommand, NewSession};
use spawn::{spawn_daemon, DaemonArgs};

/// Command channel capacity.
const COMMAND_BUFFER: usize = 256;

/// Per-session event channel capacity. Slow subscribers lag, they never
/// block the manager.
pub(crate) const EVENT_BUFFER: usize = 1024;

/// How long to wait for a killed daemon we spawned to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Public types
// ============================================================================

/// Options for [`SessionManager::create_session`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSessionOptions {
    /// Session id; generated when absent.
    pub id: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    /// Initial terminal size; 80x24 when absent.
    pub size: Option<(u16, u16)>,
    /// Falls back to the manager's default policy.
    pub restart_policy: Option<RestartPolicy>,
    /// Keep the daemon serving after its process exits. Defaults to true
    /// when restarts are enabled, since restarting needs a live daemon.
    pub keep_alive: Option<bool>,
    pub replay_lines: Option<usize>,
}

impl CreateSessionOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.size = Some((cols, rows));
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = Some(policy);
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    fn spawn_spec(&self) -> Spawn {
        Spawn {
            command: self.command.clone(),
            args: self.args.clone(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        }
    }
}

/// Events published per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Pty output. For a session this manager started, the first event
    /// carries what the process wrote before the client attached.
    Data(Bytes),
    /// The foreground process ended
    Exit { code: Option<i32>, signal: Option<i32> },
    /// The connection reported an error
    Error(String),
    /// The connection to the daemon closed
    Close,
    /// The process was respawned after an exit
    Restarted { attempt: u32 },
    /// The restart budget is spent; the session stays exited
    RestartExhausted { restarts: u32 },
    /// A lost connection was re-established
    Reconnected,
}

/// Snapshot of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub socket_path: PathBuf,
    /// The daemon's identity
    pub identity: ProcessIdentity,
    /// Pid of the process on the pty, as of the last handshake
    pub child_pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
    pub connected: bool,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub exhausted: bool,
    pub last_exit: Option<Exit>,
}

// ============================================================================
// Request helper
// ============================================================================

async fn request<T>(
    sender: &mpsc::Sender<ManagerCommand>,
    make: impl FnOnce(oneshot::Sender<T>) -> ManagerCommand,
) -> Result<T, ManagerError> {
    let (tx, rx) = oneshot::channel();
    sender
        .send(make(tx))
        .await
        .map_err(|_| ManagerError::ChannelClosed)?;
    rx.await.map_err(|_| ManagerError::ChannelClosed)
}

// ============================================================================
// Session handle
// ============================================================================

/// Receiver opened when the session was registered, handed to the first
/// subscriber.
type FirstSubscriber = Arc<Mutex<Option<broadcast::Receiver<SessionEvent>>>>;

/// Handle to one managed session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    sender: mpsc::Sender<ManagerCommand>,
    events: broadcast::Sender<SessionEvent>,
    first: FirstSubscriber,
}

impl SessionHandle {
    pub(crate) fn new(
        id: SessionId,
        sender: mpsc::Sender<ManagerCommand>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            id,
            sender,
            events,
            first: FirstSubscriber::default(),
        }
    }

    /// A handle whose first `subscribe` sees every event since `first` was
    /// opened.
    pub(crate) fn with_first_subscriber(
        id: SessionId,
        sender: mpsc::Sender<ManagerCommand>,
        events: broadcast::Sender<SessionEvent>,
        first: broadcast::Receiver<SessionEvent>,
    ) -> Self {
        Self {
            first: Arc::new(Mutex::new(Some(first))),
            ..Self::new(id, sender, events)
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub async fn write(&self, data: impl Into<Bytes>) -> Result<(), ManagerError> {
        self.input(SessionInput::Data(data.into())).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), ManagerError> {
        self.input(SessionInput::Resize { cols, rows }).await
    }

    pub async fn signal(&self, signal: Signal) -> Result<(), ManagerError> {
        self.input(SessionInput::Signal(signal)).await
    }

    /// Replaces the foreground process. Also resets the restart budget.
    pub async fn spawn(&self, spec: Spawn) -> Result<(), ManagerError> {
        self.input(SessionInput::Spawn(spec)).await
    }

    /// Subscribes to this session's events.
    ///
    /// On a handle returned by `create_session` or `reconnect_session`, the
    /// first call (on any clone) receives every event since the session was
    /// registered, so output and exit of a short-lived command are not
    /// missed. Later calls see events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        let first = match self.first.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        first.unwrap_or_else(|| self.events.subscribe())
    }

    pub async fn status(&self) -> Result<SessionInfo, ManagerError> {
        let session_id = self.id.clone();
        request(&self.sender, |respond_to| ManagerCommand::Info {
            session_id,
            respond_to,
        })
        .await?
    }

    /// Output the daemon replayed on the most recent (re)connect.
    pub async fn replay(&self) -> Result<Bytes, ManagerError> {
        let session_id = self.id.clone();
        request(&self.sender, |respond_to| ManagerCommand::Replay {
            session_id,
            respond_to,
        })
        .await?
    }

    async fn input(&self, input: SessionInput) -> Result<(), ManagerError> {
        let session_id = self.id.clone();
        request(&self.sender, |respond_to| ManagerCommand::Input {
            session_id,
            input,
            respond_to,
        })
        .await?
    }
}

// ============================================================================
// Session manager
// ============================================================================

/// Creates, adopts, kills and lists sessions. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionManager {
    sender: mpsc::Sender<ManagerCommand>,
    config: Arc<ManagerConfig>,
}

impl SessionManager {
    /// Starts the manager actor. Must be called inside a tokio runtime.
    pub fn start(config: ManagerConfig) -> Self {
        let config = Arc::new(config);
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let actor = ManagerActor::new(receiver, sender.downgrade(), Arc::clone(&config));
        tokio::spawn(actor.run());
        Self { sender, config }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Starts `tetherd` for a new session and connects to it.
    ///
    /// On failure the daemon is stopped and the error carries its stderr.
    pub async fn create_session(
        &self,
        opts: CreateSessionOptions,
    ) -> Result<SessionHandle, ManagerError> {
        let id = match &opts.id {
            Some(id) => SessionId::parse(id.clone())?,
            None => SessionId::generate(),
        };

        let session_id = id.clone();
        request(&self.sender, |respond_to| ManagerCommand::Reserve {
            session_id,
            respond_to,
        })
        .await??;

        match self.start_session(&id, &opts).await {
            Ok(session) => {
                request(&self.sender, |respond_to| ManagerCommand::Register {
                    session: Box::new(session),
                    respond_to,
                })
                .await?
            }
            Err(e) => {
                let _ = self
                    .sender
                    .send(ManagerCommand::Release { session_id: id })
                    .await;
                Err(e)
            }
        }
    }

    async fn start_session(
        &self,
        id: &SessionId,
        opts: &CreateSessionOptions,
    ) -> Result<NewSession, ManagerError> {
        let socket_path = self.config.socket_path(id);
        let restart_policy = opts
            .restart_policy
            .unwrap_or(self.config.default_restart_policy);
        let keep_alive = opts.keep_alive.unwrap_or(restart_policy.enabled);
        let (cols, rows) = opts.size.unwrap_or((80, 24));

        let args = DaemonArgs {
            command: opts.command.clone(),
            args: opts.args.clone(),
            cwd: opts.cwd.clone(),
            env: opts.env.clone(),
            cols,
            rows,
            socket_path: socket_path.clone(),
            keep_alive,
            replay_lines: opts.replay_lines,
        };

        info!(session_id = %id, command = %opts.command, socket = %socket_path.display(), "starting session");
        let daemon = spawn_daemon(
            id,
            &self.config.daemon_binary(),
            &args,
            self.config.startup_timeout(),
        )
        .await?;

        let connected = SessionClient::connect(&socket_path, self.config.connect_timeout()).await;
        let (client, welcome, events) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                let reason = format!("failed to connect: {e}");
                let stderr = daemon.abort(&socket_path).await;
                return Err(ManagerError::SpawnFailed {
                    session_id: id.clone(),
                    reason,
                    stderr,
                });
            }
        };

        if welcome.pid != daemon.identity.pid {
            let reason = format!(
                "socket answered as pid {}, spawned pid {}",
                welcome.pid, daemon.identity.pid
            );
            drop(client);
            let stderr = daemon.abort(&socket_path).await;
            return Err(ManagerError::SpawnFailed {
                session_id: id.clone(),
                reason,
                stderr,
            });
        }

        Ok(NewSession {
            id: id.clone(),
            socket_path,
            identity: daemon.identity,
            child: Some(daemon.child),
            connection: Connection {
                client,
                welcome,
                events,
            },
            spawn_spec: Some(opts.spawn_spec()),
            started_here: true,
            keep_alive,
            restart_policy,
            stderr: daemon.stderr,
        })
    }

    /// Adopts a daemon that is already running, typically one started by a
    /// previous supervisor.
    ///
    /// Adopted sessions are never restarted automatically: the command they
    /// run is unknown.
    pub async fn reconnect_session(
        &self,
        id: &str,
        socket_path: impl AsRef<Path>,
        pid: u32,
        start_time: u64,
    ) -> Result<SessionHandle, ManagerError> {
        let id = SessionId::parse(id)?;
        let socket_path = socket_path.as_ref().to_path_buf();
        let expected = ProcessIdentity::new(pid, start_time);

        let session_id = id.clone();
        request(&self.sender, |respond_to| ManagerCommand::Reserve {
            session_id,
            respond_to,
        })
        .await??;

        let connection =
            reconnect::verify_and_connect(&socket_path, expected, self.config.connect_timeout())
                .await;
        let connection = match connection {
            Ok(connection) => connection,
            Err(failure) => {
                warn!(
                    session_id = %id,
                    reason = failure.reason(),
                    error = %failure,
                    "cannot reconnect session"
                );
                let _ = self
                    .sender
                    .send(ManagerCommand::Release {
                        session_id: id.clone(),
                    })
                    .await;
                return Err(ManagerError::Reconnect {
                    session_id: id,
                    failure,
                });
            }
        };

        info!(session_id = %id, pid, socket = %socket_path.display(), "session adopted");
        let session = NewSession {
            id,
            socket_path,
            identity: expected,
            child: None,
            connection,
            spawn_spec: None,
            started_here: false,
            keep_alive: true,
            restart_policy: self.config.default_restart_policy,
            stderr: Default::default(),
        };
        request(&self.sender, |respond_to| ManagerCommand::Register {
            session: Box::new(session),
            respond_to,
        })
        .await?
    }

    /// Stops a session's daemon and removes its socket and sidecar.
    ///
    /// SIGTERM first, SIGKILL once the grace period runs out. Unknown ids
    /// are not an error, so killing twice is fine.
    pub async fn kill_session(&self, id: &SessionId) -> Result<(), ManagerError> {
        let session_id = id.clone();
        let target = request(&self.sender, |respond_to| ManagerCommand::BeginKill {
            session_id,
            respond_to,
        })
        .await?;
        let Some(mut target) = target else {
            debug!(session_id = %id, "kill: no such session");
            return Ok(());
        };

        let pid = target.identity.pid;
        info!(session_id = %id, pid, "killing session");

        let killed = match target.identity.check() {
            IdentityCheck::Alive => kill_gracefully(pid, self.config.kill_grace())
                .await
                .map(|outcome| debug!(session_id = %id, pid, ?outcome, "daemon stopped")),
            IdentityCheck::Dead => Ok(()),
            IdentityCheck::PidReused { current_start_time } => {
                warn!(
                    session_id = %id,
                    pid,
                    expected_start_time = target.identity.start_time,
                    current_start_time,
                    "pid reused, not signalling"
                );
                Ok(())
            }
        };

        if let Some(child) = target.child.as_mut() {
            let _ = tokio::time::timeout(REAP_TIMEOUT, child.wait()).await;
        }
        sockets::remove_if_socket(&target.socket_path).await;
        sidecar::remove(&target.socket_path);
        let _ = target.events.send(SessionEvent::Close);

        killed.map_err(ManagerError::from)
    }

    /// Handles to every session in this manager's table.
    pub async fn list_sessions(&self) -> Result<Vec<SessionHandle>, ManagerError> {
        request(&self.sender, |respond_to| ManagerCommand::List { respond_to }).await
    }

    pub async fn session(&self, id: &SessionId) -> Result<Option<SessionHandle>, ManagerError> {
        let sessions = self.list_sessions().await?;
        Ok(sessions.into_iter().find(|h| h.id() == id))
    }

    pub async fn session_info(&self, id: &SessionId) -> Result<SessionInfo, ManagerError> {
        let session_id = id.clone();
        request(&self.sender, |respond_to| ManagerCommand::Info {
            session_id,
            respond_to,
        })
        .await?
    }

    /// Captured stderr of a daemon this manager spawned.
    pub async fn stderr_tail(&self, id: &SessionId) -> Result<Vec<String>, ManagerError> {
        let session_id = id.clone();
        request(&self.sender, |respond_to| ManagerCommand::StderrTail {
            session_id,
            respond_to,
        })
        .await?
    }

    /// Removes sockets in the socket directory that no live daemon owns.
    pub async fn cleanup_stale_sockets(&self) -> Result<CleanupReport, ManagerError> {
        let known = request(&self.sender, |respond_to| ManagerCommand::KnownSockets {
            respond_to,
        })
        .await?;
        let dir = &self.config.socket_dir;
        let report = sockets::cleanup_stale_sockets(dir, &known)
            .await
            .map_err(|source| ManagerError::SocketDir {
                path: dir.clone(),
                source,
            })?;
        info!(
            kept = report.kept.len(),
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "socket cleanup finished"
        );
        Ok(report)
    }

    /// Detaches from every session and stops the actor. Daemons keep running.
    pub async fn shutdown(&self) {
        let _ = request(&self.sender, |respond_to| ManagerCommand::Shutdown {
            respond_to,
        })
        .await;
    }
}
