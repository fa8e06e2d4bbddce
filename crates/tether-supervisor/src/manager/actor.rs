//! The manager actor.
//!
//! Owns the session table. Nothing here blocks: spawning, kill grace waits,
//! restart delays and reconnect backoff all run in the caller's task or in a
//! spawned task that reports back with a command.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{
    DomainError, ProcessIdentity, RestartDecision, RestartPolicy, RestartState, SessionId,
    SessionState, StderrTail,
};
use tether_protocol::{Exit, Spawn};

use super::commands::{Connection, KillTarget, ManagerCommand, NewSession, SessionInput};
use super::reconnect::{reconnect_with_backoff, Backoff};
use super::spawn::snapshot;
use super::{SessionEvent, SessionHandle, SessionInfo, EVENT_BUFFER};
use crate::client::{ClientEvent, SessionClient, WelcomeInfo};
use crate::config::ManagerConfig;
use crate::error::{ClientError, ManagerError, ReconnectFailure};

/// One row of the session table.
struct ManagedSession {
    id: SessionId,
    socket_path: PathBuf,
    identity: ProcessIdentity,
    child: Option<Child>,
    client: Option<SessionClient>,
    /// Bumped on every new client so events from an old one are ignored.
    generation: u64,
    welcome: WelcomeInfo,
    replay: Bytes,
    spawn_spec: Option<Spawn>,
    /// The daemon keeps serving after its process exits.
    keep_alive: bool,
    restart_policy: RestartPolicy,
    restart_state: RestartState,
    exhausted: bool,
    restart_pending: bool,
    last_exit: Option<Exit>,
    stderr: Arc<Mutex<StderrTail>>,
    state: SessionState,
    events: broadcast::Sender<SessionEvent>,
    /// Cancels an in-flight reconnect loop.
    reconnect: Option<CancellationToken>,
}

impl ManagedSession {
    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            state: self.state,
            socket_path: self.socket_path.clone(),
            identity: self.identity,
            child_pid: self.welcome.child_pid,
            cols: self.welcome.cols,
            rows: self.welcome.rows,
            connected: self.client.as_ref().is_some_and(SessionClient::is_connected),
            restart_count: self.restart_state.count,
            max_restarts: self.restart_policy.max_restarts,
            exhausted: self.exhausted,
            last_exit: self.last_exit,
        }
    }

    fn client(&self) -> Result<&SessionClient, ManagerError> {
        self.client
            .as_ref()
            .filter(|c| c.is_connected())
            .ok_or(ManagerError::Client(ClientError::NotConnected))
    }

    /// Reaps the daemon if this manager spawned it and it has exited.
    fn reap(&mut self) {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(session_id = %self.id, %status, "daemon reaped");
                    self.child = None;
                }
                Ok(None) => {}
                Err(e) => debug!(session_id = %self.id, error = %e, "failed to poll daemon"),
            }
        }
    }
}

pub(crate) struct ManagerActor {
    receiver: mpsc::Receiver<ManagerCommand>,
    /// Weak so spawned tasks never keep the actor alive on their own.
    commands: mpsc::WeakSender<ManagerCommand>,
    config: Arc<ManagerConfig>,
    sessions: HashMap<SessionId, ManagedSession>,
    reserved: HashSet<SessionId>,
}

impl ManagerActor {
    pub fn new(
        receiver: mpsc::Receiver<ManagerCommand>,
        commands: mpsc::WeakSender<ManagerCommand>,
        config: Arc<ManagerConfig>,
    ) -> Self {
        Self {
            receiver,
            commands,
            config,
            sessions: HashMap::new(),
            reserved: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        debug!("session manager starting");

        while let Some(cmd) = self.receiver.recv().await {
            if let ManagerCommand::Shutdown { respond_to } = cmd {
                self.detach_all();
                let _ = respond_to.send(());
                break;
            }
            self.handle_command(cmd);
        }

        self.detach_all();
        debug!("session manager stopped");
    }

    fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::Reserve {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.reserve(session_id));
            }
            ManagerCommand::Release { session_id } => {
                self.reserved.remove(&session_id);
            }
            ManagerCommand::Register {
                session,
                respond_to,
            } => {
                let _ = respond_to.send(self.register(*session));
            }
            ManagerCommand::Input {
                session_id,
                input,
                respond_to,
            } => {
                let _ = respond_to.send(self.input(&session_id, input));
            }
            ManagerCommand::Info {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.get(&session_id).map(ManagedSession::info));
            }
            ManagerCommand::StderrTail {
                session_id,
                respond_to,
            } => {
                let tail = self.get(&session_id).map(|s| snapshot(&s.stderr));
                let _ = respond_to.send(tail);
            }
            ManagerCommand::Replay {
                session_id,
                respond_to,
            } => {
                let replay = self.get(&session_id).map(|s| s.replay.clone());
                let _ = respond_to.send(replay);
            }
            ManagerCommand::List { respond_to } => {
                let mut handles: Vec<SessionHandle> = self
                    .sessions
                    .values()
                    .filter_map(|s| self.handle_for(s))
                    .collect();
                handles.sort_by(|a, b| a.id().as_str().cmp(b.id().as_str()));
                let _ = respond_to.send(handles);
            }
            ManagerCommand::BeginKill {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.begin_kill(&session_id));
            }
            ManagerCommand::KnownSockets { respond_to } => {
                let known = self
                    .sessions
                    .values()
                    .map(|s| (s.socket_path.clone(), s.identity))
                    .collect();
                let _ = respond_to.send(known);
            }
            ManagerCommand::ClientEvent {
                session_id,
                generation,
                event,
            } => self.on_client_event(&session_id, generation, event),
            ManagerCommand::PerformRestart {
                session_id,
                attempt,
            } => self.perform_restart(&session_id, attempt),
            ManagerCommand::CheckRestartReset { session_id } => self.check_restart_reset(&session_id),
            ManagerCommand::Reconnected {
                session_id,
                connection,
            } => self.on_reconnected(&session_id, *connection),
            ManagerCommand::ReconnectFailed {
                session_id,
                failure,
            } => self.on_reconnect_failed(&session_id, failure),
            ManagerCommand::Shutdown { respond_to } => {
                let _ = respond_to.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    fn get(&self, id: &SessionId) -> Result<&ManagedSession, ManagerError> {
        self.sessions
            .get(id)
            .ok_or_else(|| not_found(id))
    }

    fn handle_for(&self, session: &ManagedSession) -> Option<SessionHandle> {
        let sender = self.commands.upgrade()?;
        Some(SessionHandle::new(
            session.id.clone(),
            sender,
            session.events.clone(),
        ))
    }

    fn reserve(&mut self, id: SessionId) -> Result<(), ManagerError> {
        if self.sessions.contains_key(&id) || !self.reserved.insert(id.clone()) {
            return Err(DomainError::SessionAlreadyExists { session_id: id }.into());
        }
        Ok(())
    }

    fn register(&mut self, new: NewSession) -> Result<SessionHandle, ManagerError> {
        self.reserved.remove(&new.id);
        if self.sessions.contains_key(&new.id) {
            return Err(DomainError::SessionAlreadyExists { session_id: new.id }.into());
        }

        let (events, first) = broadcast::channel(EVENT_BUFFER);
        let Connection {
            client,
            welcome,
            events: client_events,
        } = new.connection;

        let session = ManagedSession {
            id: new.id.clone(),
            socket_path: new.socket_path,
            identity: new.identity,
            child: new.child,
            replay: client.replay_data().clone(),
            client: Some(client),
            generation: 0,
            welcome,
            spawn_spec: new.spawn_spec,
            keep_alive: new.keep_alive,
            restart_policy: new.restart_policy,
            restart_state: RestartState::new(),
            exhausted: false,
            restart_pending: false,
            last_exit: None,
            stderr: new.stderr,
            state: SessionState::Connected,
            events,
            reconnect: None,
        };
        if new.started_here && !session.replay.is_empty() {
            session.emit(SessionEvent::Data(session.replay.clone()));
        }
        self.spawn_event_pump(&session.id, session.generation, client_events);

        let sender = self.commands.upgrade().ok_or(ManagerError::ChannelClosed)?;
        let handle = SessionHandle::with_first_subscriber(
            session.id.clone(),
            sender,
            session.events.clone(),
            first,
        );
        info!(
            session_id = %session.id,
            pid = session.identity.pid,
            socket = %session.socket_path.display(),
            "session registered"
        );
        self.sessions.insert(new.id, session);
        Ok(handle)
    }

    fn input(&mut self, id: &SessionId, input: SessionInput) -> Result<(), ManagerError> {
        let session = self.sessions.get_mut(id).ok_or_else(|| not_found(id))?;
        let client = session.client()?;
        match input {
            SessionInput::Data(data) => client.write(data)?,
            SessionInput::Resize { cols, rows } => {
                client.resize(cols, rows)?;
                session.welcome.cols = cols;
                session.welcome.rows = rows;
            }
            SessionInput::Signal(signal) => client.signal(signal)?,
            SessionInput::Spawn(spec) => {
                client.spawn(spec.clone())?;
                // A manual spawn starts a fresh restart budget.
                session.spawn_spec = Some(spec);
                session.restart_state = RestartState::new();
                session.exhausted = false;
                session.state = SessionState::Connected;
            }
        }
        Ok(())
    }

    fn begin_kill(&mut self, id: &SessionId) -> Option<KillTarget> {
        let mut session = self.sessions.remove(id)?;
        session.state = SessionState::Killed;
        if let Some(token) = session.reconnect.take() {
            token.cancel();
        }
        if let Some(client) = session.client.take() {
            client.close();
        }
        Some(KillTarget {
            identity: session.identity,
            socket_path: session.socket_path,
            child: session.child,
            events: session.events,
        })
    }

    fn detach_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            if let Some(token) = session.reconnect.take() {
                token.cancel();
            }
            if let Some(client) = session.client.take() {
                client.close();
            }
            debug!(session_id = %session.id, "detached from session");
        }
        self.reserved.clear();
    }

    // ------------------------------------------------------------------------
    // Client events
    // ------------------------------------------------------------------------

    fn spawn_event_pump(
        &self,
        id: &SessionId,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        let commands = self.commands.clone();
        let session_id = id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(sender) = commands.upgrade() else {
                    break;
                };
                let cmd = ManagerCommand::ClientEvent {
                    session_id: session_id.clone(),
                    generation,
                    event,
                };
                if sender.send(cmd).await.is_err() {
                    break;
                }
            }
        });
    }

    fn on_client_event(&mut self, id: &SessionId, generation: u64, event: ClientEvent) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.generation != generation {
            return;
        }

        match event {
            ClientEvent::Data(data) => session.emit(SessionEvent::Data(data)),
            ClientEvent::Pong(_) => debug!(session_id = %id, "pong"),
            ClientEvent::Error(message) => {
                warn!(session_id = %id, error = %message, "session connection error");
                session.emit(SessionEvent::Error(message));
            }
            ClientEvent::Exit { code, signal } => self.on_exit(id, Exit { code, signal }),
            ClientEvent::Close => self.on_close(id),
        }
    }

    fn on_exit(&mut self, id: &SessionId, exit: Exit) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        info!(session_id = %id, code = ?exit.code, signal = ?exit.signal, "session process exited");
        session.last_exit = Some(exit);
        session.emit(SessionEvent::Exit {
            code: exit.code,
            signal: exit.signal,
        });

        let decision = if session.spawn_spec.is_some() {
            session
                .restart_state
                .on_exit(&session.restart_policy, Instant::now())
        } else {
            RestartDecision::Disabled
        };

        match decision {
            RestartDecision::Disabled => session.state = SessionState::Exited,
            RestartDecision::Restart { attempt, delay } => {
                info!(
                    session_id = %id,
                    restart_count = attempt,
                    max_restarts = session.restart_policy.max_restarts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling restart"
                );
                session.restart_pending = true;
                session.state = SessionState::Starting;
                self.send_later(delay, ManagerCommand::PerformRestart {
                    session_id: id.clone(),
                    attempt,
                });
            }
            RestartDecision::Exhausted { restarts } => {
                warn!(
                    session_id = %id,
                    restart_count = restarts,
                    max_restarts = session.restart_policy.max_restarts,
                    "restart budget exhausted"
                );
                session.exhausted = true;
                session.state = SessionState::Exited;
                session.emit(SessionEvent::RestartExhausted { restarts });
            }
        }
    }

    fn perform_restart(&mut self, id: &SessionId, attempt: u32) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.restart_pending = false;
        let Some(spec) = session.spawn_spec.clone() else {
            return;
        };

        let sent = session.client().and_then(|c| c.spawn(spec).map_err(ManagerError::from));
        match sent {
            Ok(()) => {
                info!(
                    session_id = %id,
                    restart_count = attempt,
                    max_restarts = session.restart_policy.max_restarts,
                    "session restarted"
                );
                session.restart_state.restarted(Instant::now());
                session.state = SessionState::Connected;
                session.emit(SessionEvent::Restarted { attempt });
                let reset_after = session.restart_policy.reset_after();
                self.send_later(reset_after, ManagerCommand::CheckRestartReset {
                    session_id: id.clone(),
                });
            }
            Err(e) => {
                warn!(session_id = %id, restart_count = attempt, error = %e, "restart skipped");
                session.state = SessionState::Exited;
            }
        }
    }

    fn check_restart_reset(&mut self, id: &SessionId) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.exhausted || session.restart_pending || session.state != SessionState::Connected {
            return;
        }
        if session
            .restart_state
            .maybe_reset(&session.restart_policy, Instant::now())
        {
            debug!(session_id = %id, "restart counter reset");
        }
    }

    fn on_close(&mut self, id: &SessionId) {
        let auto_reconnect = self.config.auto_reconnect;
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.client = None;
        session.reap();
        session.emit(SessionEvent::Close);

        // The daemon stops on its own once the exit has been delivered.
        let finished = session.state == SessionState::Exited && !session.keep_alive;
        if finished || !session.identity.is_alive() {
            if !session.state.is_terminal() {
                info!(session_id = %id, "session daemon is gone");
                session.state = SessionState::Exited;
            }
            return;
        }

        if !auto_reconnect {
            if !session.state.is_terminal() {
                session.state = SessionState::Disconnected;
            }
            return;
        }

        info!(session_id = %id, "connection lost, reconnecting");
        if !session.state.is_terminal() {
            session.state = SessionState::Reconnecting;
        }
        let cancel = CancellationToken::new();
        session.reconnect = Some(cancel.clone());

        let session_id = id.clone();
        let socket_path = session.socket_path.clone();
        let identity = session.identity;
        let connect_timeout = self.config.connect_timeout();
        let backoff = Backoff::from_config(&self.config);
        let commands = self.commands.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = reconnect_with_backoff(&session_id, &socket_path, identity, connect_timeout, backoff) => result,
            };
            let cmd = match result {
                Ok(connection) => ManagerCommand::Reconnected {
                    session_id,
                    connection: Box::new(connection),
                },
                Err(failure) => ManagerCommand::ReconnectFailed {
                    session_id,
                    failure,
                },
            };
            if let Some(sender) = commands.upgrade() {
                let _ = sender.send(cmd).await;
            }
        });
    }

    fn on_reconnected(&mut self, id: &SessionId, connection: Connection) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let Connection {
            client,
            welcome,
            events,
        } = connection;

        session.reconnect = None;
        session.generation += 1;
        session.replay = client.replay_data().clone();
        session.welcome = welcome;
        session.client = Some(client);
        if !session.state.is_terminal() {
            session.state = SessionState::Connected;
        }
        info!(session_id = %id, "session reconnected");
        session.emit(SessionEvent::Reconnected);

        let generation = session.generation;
        self.spawn_event_pump(id, generation, events);
    }

    fn on_reconnect_failed(&mut self, id: &SessionId, failure: ReconnectFailure) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        session.reconnect = None;
        warn!(session_id = %id, reason = failure.reason(), error = %failure, "reconnect failed");
        session.emit(SessionEvent::Error(failure.to_string()));
        if !session.state.is_terminal() {
            session.state = if failure.is_retryable() {
                SessionState::Disconnected
            } else {
                SessionState::Exited
            };
        }
    }

    /// Delivers `cmd` to this actor after `delay`.
    fn send_later(&self, delay: std::time::Duration, cmd: ManagerCommand) {
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(sender) = commands.upgrade() {
                let _ = sender.send(cmd).await;
            }
        });
    }
}

fn not_found(id: &SessionId) -> ManagerError {
    DomainError::SessionNotFound {
        session_id: id.clone(),
    }
    .into()
}
