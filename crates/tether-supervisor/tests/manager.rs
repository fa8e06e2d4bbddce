//! Session manager against in-process daemons with a fake pty.
//!
//! The daemons run inside the test process, so their identity is the test
//! process itself. Nothing here kills a session: that would signal the test
//! runner. Killing is covered by the end-to-end tests with the real binary.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use tether_core::{ProcessIdentity, SessionId, SessionState};
use tether_protocol::{FrameCodec, Hello, Message};
use tether_supervisor::{
    ManagerConfig, ManagerError, ReconnectFailure, SessionEvent, SessionManager,
};
use tetherd::daemon::listener::bind_socket;
use tetherd::pty::{FakePtyController, FakePtySpawner};
use tetherd::{DaemonConfig, DaemonHandle, SessionDaemon, SpawnSpec, TermSize};

const STEP: Duration = Duration::from_secs(5);

struct Daemon {
    socket: PathBuf,
    fake: FakePtyController,
    handle: DaemonHandle,
    _serve: JoinHandle<()>,
}

async fn start_daemon(dir: &Path, name: &str) -> Daemon {
    let socket = dir.join(format!("{name}.sock"));
    let (spawner, fake) = FakePtySpawner::new();
    let spec = SpawnSpec {
        command: "fake-shell".to_string(),
        ..SpawnSpec::default()
    };
    let config = DaemonConfig::new(spec, TermSize::new(120, 40));
    let listener = bind_socket(&socket).unwrap();
    let daemon = SessionDaemon::start(config, Arc::new(spawner)).unwrap();
    let handle = daemon.handle();
    let serve = tokio::spawn(daemon.serve(listener));
    Daemon {
        socket,
        fake,
        handle,
        _serve: serve,
    }
}

fn manager(dir: &TempDir) -> SessionManager {
    SessionManager::start(ManagerConfig {
        reconnect_initial_delay_ms: 10,
        reconnect_max_delay_ms: 50,
        ..ManagerConfig::with_socket_dir(dir.path())
    })
}

fn me() -> ProcessIdentity {
    ProcessIdentity::current().unwrap()
}

async fn next_event(
    rx: &mut broadcast::Receiver<SessionEvent>,
    want: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(STEP, async {
        loop {
            match rx.recv().await {
                Ok(event) if want(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for a session event")
}

#[tokio::test]
async fn adopted_session_streams_output_and_forwards_input() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), "adopted").await;
    assert!(daemon.fake.emit("before adoption\n"));
    let buffered = tokio::time::timeout(STEP, async {
        while daemon.handle.status().await.unwrap().replay_bytes == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(buffered.is_ok());

    let manager = manager(&dir);
    let id = me();
    let handle = manager
        .reconnect_session("adopted", &daemon.socket, id.pid, id.start_time)
        .await
        .unwrap();
    let mut events = handle.subscribe();

    let replay = handle.replay().await.unwrap();
    assert_eq!(replay.as_ref(), b"before adoption\n");

    daemon.fake.emit("live output\n");
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Data(_))).await;
    assert_eq!(event, SessionEvent::Data(Bytes::from_static(b"live output\n")));

    handle.write(Bytes::from_static(b"ls\n")).await.unwrap();
    handle.resize(90, 20).await.unwrap();
    assert!(
        daemon
            .fake
            .wait_until(STEP, |f| f.written() == b"ls\n" && f.resizes() == vec![TermSize::new(90, 20)])
            .await
    );

    let info = handle.status().await.unwrap();
    assert_eq!(info.state, SessionState::Connected);
    assert_eq!(info.identity, id);
    assert_eq!((info.cols, info.rows), (90, 20));
    assert!(info.connected);

    let sessions = manager.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].id().as_str(), "adopted");
}

#[tokio::test]
async fn reconnect_to_dead_process_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();

    let manager = manager(&dir);
    let err = manager
        .reconnect_session("gone", dir.path().join("gone.sock"), pid, 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ManagerError::Reconnect {
            failure: ReconnectFailure::ProcessDead { .. },
            ..
        }
    ));
    assert!(manager.list_sessions().await.unwrap().is_empty());
}

#[tokio::test]
async fn reconnect_with_wrong_start_time_reports_pid_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), "reused").await;
    let id = me();

    let manager = manager(&dir);
    let err = manager
        .reconnect_session("reused", &daemon.socket, id.pid, id.start_time + 1)
        .await
        .unwrap_err();
    match err {
        ManagerError::Reconnect {
            failure: ReconnectFailure::PidReused { pid, expected, actual },
            ..
        } => {
            assert_eq!(pid, id.pid);
            assert_eq!(expected, id.start_time + 1);
            assert_eq!(actual, id.start_time);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn reconnect_to_missing_socket_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let id = me();

    let manager = manager(&dir);
    let err = manager
        .reconnect_session("nosock", dir.path().join("nosock.sock"), id.pid, id.start_time)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ManagerError::Reconnect {
            failure: ReconnectFailure::SocketInvalid { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn duplicate_session_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), "dup").await;
    let id = me();

    let manager = manager(&dir);
    manager
        .reconnect_session("dup", &daemon.socket, id.pid, id.start_time)
        .await
        .unwrap();
    let err = manager
        .reconnect_session("dup", &daemon.socket, id.pid, id.start_time)
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::Domain(_)));
}

#[tokio::test]
async fn superseded_connection_is_reestablished() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), "contested").await;
    let id = me();

    let manager = manager(&dir);
    let handle = manager
        .reconnect_session("contested", &daemon.socket, id.pid, id.start_time)
        .await
        .unwrap();
    let mut events = handle.subscribe();

    // Another client attaches; the daemon drops the manager's connection.
    let stream = UnixStream::connect(&daemon.socket).await.unwrap();
    let mut intruder = Framed::new(stream, FrameCodec::new());
    intruder.send(Message::Hello(Hello::default())).await.unwrap();

    next_event(&mut events, |e| *e == SessionEvent::Close).await;
    next_event(&mut events, |e| *e == SessionEvent::Reconnected).await;

    let info = handle.status().await.unwrap();
    assert_eq!(info.state, SessionState::Connected);

    // The manager's reconnect in turn superseded the intruder.
    let closed = tokio::time::timeout(STEP, async {
        while let Some(Ok(_)) = intruder.next().await {}
    })
    .await;
    assert!(closed.is_ok());

    daemon.fake.emit("after reconnect\n");
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Data(_))).await;
    assert_eq!(event, SessionEvent::Data(Bytes::from_static(b"after reconnect\n")));
}

#[tokio::test]
async fn process_exit_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), "exits").await;
    let id = me();

    let manager = manager(&dir);
    let handle = manager
        .reconnect_session("exits", &daemon.socket, id.pid, id.start_time)
        .await
        .unwrap();
    let mut events = handle.subscribe();

    assert!(daemon.fake.exit(3));
    let event = next_event(&mut events, |e| matches!(e, SessionEvent::Exit { .. })).await;
    assert_eq!(
        event,
        SessionEvent::Exit {
            code: Some(3),
            signal: None
        }
    );

    let info = handle.status().await.unwrap();
    assert_eq!(info.state, SessionState::Exited);
    assert_eq!(info.last_exit.and_then(|e| e.code), Some(3));
}

#[tokio::test]
async fn cleanup_keeps_adopted_socket_and_removes_stale_one() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), "live").await;
    let stale = dir.path().join("stale.sock");
    drop(std::os::unix::net::UnixListener::bind(&stale).unwrap());

    let manager = manager(&dir);
    let id = me();
    manager
        .reconnect_session("live", &daemon.socket, id.pid, id.start_time)
        .await
        .unwrap();

    let report = manager.cleanup_stale_sockets().await.unwrap();
    assert_eq!(report.kept, vec![daemon.socket.clone()]);
    assert_eq!(report.removed, vec![stale.clone()]);
    assert!(daemon.socket.exists());
    assert!(!stale.exists());
}

#[tokio::test]
async fn shutdown_detaches_without_stopping_daemons() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), "kept").await;
    let id = me();

    let manager = manager(&dir);
    manager
        .reconnect_session("kept", &daemon.socket, id.pid, id.start_time)
        .await
        .unwrap();
    manager.shutdown().await;

    assert!(matches!(
        manager.list_sessions().await,
        Err(ManagerError::ChannelClosed)
    ));

    let detached = tokio::time::timeout(STEP, async {
        loop {
            if daemon.handle.status().await.unwrap().attached.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(detached.is_ok(), "daemon still sees the manager attached");
    assert!(daemon.socket.exists());
}

#[tokio::test]
async fn unknown_session_lookups_fail() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    let id = SessionId::new("missing");

    assert!(matches!(
        manager.session_info(&id).await,
        Err(ManagerError::Domain(_))
    ));
    assert!(manager.session(&id).await.unwrap().is_none());
    // Killing an unknown session is a no-op.
    manager.kill_session(&id).await.unwrap();
}

#[tokio::test]
async fn first_subscriber_sees_events_from_registration() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = start_daemon(dir.path(), "early").await;
    let id = me();

    let manager = manager(&dir);
    let handle = manager
        .reconnect_session("early", &daemon.socket, id.pid, id.start_time)
        .await
        .unwrap();

    assert!(daemon.fake.emit("quick\n"));
    assert!(daemon.fake.exit(0));
    let exited = tokio::time::timeout(STEP, async {
        while handle.status().await.unwrap().last_exit.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(exited.is_ok());

    // Nobody was listening while that happened.
    let mut first = handle.clone().subscribe();
    let data = next_event(&mut first, |e| matches!(e, SessionEvent::Data(_))).await;
    assert_eq!(data, SessionEvent::Data(Bytes::from_static(b"quick\n")));
    let exit = next_event(&mut first, |e| matches!(e, SessionEvent::Exit { .. })).await;
    assert_eq!(
        exit,
        SessionEvent::Exit {
            code: Some(0),
            signal: None
        }
    );
}
