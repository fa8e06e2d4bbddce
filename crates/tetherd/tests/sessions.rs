//! End-to-end: the session manager driving the real `tetherd` binary on a
//! real pty.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::broadcast;

use tether_core::{sidecar, RestartPolicy, SessionState};
use tether_supervisor::{
    CreateSessionOptions, ManagerConfig, ManagerError, SessionEvent, SessionHandle, SessionInfo,
    SessionManager,
};

const STEP: Duration = Duration::from_secs(10);

fn config(dir: &TempDir) -> ManagerConfig {
    ManagerConfig {
        daemon_binary: Some(PathBuf::from(env!("CARGO_BIN_EXE_tetherd"))),
        kill_grace_ms: 2_000,
        ..ManagerConfig::with_socket_dir(dir.path().join("sockets"))
    }
}

async fn wait_info(handle: &SessionHandle, check: impl Fn(&SessionInfo) -> bool) -> SessionInfo {
    tokio::time::timeout(STEP, async {
        loop {
            let info = handle.status().await.unwrap();
            if check(&info) {
                return info;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("session never reached the expected state")
}

async fn wait_gone(path: &Path) {
    let gone = tokio::time::timeout(STEP, async {
        while std::fs::symlink_metadata(path).is_ok() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "{} was not removed", path.display());
}

/// Collects output until `needle` shows up.
async fn read_until(rx: &mut broadcast::Receiver<SessionEvent>, mut seen: String, needle: &str) -> String {
    tokio::time::timeout(STEP, async {
        while !seen.contains(needle) {
            match rx.recv().await {
                Ok(SessionEvent::Data(data)) => seen.push_str(&String::from_utf8_lossy(&data)),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        seen
    })
    .await
    .expect("expected output never arrived")
}

fn lossy(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Collects output until the exit event.
async fn output_until_exit(
    rx: &mut broadcast::Receiver<SessionEvent>,
) -> (String, Option<i32>, Option<i32>) {
    tokio::time::timeout(STEP, async {
        let mut seen = String::new();
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Data(data)) => seen.push_str(&String::from_utf8_lossy(&data)),
                Ok(SessionEvent::Exit { code, signal }) => return (seen, code, signal),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("events closed before exit"),
            }
        }
    })
    .await
    .expect("exit never arrived")
}

/// Waits for the next restart and returns its attempt number.
async fn next_restart(rx: &mut broadcast::Receiver<SessionEvent>) -> u32 {
    tokio::time::timeout(STEP, async {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Restarted { attempt }) => return attempt,
                Ok(SessionEvent::RestartExhausted { restarts }) => {
                    panic!("restart budget exhausted after {restarts} restarts")
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("events closed"),
            }
        }
    })
    .await
    .expect("no restart happened")
}

#[tokio::test]
async fn echo_hello_is_delivered_with_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SessionManager::start(config(&dir));

    let handle = manager
        .create_session(CreateSessionOptions::new("echo").args(["hello"]))
        .await
        .unwrap();
    let socket = handle.status().await.unwrap().socket_path;

    // Subscribing after create still sees the whole short-lived run.
    let mut events = handle.subscribe();
    let (output, code, signal) = output_until_exit(&mut events).await;
    assert!(output.contains("hello"), "output was {output:?}");
    assert_eq!((code, signal), (Some(0), None));

    let info = wait_info(&handle, |i| i.state == SessionState::Exited).await;
    assert_eq!(info.last_exit.and_then(|e| e.code), Some(0));

    // Without keep-alive the daemon goes away once the exit is delivered.
    wait_gone(&socket).await;
    wait_gone(&sidecar::sidecar_path(&socket)).await;
}

#[tokio::test]
async fn interactive_shell_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SessionManager::start(config(&dir));

    let handle = manager
        .create_session(CreateSessionOptions::new("sh").id("shell").size(100, 30))
        .await
        .unwrap();
    let mut events = handle.subscribe();

    handle.write(Bytes::from_static(b"echo marker-$((40+2))\n")).await.unwrap();
    let output = read_until(&mut events, String::new(), "marker-42").await;
    assert!(output.contains("marker-42"));

    manager.kill_session(handle.id()).await.unwrap();
}

#[tokio::test]
async fn kill_removes_socket_and_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SessionManager::start(config(&dir));

    let handle = manager
        .create_session(CreateSessionOptions::new("sleep").args(["30"]))
        .await
        .unwrap();
    let info = handle.status().await.unwrap();
    assert!(info.identity.is_alive());
    assert!(info.socket_path.exists());

    manager.kill_session(handle.id()).await.unwrap();

    assert!(std::fs::symlink_metadata(&info.socket_path).is_err());
    assert!(!sidecar::sidecar_path(&info.socket_path).exists());
    assert!(!info.identity.is_alive());
    assert!(manager.list_sessions().await.unwrap().is_empty());

    // Idempotent.
    manager.kill_session(handle.id()).await.unwrap();
}

#[tokio::test]
async fn restart_budget_is_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SessionManager::start(config(&dir));

    let policy = RestartPolicy {
        enabled: true,
        delay_ms: 200,
        max_restarts: 3,
        reset_after_ms: 60_000,
    };
    let handle = manager
        .create_session(
            CreateSessionOptions::new("sh")
                .args(["-c", "exit 1"])
                .restart_policy(policy),
        )
        .await
        .unwrap();
    let mut events = handle.subscribe();

    let exhausted = tokio::time::timeout(STEP, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::RestartExhausted { restarts }) => return restarts,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("events closed"),
            }
        }
    })
    .await
    .expect("restart budget was never exhausted");
    assert_eq!(exhausted, 3);

    let info = handle.status().await.unwrap();
    assert!(info.exhausted);
    assert_eq!(info.restart_count, 3);
    assert_eq!(info.state, SessionState::Exited);
    assert_eq!(info.last_exit.and_then(|e| e.code), Some(1));

    manager.kill_session(handle.id()).await.unwrap();
}

#[tokio::test]
async fn restart_counter_resets_after_a_stable_run() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SessionManager::start(config(&dir));

    let policy = RestartPolicy {
        enabled: true,
        delay_ms: 500,
        max_restarts: 1,
        reset_after_ms: 300,
    };
    let handle = manager
        .create_session(
            CreateSessionOptions::new("sh")
                .args(["-c", "sleep 1; exit 1"])
                .restart_policy(policy),
        )
        .await
        .unwrap();
    let mut events = handle.subscribe();

    // Between the exit and the respawn the session is starting again.
    let pending = wait_info(&handle, |i| i.state == SessionState::Starting).await;
    assert_eq!(pending.restart_count, 1);

    let first = next_restart(&mut events).await;
    assert_eq!(first, 1);

    // The respawned process runs for 1s, well past the 300ms reset window.
    let stable = wait_info(&handle, |i| i.restart_count == 0).await;
    assert!(stable.last_exit.is_some());
    assert_eq!(stable.state, SessionState::Connected);

    // Its exit therefore gets a fresh budget instead of exhausting it.
    let second = next_restart(&mut events).await;
    assert_eq!(second, 1);
    assert!(!handle.status().await.unwrap().exhausted);

    manager.kill_session(handle.id()).await.unwrap();
}

#[tokio::test]
async fn second_manager_adopts_running_session() {
    let dir = tempfile::tempdir().unwrap();
    let first = SessionManager::start(config(&dir));

    let handle = first
        .create_session(CreateSessionOptions::new("sh").id("survivor"))
        .await
        .unwrap();
    handle.write(Bytes::from_static(b"echo first-$((1+1))\n")).await.unwrap();
    let mut events = handle.subscribe();
    read_until(&mut events, String::new(), "first-2").await;

    let info = handle.status().await.unwrap();
    first.shutdown().await;
    assert!(info.identity.is_alive());

    let second = SessionManager::start(config(&dir));
    let adopted = second
        .reconnect_session(
            "survivor",
            &info.socket_path,
            info.identity.pid,
            info.identity.start_time,
        )
        .await
        .unwrap();

    let replay = lossy(&adopted.replay().await.unwrap());
    assert!(replay.contains("first-2"), "replay was {replay:?}");

    let mut events = adopted.subscribe();
    adopted.write(Bytes::from_static(b"echo second-$((2+2))\n")).await.unwrap();
    read_until(&mut events, String::new(), "second-4").await;

    second.kill_session(adopted.id()).await.unwrap();
    assert!(!info.identity.is_alive());
}

#[tokio::test]
async fn cleanup_keeps_live_socket_and_removes_dead_one() {
    let dir = tempfile::tempdir().unwrap();
    let manager = SessionManager::start(config(&dir));

    let handle = manager
        .create_session(CreateSessionOptions::new("sleep").args(["30"]))
        .await
        .unwrap();
    let live = handle.status().await.unwrap().socket_path;

    let dead = manager.config().socket_dir.join("dead.sock");
    drop(std::os::unix::net::UnixListener::bind(&dead).unwrap());

    let report = manager.cleanup_stale_sockets().await.unwrap();
    assert_eq!(report.kept, vec![live.clone()]);
    assert_eq!(report.removed, vec![dead.clone()]);
    assert!(live.exists());
    assert!(std::fs::symlink_metadata(&dead).is_err());

    manager.kill_session(handle.id()).await.unwrap();
}

#[tokio::test]
async fn failed_start_reports_daemon_stderr() {
    let dir = tempfile::tempdir().unwrap();
    // A regular file where the socket directory should be.
    let blocker = dir.path().join("sockets");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let manager = SessionManager::start(config(&dir));
    let err = manager
        .create_session(CreateSessionOptions::new("sh"))
        .await
        .unwrap_err();

    assert!(matches!(err, ManagerError::SpawnFailed { .. }), "{err}");
    assert!(!err.stderr().is_empty());
    assert!(manager.list_sessions().await.unwrap().is_empty());
}
