//! Scriptable pty for tests.
//!
//! `FakePtySpawner::new()` returns the spawner together with a
//! [`FakePtyController`] that drives whatever process is currently "running":
//! emit output, make it exit, and inspect what the daemon wrote to it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use tether_protocol::Signal;

use super::{ExitStatus, PtyError, PtyEvent, PtyEvents, PtyProcess, PtySpawner, SpawnSpec, TermSize};

/// First pid handed out by the fake.
const FAKE_PID_BASE: u32 = 40_000;

#[derive(Debug, Default)]
struct FakeState {
    spawns: Vec<(SpawnSpec, TermSize)>,
    current: Option<mpsc::UnboundedSender<PtyEvent>>,
    written: Vec<u8>,
    resizes: Vec<TermSize>,
    signals: Vec<Option<Signal>>,
    fail_next_spawn: bool,
}

fn lock(state: &Mutex<FakeState>) -> MutexGuard<'_, FakeState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Spawner half of the fake.
#[derive(Debug, Clone)]
pub struct FakePtySpawner {
    state: Arc<Mutex<FakeState>>,
}

/// Test-side handle onto the fake.
#[derive(Debug, Clone)]
pub struct FakePtyController {
    state: Arc<Mutex<FakeState>>,
}

impl FakePtySpawner {
    pub fn new() -> (Self, FakePtyController) {
        let state = Arc::new(Mutex::new(FakeState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            FakePtyController { state },
        )
    }
}

impl PtySpawner for FakePtySpawner {
    fn spawn(
        &self,
        spec: &SpawnSpec,
        size: TermSize,
    ) -> Result<(Box<dyn PtyProcess>, PtyEvents), PtyError> {
        let mut state = lock(&self.state);
        if state.fail_next_spawn {
            state.fail_next_spawn = false;
            return Err(PtyError::Spawn {
                command: spec.command.clone(),
                message: "scripted failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.spawns.push((spec.clone(), size));
        state.current = Some(tx.clone());
        let pid = FAKE_PID_BASE + state.spawns.len() as u32;

        let process = FakePty {
            pid,
            events: tx,
            state: Arc::clone(&self.state),
        };
        Ok((Box::new(process), rx))
    }
}

struct FakePty {
    pid: u32,
    events: mpsc::UnboundedSender<PtyEvent>,
    state: Arc<Mutex<FakeState>>,
}

impl PtyProcess for FakePty {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        lock(&self.state).written.extend_from_slice(data);
        Ok(())
    }

    fn resize(&mut self, size: TermSize) -> Result<(), PtyError> {
        lock(&self.state).resizes.push(size);
        Ok(())
    }

    fn kill(&mut self, signal: Option<Signal>) -> Result<(), PtyError> {
        lock(&self.state).signals.push(signal);
        let fatal = matches!(signal, None | Some(Signal::Kill | Signal::Term | Signal::Hup | Signal::Int));
        if fatal {
            let raw = signal.unwrap_or(Signal::Kill).as_raw();
            let _ = self.events.send(PtyEvent::Exit(ExitStatus {
                code: None,
                signal: Some(raw),
            }));
        }
        Ok(())
    }
}

impl FakePtyController {
    /// Emits output from the current process. Returns false if none is running.
    pub fn emit(&self, data: impl Into<Bytes>) -> bool {
        match &lock(&self.state).current {
            Some(tx) => tx.send(PtyEvent::Data(data.into())).is_ok(),
            None => false,
        }
    }

    /// Makes the current process exit with `code`.
    pub fn exit(&self, code: i32) -> bool {
        let state = lock(&self.state);
        match &state.current {
            Some(tx) => tx
                .send(PtyEvent::Exit(ExitStatus {
                    code: Some(code),
                    signal: None,
                }))
                .is_ok(),
            None => false,
        }
    }

    /// Makes the next spawn fail.
    pub fn fail_next_spawn(&self) {
        lock(&self.state).fail_next_spawn = true;
    }

    /// Everything written to any fake process so far.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state).written.clone()
    }

    pub fn resizes(&self) -> Vec<TermSize> {
        lock(&self.state).resizes.clone()
    }

    pub fn signals(&self) -> Vec<Option<Signal>> {
        lock(&self.state).signals.clone()
    }

    pub fn spawn_count(&self) -> usize {
        lock(&self.state).spawns.len()
    }

    pub fn spawns(&self) -> Vec<(SpawnSpec, TermSize)> {
        lock(&self.state).spawns.clone()
    }

    /// Polls until `check` holds or `timeout` passes.
    pub async fn wait_until<F>(&self, timeout: Duration, mut check: F) -> bool
    where
        F: FnMut(&FakePtyController) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if check(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check(self)
    }
}
