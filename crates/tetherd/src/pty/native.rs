//! `portable-pty` backend.
//!
//! Each spawned process gets three helper threads: a reader that forwards
//! master output as [`PtyEvent::Data`], a writer that drains queued input, and
//! a waiter that reaps the child and emits [`PtyEvent::Exit`] once the reader
//! has seen end-of-file (or a short grace period has passed, for children that
//! leave descendants holding the slave open).

use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_protocol::Signal;

use super::{ExitStatus, PtyError, PtyEvent, PtyEvents, PtyProcess, PtySpawner, SpawnSpec, TermSize};

/// Read chunk size for master output.
const READ_BUF_SIZE: usize = 8192;

/// How long the waiter holds EXIT back for trailing output.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

fn pty_size(size: TermSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawns processes on real pseudo-terminals.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativePtySpawner;

impl NativePtySpawner {
    pub fn new() -> Self {
        Self
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(
        &self,
        spec: &SpawnSpec,
        size: TermSize,
    ) -> Result<(Box<dyn PtyProcess>, PtyEvents), PtyError> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.command);
        cmd.args(&spec.args);
        match &spec.cwd {
            Some(cwd) => cmd.cwd(cwd),
            None => {
                if let Ok(cwd) = std::env::current_dir() {
                    cmd.cwd(cwd);
                }
            }
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::Spawn {
                command: spec.command.clone(),
                message: e.to_string(),
            })?;
        // The child holds its own copy; ours would keep the master from
        // seeing EOF when the child exits.
        drop(pair.slave);

        let pid = child.process_id().ok_or_else(|| PtyError::Spawn {
            command: spec.command.clone(),
            message: "child has no pid".to_string(),
        })?;

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(format!("failed to take pty writer: {e}")))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = std_mpsc::channel();
        let (input_tx, input_rx) = std_mpsc::channel::<Vec<u8>>();

        spawn_thread("tetherd-pty-read", {
            let event_tx = event_tx.clone();
            move || read_loop(reader, event_tx, done_tx)
        })?;
        spawn_thread("tetherd-pty-write", move || write_loop(writer, input_rx))?;
        spawn_thread("tetherd-pty-wait", move || wait_loop(pid, event_tx, done_rx))?;

        info!(
            pid,
            command = %spec.command,
            cols = size.cols,
            rows = size.rows,
            "pty process spawned"
        );

        let process = NativePty {
            pid,
            master: pair.master,
            input: input_tx,
            _child: child,
        };
        Ok((Box::new(process), event_rx))
    }
}

fn spawn_thread<F>(name: &str, f: F) -> Result<(), PtyError>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map(|_| ())
        .map_err(|e| PtyError::Io(format!("failed to start {name} thread: {e}")))
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    events: mpsc::UnboundedSender<PtyEvent>,
    done: std_mpsc::Sender<()>,
) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(buf.get(..n).unwrap_or_default());
                if events.send(PtyEvent::Data(chunk)).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once every slave descriptor is closed.
            Err(e) => {
                debug!(error = %e, "pty reader finished");
                break;
            }
        }
    }
    let _ = done.send(());
}

fn write_loop(mut writer: Box<dyn Write + Send>, input: std_mpsc::Receiver<Vec<u8>>) {
    while let Ok(data) = input.recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            debug!(error = %e, "pty writer finished");
            break;
        }
    }
}

fn wait_loop(pid: u32, events: mpsc::UnboundedSender<PtyEvent>, reader_done: std_mpsc::Receiver<()>) {
    let status = wait_pid(pid);
    if reader_done.recv_timeout(OUTPUT_DRAIN_TIMEOUT).is_err() {
        debug!(pid, "pty output still open after exit, sending EXIT anyway");
    }
    info!(pid, code = ?status.code, signal = ?status.signal, "pty process exited");
    let _ = events.send(PtyEvent::Exit(status));
}

/// Blocks until `pid` terminates and decodes its wait status.
fn wait_pid(pid: u32) -> ExitStatus {
    let Ok(raw_pid) = libc::pid_t::try_from(pid) else {
        return ExitStatus::default();
    };
    let mut status: libc::c_int = 0;
    loop {
        // SAFETY: status is a valid out-pointer for the duration of the call.
        let rc = unsafe { libc::waitpid(raw_pid, &mut status, 0) };
        if rc == raw_pid {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        warn!(pid, error = %err, "waitpid failed");
        return ExitStatus::default();
    }

    if libc::WIFEXITED(status) {
        ExitStatus {
            code: Some(libc::WEXITSTATUS(status)),
            signal: None,
        }
    } else if libc::WIFSIGNALED(status) {
        ExitStatus {
            code: None,
            signal: Some(libc::WTERMSIG(status)),
        }
    } else {
        ExitStatus::default()
    }
}

struct NativePty {
    pid: u32,
    master: Box<dyn MasterPty + Send>,
    input: std_mpsc::Sender<Vec<u8>>,
    _child: Box<dyn portable_pty::Child + Send>,
}

impl PtyProcess for NativePty {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.input.send(data.to_vec()).map_err(|_| PtyError::Closed)
    }

    fn resize(&mut self, size: TermSize) -> Result<(), PtyError> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| PtyError::Io(format!("resize failed: {e}")))
    }

    fn kill(&mut self, signal: Option<Signal>) -> Result<(), PtyError> {
        let raw = signal.unwrap_or(Signal::Kill).as_raw();
        match tether_core::process::send_signal(self.pid, raw) {
            Ok(true) => Ok(()),
            Ok(false) => Err(PtyError::Closed),
            Err(e) => Err(PtyError::Io(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(command: &str, args: &[&str]) -> SpawnSpec {
        SpawnSpec {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    async fn collect(mut events: PtyEvents) -> (Vec<u8>, ExitStatus) {
        let mut out = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), events.recv()).await {
                Ok(Some(PtyEvent::Data(d))) => out.extend_from_slice(&d),
                Ok(Some(PtyEvent::Exit(status))) => return (out, status),
                other => panic!("unexpected pty event stream end: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_output_then_exit() {
        let (_proc, events) = NativePtySpawner
            .spawn(&spec("sh", &["-c", "echo hello; exit 3"]), TermSize::default())
            .unwrap();
        let (out, status) = collect(events).await;
        assert!(String::from_utf8_lossy(&out).contains("hello"));
        assert_eq!(status.code, Some(3));
    }

    #[tokio::test]
    async fn test_kill_reports_signal() {
        let (mut proc, events) = NativePtySpawner
            .spawn(&spec("sleep", &["30"]), TermSize::default())
            .unwrap();
        assert!(proc.pid().is_some());
        proc.kill(None).unwrap();
        let (_, status) = collect(events).await;
        assert_eq!(status.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn test_input_reaches_process() {
        let (mut proc, events) = NativePtySpawner
            .spawn(&spec("sh", &["-c", "read line; echo got:$line"]), TermSize::default())
            .unwrap();
        proc.write(b"ping\n").unwrap();
        let (out, _) = collect(events).await;
        assert!(String::from_utf8_lossy(&out).contains("got:ping"));
    }

    #[test]
    fn test_spawn_missing_binary_fails() {
        let result = NativePtySpawner.spawn(
            &spec("/nonexistent/tether-test-binary", &[]),
            TermSize::default(),
        );
        assert!(result.is_err());
    }
}
