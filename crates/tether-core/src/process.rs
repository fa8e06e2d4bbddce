//! Process identity, liveness and signalling.
//!
//! A pid alone is not an identity: pids are recycled by the kernel. A
//! [`ProcessIdentity`] pairs the pid with the process start time read from
//! `/proc/{pid}/stat` (field 22, clock ticks since boot), which is stable for
//! the lifetime of a process and differs for any later process that happens
//! to receive the same pid.
//!
//! # Panic-Free Guarantees
//!
//! Every `/proc` read and `kill(2)` call is fallible and reported through
//! `Option` or [`ProcessError`]; nothing here unwraps.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

// ============================================================================
// Constants
// ============================================================================

/// How often [`kill_gracefully`] polls for the process to disappear.
pub const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on the wait after SIGKILL before giving up.
pub const SIGKILL_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while inspecting or signalling processes.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// Pid 0 or a pid that does not fit in `pid_t`
    #[error("Invalid pid: {0}")]
    InvalidPid(u32),

    /// `kill(2)` failed for a reason other than the process being gone
    #[error("Failed to send signal {signal} to pid {pid}: {source}")]
    Signal {
        pid: u32,
        signal: i32,
        #[source]
        source: std::io::Error,
    },
}

// ============================================================================
// Identity
// ============================================================================

/// A pid paired with its start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: u64,
}

/// Result of comparing a recorded identity with the live process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityCheck {
    /// Same pid, same start time, not a zombie
    Alive,
    /// No process with this pid (or only a zombie)
    Dead,
    /// A different process now owns the pid
    PidReused { current_start_time: u64 },
}

impl ProcessIdentity {
    pub fn new(pid: u32, start_time: u64) -> Self {
        Self { pid, start_time }
    }

    /// Captures the identity of a currently running process.
    pub fn of(pid: u32) -> Option<Self> {
        read_start_time(pid).map(|start_time| Self { pid, start_time })
    }

    /// Identity of the calling process.
    pub fn current() -> Option<Self> {
        Self::of(std::process::id())
    }

    /// Compares this identity against `/proc`.
    pub fn check(&self) -> IdentityCheck {
        if !is_running(self.pid) {
            return IdentityCheck::Dead;
        }
        match read_start_time(self.pid) {
            Some(current) if current == self.start_time => IdentityCheck::Alive,
            Some(current) => {
                debug!(
                    pid = self.pid,
                    expected_start_time = self.start_time,
                    current_start_time = current,
                    "start time mismatch, pid reused"
                );
                IdentityCheck::PidReused {
                    current_start_time: current,
                }
            }
            None => IdentityCheck::Dead,
        }
    }

    /// Returns true only if the original process is still running.
    pub fn is_alive(&self) -> bool {
        self.check() == IdentityCheck::Alive
    }
}

/// Reads the process start time using the procfs crate.
///
/// Returns `None` if the process doesn't exist or can't be read.
pub fn read_start_time(pid: u32) -> Option<u64> {
    let pid = i32::try_from(pid).ok()?;
    let process = procfs::process::Process::new(pid).ok()?;
    let stat = process.stat().ok()?;
    Some(stat.starttime)
}

/// Returns true if a non-zombie process with this pid exists.
///
/// Zombies count as dead: the process has exited and is only waiting to be
/// reaped by its parent.
pub fn is_running(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    match procfs::process::Process::new(pid).and_then(|p| p.stat()) {
        Ok(stat) => stat.state != 'Z' && stat.state != 'X',
        Err(_) => false,
    }
}

// ============================================================================
// Signalling
// ============================================================================

/// Sends `signal` to `pid`.
///
/// Returns `Ok(false)` if the process no longer exists (ESRCH).
pub fn send_signal(pid: u32, signal: i32) -> Result<bool, ProcessError> {
    let raw = i32::try_from(pid).map_err(|_| ProcessError::InvalidPid(pid))?;
    if raw <= 0 {
        return Err(ProcessError::InvalidPid(pid));
    }

    // SAFETY: kill(2) has no memory-safety preconditions; raw is a positive pid
    // so this never targets a process group.
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        return Ok(true);
    }

    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(ProcessError::Signal {
        pid,
        signal,
        source: err,
    })
}

/// How a graceful kill ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// Nothing to kill
    AlreadyDead,
    /// Exited within the grace period after SIGTERM
    Exited,
    /// Needed SIGKILL
    ForceKilled,
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Bounded by `grace + SIGKILL_SETTLE_TIMEOUT`. The caller is responsible for
/// having verified the identity first.
pub async fn kill_gracefully(pid: u32, grace: Duration) -> Result<KillOutcome, ProcessError> {
    if !is_running(pid) {
        return Ok(KillOutcome::AlreadyDead);
    }
    if !send_signal(pid, libc::SIGTERM)? {
        return Ok(KillOutcome::AlreadyDead);
    }

    if wait_for_exit(pid, grace).await {
        debug!(pid, "process exited after SIGTERM");
        return Ok(KillOutcome::Exited);
    }

    debug!(pid, grace_ms = grace.as_millis() as u64, "grace expired, sending SIGKILL");
    if !send_signal(pid, libc::SIGKILL)? {
        return Ok(KillOutcome::Exited);
    }
    wait_for_exit(pid, SIGKILL_SETTLE_TIMEOUT).await;
    Ok(KillOutcome::ForceKilled)
}

/// Polls until `pid` is gone or `timeout` elapses. Returns true if gone.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_running(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(KILL_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_current_process_is_alive() {
        let me = ProcessIdentity::current().unwrap();
        assert_eq!(me.pid, std::process::id());
        assert_eq!(me.check(), IdentityCheck::Alive);
    }

    #[test]
    fn test_start_time_mismatch_reports_reuse() {
        let me = ProcessIdentity::current().unwrap();
        let stale = ProcessIdentity::new(me.pid, me.start_time.wrapping_add(1));
        assert!(matches!(stale.check(), IdentityCheck::PidReused { .. }));
        assert!(!stale.is_alive());
    }

    #[test]
    fn test_missing_pid_is_dead() {
        // Above the default pid_max, never allocated.
        let ghost = ProcessIdentity::new(4_000_000, 1);
        assert_eq!(ghost.check(), IdentityCheck::Dead);
        assert!(!is_running(0));
    }

    #[test]
    fn test_zombie_is_not_running() {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        // Let it exit without reaping.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!is_running(pid));
        child.wait().unwrap();
    }

    #[test]
    fn test_signal_to_missing_pid() {
        assert!(!send_signal(4_000_000, libc::SIGTERM).unwrap());
        assert!(send_signal(0, libc::SIGTERM).is_err());
    }

    #[tokio::test]
    async fn test_kill_gracefully_sigterm() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });

        let outcome = kill_gracefully(pid, Duration::from_secs(5)).await.unwrap();
        assert_eq!(outcome, KillOutcome::Exited);
        reaper.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_kill_gracefully_escalates() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "trap '' TERM; sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        let reaper = tokio::spawn(async move { child.wait().await });
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = std::time::Instant::now();
        let outcome = kill_gracefully(pid, Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome, KillOutcome::ForceKilled);
        assert!(start.elapsed() < Duration::from_secs(3));
        reaper.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_kill_gracefully_dead_pid() {
        let outcome = kill_gracefully(4_000_000, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(outcome, KillOutcome::AlreadyDead);
    }
}
