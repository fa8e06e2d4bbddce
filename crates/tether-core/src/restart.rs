//! Auto-restart policy and bookkeeping.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// How a session reacts when its foreground process exits.
///
/// Immutable once attached to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RestartPolicy {
    pub enabled: bool,
    /// Wait before respawning, in milliseconds.
    pub delay_ms: u64,
    /// Restarts allowed before the budget is exhausted.
    pub max_restarts: u32,
    /// Continuous run time after a restart that resets the counter.
    pub reset_after_ms: u64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 1_000,
            max_restarts: 5,
            reset_after_ms: 60_000,
        }
    }
}

impl RestartPolicy {
    /// An enabled policy with default timings.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after_ms)
    }
}

/// What to do about an exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after `delay`; `attempt` is the new restart count.
    Restart { attempt: u32, delay: Duration },
    /// The budget is spent.
    Exhausted { restarts: u32 },
    /// Auto-restart is off for this session.
    Disabled,
}

/// Restart counter for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartState {
    pub count: u32,
    /// When the most recent restart actually spawned the new process.
    pub last_restart_at: Option<Instant>,
}

impl RestartState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decides how to handle an exit observed at `now`.
    ///
    /// If the session ran for at least `reset_after` since the last restart,
    /// the counter is reset before deciding. A `Restart` decision counts the
    /// attempt; call [`RestartState::restarted`] once the process is spawned.
    pub fn on_exit(&mut self, policy: &RestartPolicy, now: Instant) -> RestartDecision {
        if !policy.enabled {
            return RestartDecision::Disabled;
        }

        self.maybe_reset(policy, now);

        if self.count >= policy.max_restarts {
            return RestartDecision::Exhausted {
                restarts: self.count,
            };
        }

        self.count += 1;
        RestartDecision::Restart {
            attempt: self.count,
            delay: policy.delay(),
        }
    }

    /// Records that the new process started at `now`. Stable run time is
    /// measured from here.
    pub fn restarted(&mut self, now: Instant) {
        self.last_restart_at = Some(now);
    }

    /// Resets the counter if the session has been stable long enough.
    ///
    /// Returns true if a reset happened.
    pub fn maybe_reset(&mut self, policy: &RestartPolicy, now: Instant) -> bool {
        match self.last_restart_at {
            Some(at) if now.saturating_duration_since(at) >= policy.reset_after() => {
                *self = Self::default();
                true
            }
            _ => false,
        }
    }
}
