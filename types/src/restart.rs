//! Restart policy for supervised processes.

use std::time::Duration;

/// Bounds on automatic relaunching.
///
/// Every relaunch waits at least `cooldown`. A launch whose process dies
/// before `stable_after` counts as a failed attempt; `max_restarts`
/// consecutive failures stop the supervisor. A process that stays up for
/// `stable_after` clears the failure count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Relaunch after unexpected exits at all.
    pub auto_restart: bool,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_restarts: u32,
    /// Delay before each relaunch.
    pub cooldown: Duration,
    /// Uptime after which a process counts as healthy.
    pub stable_after: Duration,
    /// Time between SIGTERM and SIGKILL when stopping.
    pub stop_grace: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: true,
            max_restarts: 5,
            cooldown: Duration::from_millis(250),
            stable_after: Duration::from_secs(10),
            stop_grace: Duration::from_secs(2),
        }
    }
}

impl RestartPolicy {
    /// Never relaunch; the first exit is terminal.
    #[must_use]
    pub fn never() -> Self {
        Self {
            auto_restart: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    #[must_use]
    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    #[must_use]
    pub fn allows_attempt(&self, failures: u32) -> bool {
        self.auto_restart && failures <= self.max_restarts
    }
}
