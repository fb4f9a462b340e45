//! Supervisor lifecycle states.

use std::fmt;

/// Lifecycle of a supervisor.
///
/// ```text
/// Idle ──start──▶ Launching ──spawned──▶ Running
///                    │                     │ exited
///                    └──failed──▶ Restarting ◀┘
///                                  │     ▲
///                                  └─────┘ spawned → Running
/// any ──stop──▶ Stopped (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    /// Constructed, not started.
    Idle,
    /// First launch in flight.
    Launching,
    /// Process alive and its channel published.
    Running,
    /// Previous process gone, next launch pending or in flight.
    Restarting,
    /// Terminal. No further automatic launches.
    Stopped,
}

impl SupervisorState {
    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Self-transitions are not transitions and are rejected.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use SupervisorState::{Idle, Launching, Restarting, Running, Stopped};
        match (self, next) {
            (Idle, Launching)
            | (Launching | Restarting, Running)
            | (Launching | Running, Restarting) => true,
            (Stopped, _) => false,
            (_, Stopped) => true,
            _ => false,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Stopped
    }

    /// Whether a launch is pending or in flight.
    #[must_use]
    pub fn is_launching(self) -> bool {
        matches!(self, Self::Launching | Self::Restarting)
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
