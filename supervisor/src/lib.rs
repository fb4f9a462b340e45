//! Supervised external processes with transparent channel rebinding.
//!
//! A [`Supervisor`] keeps one child process alive and publishes a fresh
//! channel after every launch. A [`Service`] owns a supervisor and fans the
//! current channel out to any number of [`ChannelObserver`]s, so feature
//! providers never deal with restarts themselves.
//!
//! Wire framing is not this crate's concern. [`LineChannel`] is a simple
//! newline-delimited channel; real protocols implement [`Channel`] and
//! [`ChannelFactory`] themselves.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod channel;
mod error;
mod launch;
mod line;
mod process;
mod provider;
mod registry;
mod service;
mod supervisor;

pub use channel::{Channel, ChannelFactory, ChannelGate, ClosedFut};
pub use error::{ChannelError, SpawnError, Unavailable};
pub use launch::{Launch, OsLauncher, Sandbox, SpawnFut, resolve_program};
pub use line::{LineChannel, LineChannelFactory};
pub use process::{ProcessHandle, ProcessStdio};
pub use provider::{ChannelSlot, FeatureBinding, QueuedObserver, UpdateQueue, queued};
pub use registry::ProjectServices;
pub use service::{
    ChannelObserver, ChannelSource, ChannelUpdate, Service, Subscription, SubscriptionId,
};
pub use supervisor::{StopReason, Supervisor, SupervisorBuilder, SupervisorEvent, SupervisorSink};

pub use tether_types::{
    ChannelId, ExecutionTarget, LaunchDescriptor, ProcessExit, ProcessId, ProgramSpec,
    ProjectKey, RestartPolicy, StderrPolicy, SupervisorState,
};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
