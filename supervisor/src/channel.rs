//! Channel contracts.
//!
//! A channel is the duplex endpoint over one process's stdio. The supervisor
//! invalidates it before anyone can see its replacement, so implementations
//! must refuse every send once [`Channel::invalidate`] has returned. A
//! channel may also give up on its own (its process closed stdout); the
//! supervisor learns of that through [`Channel::closed`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tether_types::{ChannelId, ProcessId};
use tokio::sync::watch;

use crate::error::ChannelError;
use crate::process::ProcessStdio;

/// Future returned by [`Channel::closed`].
pub type ClosedFut<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// A message endpoint bound to exactly one process.
pub trait Channel: Send + Sync + 'static {
    fn id(&self) -> ChannelId;

    /// The process this channel talks to.
    fn pid(&self) -> ProcessId;

    /// Refuse all further sends and fail anything in flight.
    ///
    /// Synchronous and idempotent. After it returns, every send or request
    /// fails with [`ChannelError::Invalidated`].
    fn invalidate(&self);

    fn is_invalidated(&self) -> bool;

    /// Resolves once the channel is invalidated, by anyone.
    ///
    /// The supervisor selects on this so a channel that dies while its
    /// process keeps running is withdrawn like any other.
    fn closed(&self) -> ClosedFut<'_>;
}

/// Builds a channel over a freshly spawned process.
///
/// Called exactly once per successful launch, on the supervisor's task,
/// before any subscriber sees the result. This is also the place to send
/// whatever initial configuration the tool expects.
pub trait ChannelFactory: Send + Sync + 'static {
    type Channel: Channel;

    fn create(&self, id: ChannelId, pid: ProcessId, stdio: ProcessStdio) -> Arc<Self::Channel>;
}

/// One-way open/closed latch for channel implementations.
///
/// Closing is visible synchronously through [`is_closed`](Self::is_closed)
/// and asynchronously through [`closed`](Self::closed), which background
/// I/O tasks select on.
#[derive(Debug)]
pub struct ChannelGate {
    id: ChannelId,
    closed: AtomicBool,
    signal: watch::Sender<bool>,
}

impl ChannelGate {
    #[must_use]
    pub fn new(id: ChannelId) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            signal: watch::Sender::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Close the gate. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            self.signal.send_replace(true);
        }
        first
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// `Ok(())` while open, [`ChannelError::Invalidated`] once closed.
    pub fn check(&self) -> Result<(), ChannelError> {
        if self.is_closed() {
            Err(ChannelError::Invalidated(self.id))
        } else {
            Ok(())
        }
    }

    /// Resolves once the gate is closed.
    pub async fn closed(&self) {
        let mut rx = self.signal.subscribe();
        // The sender lives in `self`, so this only returns once the flag flips.
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
