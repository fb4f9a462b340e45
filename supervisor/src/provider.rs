//! Helpers for feature providers: the consumers that use a channel without
//! owning any process lifecycle.
//!
//! A provider activates with [`FeatureBinding::activate`], reads its channel
//! through [`FeatureBinding::channel`] before every request, and retries
//! once when a request fails with `Invalidated`. Deactivating unbinds but
//! leaves the shared supervisor running.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::channel::Channel;
use crate::error::Unavailable;
use crate::lock;
use crate::service::{ChannelObserver, ChannelSource, ChannelUpdate, Subscription};

// ============================================================================
// ChannelSlot
// ============================================================================

#[derive(Debug)]
enum SlotState<C> {
    /// Nothing received since creation or the last clear.
    Empty,
    Live(Arc<C>),
    /// Channel withdrawn, replacement expected.
    Pending,
    Gone(Unavailable),
}

/// An observer that remembers the latest channel.
///
/// Reports unavailability once per episode: the first `Unavailable` after a
/// live channel (or after creation) is logged, repeats are not.
#[derive(Debug)]
pub struct ChannelSlot<C> {
    feature: Arc<str>,
    state: Mutex<SlotState<C>>,
}

impl<C: Channel> ChannelSlot<C> {
    #[must_use]
    pub fn new(feature: impl Into<Arc<str>>) -> Self {
        Self {
            feature: feature.into(),
            state: Mutex::new(SlotState::Empty),
        }
    }

    #[must_use]
    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// The latest live channel, or why there is none.
    pub fn get(&self) -> Result<Arc<C>, Unavailable> {
        match &*lock(&self.state) {
            SlotState::Live(channel) if !channel.is_invalidated() => Ok(Arc::clone(channel)),
            SlotState::Empty => Err(Unavailable::NotStarted),
            SlotState::Live(_) | SlotState::Pending => Err(Unavailable::Starting),
            SlotState::Gone(reason) => Err(reason.clone()),
        }
    }

    /// Forget everything; the next `get` reports `NotStarted`.
    pub fn clear(&self) {
        *lock(&self.state) = SlotState::Empty;
    }
}

impl<C: Channel> ChannelObserver<C> for ChannelSlot<C> {
    fn on_update(&self, update: ChannelUpdate<C>) {
        let mut state = lock(&self.state);
        match update {
            ChannelUpdate::Published(channel) => {
                tracing::debug!(
                    feature = %self.feature,
                    channel = %channel.id(),
                    "feature bound to channel"
                );
                *state = SlotState::Live(channel);
            }
            ChannelUpdate::Withdrawn => {
                if !matches!(*state, SlotState::Gone(_)) {
                    *state = SlotState::Pending;
                }
            }
            ChannelUpdate::Unavailable(reason) => {
                if !matches!(*state, SlotState::Gone(_)) {
                    tracing::info!(feature = %self.feature, "feature unavailable: {reason}");
                }
                *state = SlotState::Gone(reason);
            }
        }
    }
}

// ============================================================================
// FeatureBinding
// ============================================================================

/// Activation state of one feature provider.
#[derive(Debug)]
pub struct FeatureBinding<C> {
    slot: Arc<ChannelSlot<C>>,
    subscription: Mutex<Option<Subscription>>,
}

impl<C: Channel> FeatureBinding<C> {
    #[must_use]
    pub fn new(feature: impl Into<Arc<str>>) -> Self {
        Self {
            slot: Arc::new(ChannelSlot::new(feature)),
            subscription: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn feature(&self) -> &str {
        self.slot.feature()
    }

    /// Start the source if needed and bind to it. Activating twice is a no-op.
    pub fn activate(&self, source: &dyn ChannelSource<C>) {
        let mut subscription = lock(&self.subscription);
        if subscription.is_some() {
            return;
        }
        source.ensure_started();
        let slot = Arc::clone(&self.slot);
        let observer: Arc<dyn ChannelObserver<C>> = slot;
        *subscription = Some(source.bind(observer));
        tracing::debug!(feature = %self.slot.feature(), "feature activated");
    }

    /// Unbind from the source. The source keeps running.
    pub fn deactivate(&self) {
        let subscription = lock(&self.subscription).take();
        if let Some(subscription) = subscription {
            subscription.unbind();
            self.slot.clear();
            tracing::debug!(feature = %self.slot.feature(), "feature deactivated");
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        lock(&self.subscription).is_some()
    }

    /// The channel to issue the next request on.
    pub fn channel(&self) -> Result<Arc<C>, Unavailable> {
        self.slot.get()
    }
}

// ============================================================================
// Queued delivery
// ============================================================================

/// Observer that forwards updates to an [`UpdateQueue`], for consumers that
/// must handle updates on their own thread or task.
#[derive(Debug)]
pub struct QueuedObserver<C> {
    tx: mpsc::UnboundedSender<ChannelUpdate<C>>,
}

/// The receiving end of a [`QueuedObserver`].
#[derive(Debug)]
pub struct UpdateQueue<C> {
    rx: mpsc::UnboundedReceiver<ChannelUpdate<C>>,
}

/// Create a connected observer/queue pair.
#[must_use]
pub fn queued<C: Channel>() -> (Arc<QueuedObserver<C>>, UpdateQueue<C>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(QueuedObserver { tx }), UpdateQueue { rx })
}

impl<C: Channel> ChannelObserver<C> for QueuedObserver<C> {
    fn on_update(&self, update: ChannelUpdate<C>) {
        let _ = self.tx.send(update);
    }
}

impl<C> UpdateQueue<C> {
    /// Handle up to `budget` queued updates without blocking. Returns how
    /// many were handled.
    pub fn poll(&mut self, budget: usize, mut handler: impl FnMut(ChannelUpdate<C>)) -> usize {
        let mut count = 0;
        while count < budget {
            match self.rx.try_recv() {
                Ok(update) => {
                    handler(update);
                    count += 1;
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        count
    }

    /// Wait for the next update. `None` once the observer is gone.
    pub async fn recv(&mut self) -> Option<ChannelUpdate<C>> {
        self.rx.recv().await
    }
}
