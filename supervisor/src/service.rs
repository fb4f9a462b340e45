//! One supervised tool per project, shared by many consumers.
//!
//! The service owns a [`Supervisor`] and keeps the registry of the current
//! channel and its subscribers. Registry updates and fan-out happen under a
//! single lock, so every subscriber observes the same channel at any instant.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tether_types::{ChannelId, LaunchDescriptor, RestartPolicy, SupervisorState};

use crate::channel::{Channel, ChannelFactory};
use crate::error::Unavailable;
use crate::launch::{Launch, OsLauncher};
use crate::lock;
use crate::supervisor::{StopReason, Supervisor, SupervisorEvent, SupervisorSink};

// ============================================================================
// Observer contract
// ============================================================================

/// A change to the channel a subscriber should use.
#[derive(Debug)]
pub enum ChannelUpdate<C> {
    /// Use this channel from now on. Any earlier channel is already invalidated.
    Published(Arc<C>),
    /// The previous channel is gone; a replacement may follow.
    Withdrawn,
    /// No channel will come from the current supervisor.
    Unavailable(Unavailable),
}

impl<C> Clone for ChannelUpdate<C> {
    fn clone(&self) -> Self {
        match self {
            Self::Published(channel) => Self::Published(Arc::clone(channel)),
            Self::Withdrawn => Self::Withdrawn,
            Self::Unavailable(reason) => Self::Unavailable(reason.clone()),
        }
    }
}

/// Receives channel updates from a [`ChannelSource`].
///
/// Called with the registry lock held. Implementations must return quickly
/// and must not call back into the service (bind, unbind, stop, ...) from
/// inside `on_update`; hand the update to another task instead.
pub trait ChannelObserver<C>: Send + Sync + 'static {
    fn on_update(&self, update: ChannelUpdate<C>);
}

/// The "current channel" capability feature providers depend on.
pub trait ChannelSource<C>: Send + Sync {
    /// Start the underlying supervisor if nothing has yet.
    fn ensure_started(&self);

    /// Subscribe to channel changes. A live channel, or a terminal
    /// unavailability, is delivered before this returns.
    fn bind(&self, observer: Arc<dyn ChannelObserver<C>>) -> Subscription;

    /// The live channel, if any.
    fn current_channel(&self) -> Option<Arc<C>>;

    /// The live channel, or why there is none.
    fn channel(&self) -> Result<Arc<C>, Unavailable>;
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

trait Unbind: Send + Sync {
    fn unbind(&self, id: SubscriptionId);
}

/// Keeps an observer bound. Unbinds on drop.
#[must_use = "dropping a Subscription unbinds the observer"]
pub struct Subscription {
    id: SubscriptionId,
    registry: Option<Weak<dyn Unbind>>,
}

impl Subscription {
    /// A subscription with nothing to unbind, for sources that never
    /// retain observers.
    pub fn detached(id: SubscriptionId) -> Self {
        Self { id, registry: None }
    }

    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn unbind(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(registry) = self.registry.take().and_then(|weak| weak.upgrade()) {
            registry.unbind(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("bound", &self.registry.is_some())
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// What `channel()` reports while there is no live channel.
#[derive(Debug, Clone)]
enum Status {
    NotStarted,
    Starting,
    Unavailable(Unavailable),
}

struct Registry<C> {
    current: Option<Arc<C>>,
    status: Status,
    subscribers: BTreeMap<SubscriptionId, Arc<dyn ChannelObserver<C>>>,
    next_subscriber: u64,
    /// Events from supervisors of earlier generations are ignored.
    generation: u64,
}

impl<C: 'static> Registry<C> {
    fn notify(&self, update: &ChannelUpdate<C>) {
        for observer in self.subscribers.values() {
            observer.on_update(update.clone());
        }
    }
}

struct Shared<C> {
    name: Arc<str>,
    registry: Mutex<Registry<C>>,
}

impl<C: Channel> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, Registry<C>> {
        lock(&self.registry)
    }

    /// Invalidate and drop the current channel, telling subscribers.
    fn withdraw_current(&self, registry: &mut Registry<C>) {
        if let Some(channel) = registry.current.take() {
            channel.invalidate();
            registry.notify(&ChannelUpdate::Withdrawn);
        }
    }

    fn handle(&self, generation: u64, event: SupervisorEvent<C>) {
        let mut registry = self.lock();
        if registry.generation != generation {
            return;
        }

        match event {
            SupervisorEvent::StateChanged(state) => {
                if state.is_launching() && registry.current.is_none() {
                    registry.status = Status::Starting;
                }
            }
            SupervisorEvent::Published(channel) => {
                if let Some(old) = registry.current.take() {
                    // Normally already invalidated by the supervisor.
                    old.invalidate();
                }
                tracing::debug!(
                    service = %self.name,
                    channel = %channel.id(),
                    subscribers = registry.subscribers.len(),
                    "publishing channel"
                );
                registry.current = Some(Arc::clone(&channel));
                registry.status = Status::Starting;
                registry.notify(&ChannelUpdate::Published(channel));
            }
            SupervisorEvent::Invalidated(id) => {
                if registry.current.as_ref().is_some_and(|c| c.id() == id) {
                    registry.current = None;
                    registry.notify(&ChannelUpdate::Withdrawn);
                }
            }
            SupervisorEvent::Stopped(reason) => {
                self.withdraw_current(&mut registry);
                let unavailable = reason.unavailable();
                match &reason {
                    StopReason::Requested => {
                        tracing::info!(service = %self.name, "service stopped");
                    }
                    StopReason::SpawnFailed(_) | StopReason::RestartsExhausted { .. } => {
                        tracing::warn!(
                            service = %self.name,
                            "service '{}' unavailable: {unavailable}",
                            self.name
                        );
                    }
                }
                registry.status = Status::Unavailable(unavailable.clone());
                registry.notify(&ChannelUpdate::Unavailable(unavailable));
            }
            SupervisorEvent::Spawned { .. }
            | SupervisorEvent::Exited { .. }
            | SupervisorEvent::SpawnFailed(_) => {}
        }
    }
}

impl<C: Channel> Unbind for Shared<C> {
    fn unbind(&self, id: SubscriptionId) {
        if self.lock().subscribers.remove(&id).is_some() {
            tracing::trace!(service = %self.name, subscription = %id, "unbound");
        }
    }
}

/// Routes one supervisor's events into the registry, tagged with the
/// generation it was created for.
struct Link<C> {
    shared: Arc<Shared<C>>,
    generation: u64,
}

impl<C: Channel> SupervisorSink<C> for Link<C> {
    fn on_event(&self, event: SupervisorEvent<C>) {
        self.shared.handle(self.generation, event);
    }
}

struct Slot<F: ChannelFactory> {
    supervisor: Arc<Supervisor<F>>,
    /// Keeps the supervisor's weak sink alive.
    _link: Arc<Link<F::Channel>>,
}

// ============================================================================
// Service
// ============================================================================

/// Owns one supervisor and fans its channel out to any number of observers.
///
/// Cheap operations (`bind`, `current_channel`, `channel`, `ensure_started`)
/// never block on the process; `stop` and `reconfigure` wait for the process
/// to be gone.
pub struct Service<F: ChannelFactory> {
    name: Arc<str>,
    factory: Arc<F>,
    launcher: Arc<dyn Launch>,
    policy: RestartPolicy,
    shared: Arc<Shared<F::Channel>>,
    slot: Mutex<Slot<F>>,
    started: AtomicBool,
    /// Held by `reconfigure` until the outgoing process is gone.
    swap: tokio::sync::Mutex<()>,
}

impl<F: ChannelFactory> Service<F> {
    pub fn new(
        name: impl Into<Arc<str>>,
        descriptor: LaunchDescriptor,
        factory: F,
        policy: RestartPolicy,
    ) -> Self {
        let name = name.into();
        let factory = Arc::new(factory);
        let launcher: Arc<dyn Launch> = Arc::new(OsLauncher::new());
        let shared = Arc::new(Shared {
            name: Arc::clone(&name),
            registry: Mutex::new(Registry {
                current: None,
                status: Status::NotStarted,
                subscribers: BTreeMap::new(),
                next_subscriber: 0,
                generation: 0,
            }),
        });
        let slot = build_slot(
            &name,
            Arc::new(descriptor),
            &factory,
            &launcher,
            policy,
            &shared,
            ChannelId::new(1),
            0,
        );

        Self {
            name,
            factory,
            launcher,
            policy,
            shared,
            slot: Mutex::new(slot),
            started: AtomicBool::new(false),
            swap: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawn through `launcher` instead of the OS launcher.
    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn Launch>) -> Self {
        self.launcher = launcher;
        let descriptor = Arc::clone(lock(&self.slot).supervisor.descriptor());
        let slot = build_slot(
            &self.name,
            descriptor,
            &self.factory,
            &self.launcher,
            self.policy,
            &self.shared,
            ChannelId::new(1),
            self.shared.lock().generation,
        );
        *lock(&self.slot) = slot;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    #[must_use]
    pub fn descriptor(&self) -> Arc<LaunchDescriptor> {
        Arc::clone(self.supervisor().descriptor())
    }

    fn supervisor(&self) -> Arc<Supervisor<F>> {
        Arc::clone(&lock(&self.slot).supervisor)
    }

    /// Start the supervisor on the first call; later calls do nothing, as do
    /// calls after [`stop`](Self::stop). Safe to call concurrently.
    ///
    /// Must be called within a tokio runtime.
    pub fn ensure_started(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut registry = self.shared.lock();
            if matches!(registry.status, Status::NotStarted) {
                registry.status = Status::Starting;
            }
        }
        tracing::debug!(service = %self.name, "starting");
        self.supervisor().start();
    }

    /// Whether `ensure_started` (or `stop`) has been called.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Subscribe `observer` to channel changes without starting anything.
    ///
    /// A live channel, or a terminal unavailability, is delivered to the
    /// observer before this returns.
    pub fn bind(&self, observer: Arc<dyn ChannelObserver<F::Channel>>) -> Subscription {
        let mut registry = self.shared.lock();
        let id = SubscriptionId(registry.next_subscriber);
        registry.next_subscriber += 1;

        if let Some(channel) = &registry.current {
            observer.on_update(ChannelUpdate::Published(Arc::clone(channel)));
        } else if let Status::Unavailable(reason) = &registry.status {
            observer.on_update(ChannelUpdate::Unavailable(reason.clone()));
        }
        registry.subscribers.insert(id, observer);
        drop(registry);

        let shared = Arc::downgrade(&self.shared);
        let registry: Weak<dyn Unbind> = shared;
        Subscription {
            id,
            registry: Some(registry),
        }
    }

    /// [`ensure_started`](Self::ensure_started) followed by [`bind`](Self::bind).
    pub fn attach(&self, observer: Arc<dyn ChannelObserver<F::Channel>>) -> Subscription {
        self.ensure_started();
        self.bind(observer)
    }

    #[must_use]
    pub fn current_channel(&self) -> Option<Arc<F::Channel>> {
        self.shared.lock().current.clone()
    }

    pub fn channel(&self) -> Result<Arc<F::Channel>, Unavailable> {
        let registry = self.shared.lock();
        if let Some(channel) = &registry.current {
            return Ok(Arc::clone(channel));
        }
        Err(match &registry.status {
            Status::NotStarted => Unavailable::NotStarted,
            Status::Starting => Unavailable::Starting,
            Status::Unavailable(reason) => reason.clone(),
        })
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.supervisor().state()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().subscribers.len()
    }

    /// Stop the supervisor and wait for the process to be gone.
    ///
    /// The current channel is invalidated before this first suspends.
    /// Afterwards `ensure_started` does nothing; only [`restart`](Self::restart)
    /// brings the service back.
    pub async fn stop(&self) {
        self.started.store(true, Ordering::Release);
        let supervisor = self.supervisor();
        {
            let mut registry = self.shared.lock();
            self.shared.withdraw_current(&mut registry);
        }
        supervisor.stop().await;
        // A reconfigure in flight may still be stopping the process it replaced.
        drop(self.swap.lock().await);
    }

    /// Operator restart.
    ///
    /// A running supervisor relaunches its process with a cleared failure
    /// count. A stopped one (by request or after giving up) is replaced by
    /// a fresh supervisor for the same descriptor.
    ///
    /// Must be called within a tokio runtime.
    pub fn restart(&self) {
        self.started.store(true, Ordering::Release);
        let mut slot = lock(&self.slot);
        if !slot.supervisor.state().is_terminal() {
            tracing::info!(service = %self.name, "restart requested");
            slot.supervisor.restart();
            return;
        }

        tracing::info!(service = %self.name, "restarting stopped service");
        let descriptor = Arc::clone(slot.supervisor.descriptor());
        let next = self.next_generation(&slot, true);
        *slot = next.build(self, descriptor);
        slot.supervisor.start();
    }

    /// Switch to a new launch descriptor.
    ///
    /// An unchanged descriptor is a no-op. Otherwise the replacement
    /// supervisor takes over the slot at once and the old one is stopped;
    /// the replacement starts once the old process is gone, if the service
    /// was running (or trying to). A `stop` or `restart` that lands while
    /// the old process is still exiting acts on the replacement.
    pub async fn reconfigure(&self, descriptor: LaunchDescriptor) {
        let _swap = self.swap.lock().await;
        let (old, next, resume) = {
            let mut slot = lock(&self.slot);
            if **slot.supervisor.descriptor() == descriptor {
                return;
            }
            let resume = self.is_started() && !slot.supervisor.state().is_terminal();
            let next = self.next_generation(&slot, resume).build(self, Arc::new(descriptor));
            let replaced = std::mem::replace(&mut *slot, next);
            (replaced.supervisor, Arc::clone(&slot.supervisor), resume)
        };

        tracing::info!(
            service = %self.name,
            command = %next.descriptor().display_command(),
            "reconfiguring"
        );
        old.stop().await;

        // No-op if a stop or restart already claimed the replacement.
        if resume && next.start() {
            tracing::debug!(service = %self.name, "reconfigured service started");
        }
    }

    /// Move the registry to a new generation so the outgoing supervisor's
    /// events are ignored from here on.
    fn next_generation(&self, slot: &Slot<F>, resume: bool) -> NextSlot {
        let first_channel = slot
            .supervisor
            .last_channel()
            .map_or(ChannelId::new(1), ChannelId::next);

        let mut registry = self.shared.lock();
        registry.generation += 1;
        self.shared.withdraw_current(&mut registry);
        registry.status = if resume {
            Status::Starting
        } else if self.is_started() {
            registry.status.clone()
        } else {
            Status::NotStarted
        };

        NextSlot {
            generation: registry.generation,
            first_channel,
        }
    }
}

impl<F: ChannelFactory> ChannelSource<F::Channel> for Service<F> {
    fn ensure_started(&self) {
        Service::ensure_started(self);
    }

    fn bind(&self, observer: Arc<dyn ChannelObserver<F::Channel>>) -> Subscription {
        Service::bind(self, observer)
    }

    fn current_channel(&self) -> Option<Arc<F::Channel>> {
        Service::current_channel(self)
    }

    fn channel(&self) -> Result<Arc<F::Channel>, Unavailable> {
        Service::channel(self)
    }
}

impl<F: ChannelFactory> fmt::Debug for Service<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("started", &self.is_started())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

struct NextSlot {
    generation: u64,
    first_channel: ChannelId,
}

impl NextSlot {
    fn build<F: ChannelFactory>(
        self,
        service: &Service<F>,
        descriptor: Arc<LaunchDescriptor>,
    ) -> Slot<F> {
        build_slot(
            &service.name,
            descriptor,
            &service.factory,
            &service.launcher,
            service.policy,
            &service.shared,
            self.first_channel,
            self.generation,
        )
    }
}

#[allow(clippy::too_many_arguments)]
fn build_slot<F: ChannelFactory>(
    name: &Arc<str>,
    descriptor: Arc<LaunchDescriptor>,
    factory: &Arc<F>,
    launcher: &Arc<dyn Launch>,
    policy: RestartPolicy,
    shared: &Arc<Shared<F::Channel>>,
    first_channel: ChannelId,
    generation: u64,
) -> Slot<F> {
    let link = Arc::new(Link {
        shared: Arc::clone(shared),
        generation,
    });
    let weak = Arc::downgrade(&link);
    let sink: Weak<dyn SupervisorSink<F::Channel>> = weak;
    let supervisor = Supervisor::builder(Arc::clone(name), descriptor, Arc::clone(factory))
        .launcher(Arc::clone(launcher))
        .policy(policy)
        .first_channel(first_channel)
        .build(sink);

    Slot {
        supervisor: Arc::new(supervisor),
        _link: link,
    }
}
