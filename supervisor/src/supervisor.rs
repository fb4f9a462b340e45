//! Keeps one external process alive and publishes a fresh channel after
//! every successful launch.
//!
//! All lifecycle work happens on a single coordination task: spawning,
//! waiting for exit, invalidating and publishing channels, restart
//! accounting. The [`Supervisor`] value is only a handle that sends commands
//! to that task and reads its state.
//!
//! Ordering on the task is strict. The exit of process N is fully handled
//! (channel invalidated, `Invalidated` and `Exited` delivered, state moved to
//! `Restarting`) before process N+1 is spawned, and a spawn that completes
//! after a stop request is torn down without publishing anything.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tether_types::{
    ChannelId, LaunchDescriptor, ProcessExit, ProcessId, RestartPolicy, SupervisorState,
};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::channel::{Channel, ChannelFactory};
use crate::error::{SpawnError, Unavailable};
use crate::launch::{Launch, OsLauncher};
use crate::lock;
use crate::process::ProcessHandle;

// ============================================================================
// Events
// ============================================================================

/// Something the coordination task did, delivered in order to the sink.
#[derive(Debug)]
pub enum SupervisorEvent<C> {
    StateChanged(SupervisorState),
    Spawned { pid: ProcessId },
    /// A new channel is live. The previous one, if any, is already invalidated.
    Published(Arc<C>),
    Invalidated(ChannelId),
    Exited {
        pid: ProcessId,
        exit: ProcessExit,
        /// The exit was caused by `stop()` or `restart()`.
        expected: bool,
    },
    SpawnFailed(SpawnError),
    /// Terminal; always the last event.
    Stopped(StopReason),
}

/// Why a supervisor reached [`SupervisorState::Stopped`].
#[derive(Debug, Clone)]
pub enum StopReason {
    Requested,
    SpawnFailed(SpawnError),
    RestartsExhausted { attempts: u32 },
}

impl StopReason {
    /// How this looks to a consumer asking for a channel.
    #[must_use]
    pub fn unavailable(&self) -> Unavailable {
        match self {
            Self::Requested => Unavailable::Stopped,
            Self::SpawnFailed(err) => Unavailable::SpawnFailed(err.clone()),
            Self::RestartsExhausted { attempts } => Unavailable::RestartsExhausted {
                attempts: *attempts,
            },
        }
    }
}

/// Receives events from the coordination task.
///
/// Called synchronously on the task; implementations must not block.
pub trait SupervisorSink<C>: Send + Sync + 'static {
    fn on_event(&self, event: SupervisorEvent<C>);
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Stop(Option<oneshot::Sender<()>>),
    Restart,
}

/// Builder for [`Supervisor`].
pub struct SupervisorBuilder<F: ChannelFactory> {
    name: Arc<str>,
    descriptor: Arc<LaunchDescriptor>,
    factory: Arc<F>,
    launcher: Arc<dyn Launch>,
    policy: RestartPolicy,
    first_channel: ChannelId,
}

impl<F: ChannelFactory> SupervisorBuilder<F> {
    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn Launch>) -> Self {
        self.launcher = launcher;
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Id of the first channel this supervisor publishes. Later launches
    /// count up from here.
    #[must_use]
    pub fn first_channel(mut self, id: ChannelId) -> Self {
        self.first_channel = id;
        self
    }

    /// Finish construction. Nothing runs until [`Supervisor::start`].
    pub fn build(self, sink: Weak<dyn SupervisorSink<F::Channel>>) -> Supervisor<F> {
        let (state_tx, state_rx) = watch::channel(SupervisorState::Idle);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let last_channel = Arc::new(AtomicU64::new(0));

        let task = Task {
            name: Arc::clone(&self.name),
            descriptor: Arc::clone(&self.descriptor),
            factory: self.factory,
            launcher: self.launcher,
            policy: self.policy,
            sink,
            state_tx,
            cmd_rx,
            next_channel: self.first_channel,
            last_channel: Arc::clone(&last_channel),
            failures: 0,
        };

        Supervisor {
            name: self.name,
            descriptor: self.descriptor,
            policy: self.policy,
            state_rx,
            cmd_tx,
            last_channel,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Handle to one supervised process lifecycle.
///
/// Dropping the handle stops the supervisor without waiting for the
/// process to exit.
pub struct Supervisor<F: ChannelFactory> {
    name: Arc<str>,
    descriptor: Arc<LaunchDescriptor>,
    policy: RestartPolicy,
    state_rx: watch::Receiver<SupervisorState>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    last_channel: Arc<AtomicU64>,
    /// The coordination task before `start()` takes it.
    task: Mutex<Option<Task<F>>>,
}

impl<F: ChannelFactory> Supervisor<F> {
    pub fn builder(
        name: impl Into<Arc<str>>,
        descriptor: Arc<LaunchDescriptor>,
        factory: Arc<F>,
    ) -> SupervisorBuilder<F> {
        SupervisorBuilder {
            name: name.into(),
            descriptor,
            factory,
            launcher: Arc::new(OsLauncher::new()),
            policy: RestartPolicy::default(),
            first_channel: ChannelId::new(1),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn descriptor(&self) -> &Arc<LaunchDescriptor> {
        &self.descriptor
    }

    #[must_use]
    pub fn policy(&self) -> RestartPolicy {
        self.policy
    }

    /// Spawn the coordination task. Only the first call from `Idle` has any
    /// effect; returns whether this call started it.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self) -> bool {
        let Some(task) = lock(&self.task).take() else {
            return false;
        };
        tokio::spawn(task.run());
        true
    }

    #[must_use]
    pub fn state(&self) -> SupervisorState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_rx.clone()
    }

    /// Id of the most recently published channel, if any launch succeeded.
    #[must_use]
    pub fn last_channel(&self) -> Option<ChannelId> {
        match self.last_channel.load(Ordering::Acquire) {
            0 => None,
            id => Some(ChannelId::new(id)),
        }
    }

    /// Stop supervising: invalidate the channel, cancel any launch or
    /// cooldown in progress, terminate the process, and wait until the
    /// supervisor is `Stopped`. Idempotent.
    pub async fn stop(&self) {
        let unstarted = lock(&self.task).take();
        if let Some(task) = unstarted {
            task.abandon();
            return;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(Some(ack_tx))).is_err() {
            // Task already gone.
            return;
        }
        let _ = ack_rx.await;
    }

    /// Operator restart: terminate the current process (if any), clear the
    /// failure count, and launch again. Starts an idle supervisor; does
    /// nothing once stopped.
    pub fn restart(&self) {
        if self.start() {
            return;
        }
        let _ = self.cmd_tx.send(Command::Restart);
    }
}

impl<F: ChannelFactory> fmt::Debug for Supervisor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("command", &self.descriptor.display_command())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Coordination task
// ============================================================================

struct Task<F: ChannelFactory> {
    name: Arc<str>,
    descriptor: Arc<LaunchDescriptor>,
    factory: Arc<F>,
    launcher: Arc<dyn Launch>,
    policy: RestartPolicy,
    sink: Weak<dyn SupervisorSink<F::Channel>>,
    state_tx: watch::Sender<SupervisorState>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    next_channel: ChannelId,
    last_channel: Arc<AtomicU64>,
    /// Consecutive failed launches.
    failures: u32,
}

/// How a phase of the task was interrupted or ended.
enum Step<T> {
    Continue(T),
    Stop(Option<oneshot::Sender<()>>),
}

enum Launched {
    Process(ProcessHandle),
    Failed(SpawnError),
}

enum Ended {
    Exited { uptime: Duration },
    Restart,
}

/// What woke the task while a process was running.
enum Wake {
    Command(Command),
    Exited(ProcessExit),
    ChannelClosed,
}

impl<F: ChannelFactory> Task<F> {
    async fn run(mut self) {
        let mut acks = Vec::new();
        let reason = self.supervise(&mut acks).await;
        self.finish(reason, acks);
    }

    /// Stopped before ever starting.
    fn abandon(mut self) {
        self.finish(StopReason::Requested, Vec::new());
    }

    async fn supervise(&mut self, acks: &mut Vec<oneshot::Sender<()>>) -> StopReason {
        self.transition(SupervisorState::Launching);
        let mut cooldown = None;

        loop {
            if let Some(delay) = cooldown.take() {
                match self.cool_down(delay).await {
                    Step::Continue(()) => {}
                    Step::Stop(ack) => {
                        acks.extend(ack);
                        return StopReason::Requested;
                    }
                }
            }

            let process = match self.launch().await {
                Step::Stop(ack) => {
                    acks.extend(ack);
                    return StopReason::Requested;
                }
                Step::Continue(Launched::Failed(err)) => {
                    self.emit(SupervisorEvent::SpawnFailed(err.clone()));
                    if !err.is_retryable() {
                        tracing::warn!(service = %self.name, "failed to launch: {err}");
                        return StopReason::SpawnFailed(err);
                    }
                    self.failures += 1;
                    tracing::warn!(
                        service = %self.name,
                        attempt = self.failures,
                        "failed to launch: {err}"
                    );
                    if !self.policy.allows_attempt(self.failures) {
                        return StopReason::RestartsExhausted {
                            attempts: self.failures,
                        };
                    }
                    self.transition(SupervisorState::Restarting);
                    cooldown = Some(self.policy.cooldown);
                    continue;
                }
                Step::Continue(Launched::Process(process)) => process,
            };

            match self.run_process(process).await {
                Step::Stop(ack) => {
                    acks.extend(ack);
                    return StopReason::Requested;
                }
                Step::Continue(Ended::Restart) => {
                    self.failures = 0;
                    self.transition(SupervisorState::Restarting);
                    cooldown = None;
                }
                Step::Continue(Ended::Exited { uptime }) => {
                    if uptime >= self.policy.stable_after {
                        self.failures = 0;
                    }
                    self.failures += 1;
                    if !self.policy.allows_attempt(self.failures) {
                        return StopReason::RestartsExhausted {
                            attempts: self.failures,
                        };
                    }
                    tracing::info!(
                        service = %self.name,
                        attempt = self.failures,
                        "restarting in {}ms",
                        self.policy.cooldown.as_millis()
                    );
                    self.transition(SupervisorState::Restarting);
                    cooldown = Some(self.policy.cooldown);
                }
            }
        }
    }

    /// Wait out the restart cooldown. An operator restart skips the rest of
    /// the delay.
    async fn cool_down(&mut self, delay: Duration) -> Step<()> {
        tokio::select! {
            biased;
            cmd = self.cmd_rx.recv() => match cmd {
                Some(Command::Restart) => {
                    self.failures = 0;
                    Step::Continue(())
                }
                Some(Command::Stop(ack)) => Step::Stop(ack),
                None => Step::Stop(None),
            },
            () = tokio::time::sleep(delay) => Step::Continue(()),
        }
    }

    /// Spawn one process. A stop request cancels the spawn; a process that
    /// appears anyway is torn down before anything sees it.
    async fn launch(&mut self) -> Step<Launched> {
        let launcher = Arc::clone(&self.launcher);
        let descriptor = Arc::clone(&self.descriptor);
        let spawn = launcher.spawn(&descriptor);
        tokio::pin!(spawn);

        let result = loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    // Already launching; nothing more to do.
                    Some(Command::Restart) => self.failures = 0,
                    Some(Command::Stop(ack)) => return Step::Stop(ack),
                    None => return Step::Stop(None),
                },
                result = &mut spawn => break result,
            }
        };

        let process = match result {
            Ok(process) => process,
            Err(err) => return Step::Continue(Launched::Failed(err)),
        };

        // A stop that raced with the spawn wins.
        if let Some(ack) = self.take_pending_stop() {
            tracing::debug!(
                service = %self.name,
                pid = %process.pid(),
                "stop requested during launch, discarding process"
            );
            process.terminate(self.policy.stop_grace).await;
            return Step::Stop(ack);
        }

        Step::Continue(Launched::Process(process))
    }

    /// Drain queued commands without waiting. Returns the stop request, if
    /// any; a closed command channel counts as one.
    fn take_pending_stop(&mut self) -> Option<Option<oneshot::Sender<()>>> {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(Command::Restart) => self.failures = 0,
                Ok(Command::Stop(ack)) => return Some(ack),
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(None),
            }
        }
    }

    /// Publish a channel for `process` and wait for it to exit or be stopped.
    async fn run_process(&mut self, mut process: ProcessHandle) -> Step<Ended> {
        let pid = process.pid();
        tracing::info!(
            service = %self.name,
            pid = %pid,
            "spawned as process {pid}"
        );
        self.emit(SupervisorEvent::Spawned { pid });

        let Some(stdio) = process.take_stdio() else {
            // ProcessHandle always starts with its pipes; treat a missing one as
            // a crashed launch.
            let exit = process.terminate(self.policy.stop_grace).await;
            self.emit(SupervisorEvent::Exited {
                pid,
                exit,
                expected: false,
            });
            return Step::Continue(Ended::Exited {
                uptime: Duration::ZERO,
            });
        };

        let id = self.next_channel;
        self.next_channel = id.next();
        let channel = self.factory.create(id, pid, stdio);
        self.last_channel.store(id.value(), Ordering::Release);

        self.transition(SupervisorState::Running);
        self.emit(SupervisorEvent::Published(Arc::clone(&channel)));
        let started = Instant::now();

        let wake = tokio::select! {
            biased;
            cmd = self.cmd_rx.recv() => Wake::Command(cmd.unwrap_or(Command::Stop(None))),
            exit = process.wait() => Wake::Exited(exit),
            () = channel.closed() => Wake::ChannelClosed,
        };

        let command = match wake {
            Wake::Command(command) => command,
            Wake::Exited(exit) => {
                self.withdraw(channel.as_ref());
                // The leader is gone; whatever it left in its group goes too.
                process.kill_group();
                tracing::info!(service = %self.name, pid = %pid, %exit, "process {pid} exited");
                self.emit(SupervisorEvent::Exited {
                    pid,
                    exit,
                    expected: false,
                });
                return Step::Continue(Ended::Exited {
                    uptime: started.elapsed(),
                });
            }
            Wake::ChannelClosed => {
                // Unreachable through its channel, so the process is replaced.
                self.withdraw(channel.as_ref());
                let exit = process.terminate(self.policy.stop_grace).await;
                tracing::info!(
                    service = %self.name,
                    pid = %pid,
                    %exit,
                    "channel {id} closed, process {pid} ended"
                );
                self.emit(SupervisorEvent::Exited {
                    pid,
                    exit,
                    expected: false,
                });
                return Step::Continue(Ended::Exited {
                    uptime: started.elapsed(),
                });
            }
        };

        // Invalidate before terminating: no write may reach a dying process.
        self.withdraw(channel.as_ref());
        let exit = process.terminate(self.policy.stop_grace).await;
        tracing::info!(service = %self.name, pid = %pid, %exit, "process {pid} terminated");
        self.emit(SupervisorEvent::Exited {
            pid,
            exit,
            expected: true,
        });

        match command {
            Command::Stop(ack) => Step::Stop(ack),
            Command::Restart => Step::Continue(Ended::Restart),
        }
    }

    fn withdraw(&self, channel: &F::Channel) {
        channel.invalidate();
        self.emit(SupervisorEvent::Invalidated(channel.id()));
    }

    fn finish(&mut self, reason: StopReason, mut acks: Vec<oneshot::Sender<()>>) {
        self.transition(SupervisorState::Stopped);
        match &reason {
            StopReason::Requested => tracing::info!(service = %self.name, "stopped"),
            StopReason::SpawnFailed(err) => {
                tracing::warn!(service = %self.name, "stopped: {err}");
            }
            StopReason::RestartsExhausted { attempts } => {
                tracing::warn!(
                    service = %self.name,
                    "stopped: giving up after {attempts} failed launches"
                );
            }
        }
        self.emit(SupervisorEvent::Stopped(reason));

        // Late stop requests are answered too; new ones fail to send.
        self.cmd_rx.close();
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            if let Command::Stop(Some(ack)) = cmd {
                acks.push(ack);
            }
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }

    fn transition(&mut self, next: SupervisorState) {
        let current = *self.state_tx.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::error!(
                service = %self.name,
                "invalid state transition {current} -> {next}"
            );
            debug_assert!(false, "invalid state transition {current} -> {next}");
        }
        tracing::debug!(service = %self.name, state = %next, "state changed");
        self.state_tx.send_replace(next);
        self.emit(SupervisorEvent::StateChanged(next));
    }

    fn emit(&self, event: SupervisorEvent<F::Channel>) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_event(event);
        }
    }
}
