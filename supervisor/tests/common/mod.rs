//! Shared fixtures: descriptors for `sh`/`cat` children, a launcher that
//! counts spawns, and helpers that wait on queued channel updates.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tether_supervisor::{
    ChannelUpdate, Launch, LaunchDescriptor, LineChannel, LineChannelFactory, OsLauncher,
    RestartPolicy, Sandbox, Service, SpawnFut, Unavailable, UpdateQueue,
};

const WAIT: Duration = Duration::from_secs(5);

/// Echoes every line back.
pub fn echo() -> LaunchDescriptor {
    LaunchDescriptor::builder("cat", std::env::temp_dir())
        .build()
        .unwrap()
}

pub fn sh(script: &str) -> LaunchDescriptor {
    LaunchDescriptor::builder("sh", std::env::temp_dir())
        .args(["-c", script])
        .build()
        .unwrap()
}

/// Echoes lines until it reads `die`, then exits with code 3.
pub fn mortal() -> LaunchDescriptor {
    sh(r#"while read line; do if [ "$line" = die ]; then exit 3; fi; echo "$line"; done"#)
}

/// Ignores SIGTERM, so stopping it takes the whole grace period.
pub fn stubborn() -> LaunchDescriptor {
    sh("trap '' TERM; while :; do sleep 1; done")
}

/// Closes its stdout but keeps running.
pub fn mute() -> LaunchDescriptor {
    sh("exec 1>&-; while :; do sleep 1; done")
}

pub fn missing() -> LaunchDescriptor {
    LaunchDescriptor::builder("tether-test-no-such-program", std::env::temp_dir())
        .build()
        .unwrap()
}

pub fn fast_policy() -> RestartPolicy {
    RestartPolicy::default()
        .with_cooldown(Duration::from_millis(10))
        .with_stop_grace(Duration::from_millis(500))
}

/// Spawns through the OS launcher, counting attempts. Every spawn after the
/// first is delayed by `relaunch_delay`.
#[derive(Default)]
pub struct CountingLauncher {
    spawns: AtomicUsize,
    relaunch_delay: Duration,
}

impl CountingLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn slow_relaunch(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            spawns: AtomicUsize::new(0),
            relaunch_delay: delay,
        })
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl Launch for CountingLauncher {
    fn spawn<'a>(&'a self, descriptor: &'a LaunchDescriptor) -> SpawnFut<'a> {
        let attempt = self.spawns.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if attempt > 0 {
                tokio::time::sleep(self.relaunch_delay).await;
            }
            OsLauncher::with_sandbox(Sandbox::None)
                .spawn(descriptor)
                .await
        })
    }
}

pub fn service(
    descriptor: LaunchDescriptor,
    policy: RestartPolicy,
    launcher: &Arc<CountingLauncher>,
) -> Service<LineChannelFactory> {
    let launcher: Arc<dyn Launch> = Arc::<CountingLauncher>::clone(launcher);
    Service::new("test", descriptor, LineChannelFactory, policy).with_launcher(launcher)
}

pub async fn next_update(queue: &mut UpdateQueue<LineChannel>) -> ChannelUpdate<LineChannel> {
    tokio::time::timeout(WAIT, queue.recv())
        .await
        .expect("timed out waiting for channel update")
        .expect("observer dropped")
}

/// Skip updates until a channel is published.
pub async fn next_published(queue: &mut UpdateQueue<LineChannel>) -> Arc<LineChannel> {
    loop {
        if let ChannelUpdate::Published(channel) = next_update(queue).await {
            return channel;
        }
    }
}

/// Skip updates until the service reports itself unavailable.
pub async fn next_unavailable(queue: &mut UpdateQueue<LineChannel>) -> Unavailable {
    loop {
        if let ChannelUpdate::Unavailable(reason) = next_update(queue).await {
            return reason;
        }
    }
}

/// Whatever is queued right now, without waiting.
pub fn drain(queue: &mut UpdateQueue<LineChannel>) -> Vec<ChannelUpdate<LineChannel>> {
    let mut updates = Vec::new();
    queue.poll(usize::MAX, |update| updates.push(update));
    updates
}

/// Let the coordination task run for a while.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}

/// Whether a process with this pid still exists.
pub fn alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}
