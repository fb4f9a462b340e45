//! Launch, crash, restart and stop as seen through a `Service`.

use std::sync::Arc;
use std::time::Duration;

use tether_supervisor::{
    Channel, ChannelUpdate, LineChannel, SpawnError, SupervisorState, Unavailable, queued,
};

use crate::common::{
    CountingLauncher, alive, drain, echo, fast_policy, missing, mortal, mute, next_published,
    next_unavailable, next_update, service, settle, sh, stubborn,
};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_missing_program_reported_once_per_subscriber() {
    let launcher = CountingLauncher::new();
    let service = service(missing(), fast_policy(), &launcher);
    let (first, mut first_queue) = queued::<LineChannel>();
    let (second, mut second_queue) = queued::<LineChannel>();
    let _first = service.bind(first);
    let _second = service.bind(second);

    service.ensure_started();
    for queue in [&mut first_queue, &mut second_queue] {
        let reason = next_unavailable(queue).await;
        assert!(matches!(
            reason,
            Unavailable::SpawnFailed(SpawnError::NotFound { .. })
        ));
    }

    settle().await;
    assert!(drain(&mut first_queue).is_empty());
    assert!(drain(&mut second_queue).is_empty());
    assert_eq!(launcher.spawns(), 1);
    assert!(service.current_channel().is_none());
    assert_eq!(service.state(), SupervisorState::Stopped);
    assert!(matches!(
        service.channel(),
        Err(Unavailable::SpawnFailed(_))
    ));
}

#[tokio::test]
async fn test_crash_invalidates_and_relaunches() {
    let launcher = CountingLauncher::new();
    let service = service(mortal(), fast_policy(), &launcher);
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.bind(observer);
    service.ensure_started();

    let first = next_published(&mut queue).await;
    assert_eq!(first.request("hello").await.unwrap(), "hello");

    // In flight when the process dies: fails instead of hanging.
    let err = first.request("die").await.unwrap_err();
    assert!(err.is_invalidated());

    assert!(matches!(next_update(&mut queue).await, ChannelUpdate::Withdrawn));
    let second = next_published(&mut queue).await;
    assert!(first.is_invalidated());
    assert!(first.send("late").unwrap_err().is_invalidated());
    assert_ne!(first.id(), second.id());
    assert_ne!(first.pid(), second.pid());
    assert_eq!(second.request("again").await.unwrap(), "again");
    assert_eq!(service.current_channel().unwrap().id(), second.id());
    assert_eq!(launcher.spawns(), 2);

    service.stop().await;
}

#[tokio::test]
async fn test_current_channel_tracks_latest_launch() {
    let launcher = CountingLauncher::new();
    let service = service(echo(), fast_policy(), &launcher);
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.bind(observer);
    service.ensure_started();

    let mut previous: Vec<Arc<LineChannel>> = Vec::new();
    let mut latest = next_published(&mut queue).await;
    for _ in 0..3 {
        service.restart();
        let next = next_published(&mut queue).await;
        previous.push(latest);
        latest = next;

        let current = service.current_channel().expect("channel published");
        assert_eq!(current.id(), latest.id());
        assert!(alive(current.pid().value()));
        for old in &previous {
            assert!(old.is_invalidated());
            assert!(!alive(old.pid().value()));
        }
    }

    let ids: Vec<u64> = previous.iter().map(|c| c.id().value()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(latest.id().value(), 4);

    service.stop().await;
}

#[tokio::test]
async fn test_stop_during_relaunch_publishes_nothing() {
    let launcher = CountingLauncher::slow_relaunch(Duration::from_millis(500));
    let service = service(mortal(), fast_policy(), &launcher);
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.bind(observer);
    service.ensure_started();

    let first = next_published(&mut queue).await;
    first.send("die").unwrap();
    assert!(matches!(next_update(&mut queue).await, ChannelUpdate::Withdrawn));

    // The relaunch is now waiting in the launcher.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(launcher.spawns(), 2);
    service.stop().await;

    assert_eq!(service.state(), SupervisorState::Stopped);
    assert!(service.current_channel().is_none());
    assert!(matches!(service.channel(), Err(Unavailable::Stopped)));

    tokio::time::sleep(Duration::from_millis(600)).await;
    let updates = drain(&mut queue);
    assert!(
        !updates
            .iter()
            .any(|u| matches!(u, ChannelUpdate::Published(_)))
    );
    assert!(service.current_channel().is_none());
    assert_eq!(launcher.spawns(), 2);
}

#[tokio::test]
async fn test_stop_is_final() {
    let launcher = CountingLauncher::new();
    let service = service(echo(), fast_policy(), &launcher);
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.attach(observer);

    let channel = next_published(&mut queue).await;
    let pid = channel.pid().value();
    service.stop().await;

    assert!(channel.is_invalidated());
    assert!(!alive(pid));
    assert!(matches!(
        next_update(&mut queue).await,
        ChannelUpdate::Withdrawn
    ));
    assert!(matches!(
        next_unavailable(&mut queue).await,
        Unavailable::Stopped
    ));

    service.ensure_started();
    settle().await;
    assert!(service.current_channel().is_none());
    assert_eq!(service.state(), SupervisorState::Stopped);
    assert_eq!(launcher.spawns(), 1);
    assert!(drain(&mut queue).is_empty());

    // A second stop is harmless.
    service.stop().await;
}

#[tokio::test]
async fn test_crash_loop_gives_up() {
    let launcher = CountingLauncher::new();
    let policy = fast_policy().with_max_restarts(2);
    let service = service(sh("exit 1"), policy, &launcher);
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.attach(observer);

    let reason = next_unavailable(&mut queue).await;
    assert!(matches!(
        reason,
        Unavailable::RestartsExhausted { attempts: 3 }
    ));
    assert_eq!(launcher.spawns(), 3);
    assert_eq!(service.state(), SupervisorState::Stopped);
    assert!(service.current_channel().is_none());

    settle().await;
    assert_eq!(launcher.spawns(), 3);
}

#[tokio::test]
async fn test_restart_replaces_channel_and_process() {
    let launcher = CountingLauncher::new();
    let service = service(echo(), fast_policy(), &launcher);
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.attach(observer);

    let first = next_published(&mut queue).await;
    service.restart();
    assert!(matches!(next_update(&mut queue).await, ChannelUpdate::Withdrawn));
    let second = next_published(&mut queue).await;

    assert!(first.is_invalidated());
    assert_ne!(first.id(), second.id());
    assert_ne!(first.pid(), second.pid());
    assert_eq!(second.request("ping").await.unwrap(), "ping");

    service.stop().await;
}

#[tokio::test]
async fn test_restart_after_stop_brings_service_back() {
    let launcher = CountingLauncher::new();
    let service = service(echo(), fast_policy(), &launcher);
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.attach(observer);

    let first = next_published(&mut queue).await;
    service.stop().await;
    assert!(matches!(service.channel(), Err(Unavailable::Stopped)));

    service.restart();
    let second = next_published(&mut queue).await;
    assert!(second.id() > first.id());
    assert_eq!(second.request("back").await.unwrap(), "back");
    assert_eq!(service.state(), SupervisorState::Running);
    assert_eq!(launcher.spawns(), 2);

    service.stop().await;
}

#[tokio::test]
async fn test_reconfigure_launches_from_new_descriptor() {
    let launcher = CountingLauncher::new();
    let service = service(echo(), fast_policy(), &launcher);
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.attach(observer);
    let first = next_published(&mut queue).await;
    let old = service.descriptor();

    service
        .reconfigure(sh(r#"while read line; do echo "v2:$line"; done"#))
        .await;
    let second = next_published(&mut queue).await;

    assert_eq!(*old, echo());
    assert_ne!(*service.descriptor(), *old);
    assert!(first.is_invalidated());
    assert!(second.id() > first.id());
    assert_eq!(second.request("ping").await.unwrap(), "v2:ping");

    service.stop().await;
}

#[tokio::test]
async fn test_reconfigure_with_same_descriptor_keeps_channel() {
    let launcher = CountingLauncher::new();
    let service = service(echo(), fast_policy(), &launcher);
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.attach(observer);
    let channel = next_published(&mut queue).await;

    service.reconfigure(echo()).await;
    assert!(!channel.is_invalidated());
    assert_eq!(service.current_channel().unwrap().id(), channel.id());
    assert_eq!(launcher.spawns(), 1);

    service.stop().await;
}

#[tokio::test]
async fn test_reconfigure_before_start_stays_idle() {
    let launcher = CountingLauncher::new();
    let service = service(echo(), fast_policy(), &launcher);

    service.reconfigure(sh("cat")).await;
    assert_eq!(service.state(), SupervisorState::Idle);
    assert!(matches!(service.channel(), Err(Unavailable::NotStarted)));
    assert_eq!(launcher.spawns(), 0);

    service.ensure_started();
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.bind(observer);
    let channel = next_published(&mut queue).await;
    assert_eq!(channel.request("x").await.unwrap(), "x");

    service.stop().await;
}

#[tokio::test]
async fn test_stop_during_reconfigure_stays_stopped() {
    let launcher = CountingLauncher::new();
    let policy = fast_policy().with_stop_grace(Duration::from_millis(300));
    let service = Arc::new(service(stubborn(), policy, &launcher));
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.attach(observer);
    let first = next_published(&mut queue).await;
    // Let the shell install its trap.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reconfigure = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.reconfigure(echo()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.stop().await;

    assert_eq!(service.state(), SupervisorState::Stopped);
    assert!(service.current_channel().is_none());
    assert!(matches!(service.channel(), Err(Unavailable::Stopped)));
    assert!(!alive(first.pid().value()));
    tokio::time::timeout(WAIT, reconfigure)
        .await
        .expect("reconfigure did not finish")
        .unwrap();

    settle().await;
    assert_eq!(service.state(), SupervisorState::Stopped);
    assert!(service.current_channel().is_none());
    assert!(matches!(service.channel(), Err(Unavailable::Stopped)));
    assert!(
        drain(&mut queue)
            .iter()
            .all(|update| !matches!(update, ChannelUpdate::Published(_)))
    );
    assert_eq!(launcher.spawns(), 1);
}

#[tokio::test]
async fn test_restart_during_reconfigure_publishes_new_descriptor() {
    let launcher = CountingLauncher::new();
    let policy = fast_policy().with_stop_grace(Duration::from_millis(300));
    let service = Arc::new(service(stubborn(), policy, &launcher));
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.attach(observer);
    let first = next_published(&mut queue).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reconfigure = tokio::spawn({
        let service = Arc::clone(&service);
        async move {
            service
                .reconfigure(sh(r#"while read line; do echo "v2:$line"; done"#))
                .await;
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.restart();

    let second = next_published(&mut queue).await;
    assert!(first.is_invalidated());
    assert_eq!(second.request("ping").await.unwrap(), "v2:ping");
    tokio::time::timeout(WAIT, reconfigure)
        .await
        .expect("reconfigure did not finish")
        .unwrap();

    settle().await;
    assert_eq!(service.state(), SupervisorState::Running);
    assert_eq!(service.current_channel().unwrap().id(), second.id());
    assert!(!alive(first.pid().value()));
    assert_eq!(launcher.spawns(), 2);

    service.stop().await;
}

#[tokio::test]
async fn test_channel_closed_by_process_is_withdrawn() {
    let launcher = CountingLauncher::new();
    let policy = fast_policy().with_max_restarts(1);
    let service = service(mute(), policy, &launcher);
    let (observer, mut queue) = queued::<LineChannel>();
    let _subscription = service.attach(observer);
    let first = next_published(&mut queue).await;

    assert!(matches!(next_update(&mut queue).await, ChannelUpdate::Withdrawn));
    assert!(first.is_invalidated());
    assert!(
        service
            .current_channel()
            .is_none_or(|current| current.id() != first.id())
    );

    // The muted process is replaced rather than left running unreachable.
    let second = next_published(&mut queue).await;
    assert!(second.id() > first.id());
    assert!(!alive(first.pid().value()));

    let reason = next_unavailable(&mut queue).await;
    assert!(matches!(reason, Unavailable::RestartsExhausted { .. }));
    assert!(service.current_channel().is_none());
    assert_eq!(launcher.spawns(), 2);
}
