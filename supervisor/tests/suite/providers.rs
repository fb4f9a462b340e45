//! Feature providers on top of a live service, and the per-project registry.

use std::sync::Arc;
use std::time::Duration;

use tether_supervisor::{
    Channel, ChannelError, ChannelSource, FeatureBinding, LineChannel, LineChannelFactory,
    ProjectKey, ProjectServices, Service, SupervisorState, Unavailable,
};

use crate::common::{CountingLauncher, echo, fast_policy, missing, mortal, service, sh};

/// Poll the binding until it hands out a channel other than `not`.
async fn wait_for_channel(
    binding: &FeatureBinding<LineChannel>,
    not: Option<&Arc<LineChannel>>,
) -> Arc<LineChannel> {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(channel) = binding.channel()
                && not.is_none_or(|old| old.id() != channel.id())
            {
                return channel;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("binding never received a channel")
}

/// Issue a request, retrying once on the next channel if the first one was
/// invalidated underneath it.
async fn request_with_retry(
    binding: &FeatureBinding<LineChannel>,
    line: &str,
) -> Result<String, ChannelError> {
    let channel = wait_for_channel(binding, None).await;
    match channel.request(line).await {
        Err(ChannelError::Invalidated(_)) => {
            let next = wait_for_channel(binding, Some(&channel)).await;
            next.request(line).await
        }
        other => other,
    }
}

#[tokio::test]
async fn test_binding_follows_restarts() {
    let launcher = CountingLauncher::new();
    let service = service(mortal(), fast_policy(), &launcher);
    let binding = FeatureBinding::new("completion");
    binding.activate(&service);

    assert_eq!(request_with_retry(&binding, "one").await.unwrap(), "one");

    let first = wait_for_channel(&binding, None).await;
    assert!(first.request("die").await.unwrap_err().is_invalidated());
    assert_eq!(request_with_retry(&binding, "two").await.unwrap(), "two");
    let second = wait_for_channel(&binding, None).await;
    assert_ne!(first.id(), second.id());

    service.stop().await;
    assert!(matches!(binding.channel(), Err(Unavailable::Stopped)));
}

#[tokio::test]
async fn test_deactivate_leaves_service_running() {
    let launcher = CountingLauncher::new();
    let service = service(echo(), fast_policy(), &launcher);
    let hover = FeatureBinding::new("hover");
    let rename = FeatureBinding::new("rename");
    hover.activate(&service);
    rename.activate(&service);
    assert_eq!(service.subscriber_count(), 2);

    let channel = wait_for_channel(&hover, None).await;
    hover.deactivate();
    assert!(!hover.is_active());
    assert_eq!(service.subscriber_count(), 1);
    assert!(!channel.is_invalidated());
    assert_eq!(service.state(), SupervisorState::Running);
    assert_eq!(rename.channel().unwrap().id(), channel.id());

    hover.activate(&service);
    assert_eq!(hover.channel().unwrap().id(), channel.id());
    assert_eq!(launcher.spawns(), 1);

    service.stop().await;
}

#[tokio::test]
async fn test_binding_reports_missing_tool() {
    let launcher = CountingLauncher::new();
    let service = service(missing(), fast_policy(), &launcher);
    let binding = FeatureBinding::new("diagnostics");
    binding.activate(&service);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !matches!(binding.channel(), Err(Unavailable::SpawnFailed(_))) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("failure never reported");
    assert_eq!(launcher.spawns(), 1);
}

#[tokio::test]
async fn test_service_is_a_channel_source() {
    let launcher = CountingLauncher::new();
    let service = service(echo(), fast_policy(), &launcher);
    let source: &dyn ChannelSource<LineChannel> = &service;
    assert!(matches!(source.channel(), Err(Unavailable::NotStarted)));

    source.ensure_started();
    let binding = FeatureBinding::new("format");
    binding.activate(source);
    let channel = wait_for_channel(&binding, None).await;
    assert_eq!(source.current_channel().unwrap().id(), channel.id());

    service.stop().await;
}

#[tokio::test]
async fn test_projects_get_independent_services() {
    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    let projects = ProjectServices::<LineChannelFactory>::new();
    let make = |key: &ProjectKey| {
        let descriptor = tether_supervisor::LaunchDescriptor::builder("sh", key.root())
            .args(["-c", r#"while read line; do echo "$(pwd):$line"; done"#])
            .build()
            .unwrap();
        Service::new("pwd", descriptor, LineChannelFactory, fast_policy())
    };

    let first = projects.get_or_create(&ProjectKey::new(a.path()), make);
    let second = projects.get_or_create(&ProjectKey::new(b.path()), make);
    let again = projects.get_or_create(&ProjectKey::new(a.path()), make);
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(projects.len(), 2);

    let binding = FeatureBinding::new("pwd");
    binding.activate(&*first);
    let reply = wait_for_channel(&binding, None)
        .await
        .request("x")
        .await
        .unwrap();
    let root = std::fs::canonicalize(a.path()).unwrap();
    assert_eq!(reply, format!("{}:x", root.display()));
    assert_eq!(second.state(), SupervisorState::Idle);

    projects.shutdown().await;
    assert!(projects.is_empty());
    assert_eq!(first.state(), SupervisorState::Stopped);
    assert_eq!(second.state(), SupervisorState::Stopped);
    assert!(matches!(binding.channel(), Err(Unavailable::Stopped)));
}

#[tokio::test]
async fn test_stderr_noise_does_not_disturb_channel() {
    let launcher = CountingLauncher::new();
    let service = service(
        sh(r#"while read line; do echo "noise" >&2; echo "$line"; done"#),
        fast_policy(),
        &launcher,
    );
    let binding = FeatureBinding::new("noisy");
    binding.activate(&service);

    assert_eq!(request_with_retry(&binding, "a").await.unwrap(), "a");
    assert_eq!(request_with_retry(&binding, "b").await.unwrap(), "b");

    service.stop().await;
}
