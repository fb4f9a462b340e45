//! Per-project service registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tether_types::ProjectKey;
use tokio::task::JoinSet;

use crate::channel::ChannelFactory;
use crate::lock;
use crate::service::Service;

/// One [`Service`] per project root, created on first request.
///
/// Keys are canonicalized, so `/work/app` and `/work/app/../app` name the
/// same project. A root that cannot be canonicalized (it does not exist yet)
/// is used as given.
pub struct ProjectServices<F: ChannelFactory> {
    services: Mutex<HashMap<ProjectKey, Arc<Service<F>>>>,
}

impl<F: ChannelFactory> Default for ProjectServices<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ChannelFactory> ProjectServices<F> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
        }
    }

    /// The key a project root is stored under.
    #[must_use]
    pub fn canonical_key(key: &ProjectKey) -> ProjectKey {
        match std::fs::canonicalize(key.root()) {
            Ok(root) => ProjectKey::new(root),
            Err(_) => key.clone(),
        }
    }

    /// The project's service, built with `make` if there is none yet.
    ///
    /// `make` runs with the registry locked and must not call back into it.
    pub fn get_or_create(
        &self,
        key: &ProjectKey,
        make: impl FnOnce(&ProjectKey) -> Service<F>,
    ) -> Arc<Service<F>> {
        let key = Self::canonical_key(key);
        let mut services = lock(&self.services);
        if let Some(service) = services.get(&key) {
            return Arc::clone(service);
        }

        let service = Arc::new(make(&key));
        tracing::debug!(project = %key, service = %service.name(), "created service");
        services.insert(key, Arc::clone(&service));
        service
    }

    #[must_use]
    pub fn get(&self, key: &ProjectKey) -> Option<Arc<Service<F>>> {
        let key = Self::canonical_key(key);
        lock(&self.services).get(&key).cloned()
    }

    /// Remove the project's service and stop it. Returns whether there was one.
    pub async fn close(&self, key: &ProjectKey) -> bool {
        let key = Self::canonical_key(key);
        let removed = lock(&self.services).remove(&key);
        match removed {
            Some(service) => {
                tracing::info!(project = %key, service = %service.name(), "closing project");
                service.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop and remove every service.
    pub async fn shutdown(&self) {
        let services: Vec<_> = lock(&self.services).drain().collect();
        if services.is_empty() {
            return;
        }
        tracing::info!(count = services.len(), "shutting down project services");

        let mut stopping = JoinSet::new();
        for (_, service) in services {
            stopping.spawn(async move { service.stop().await });
        }
        while stopping.join_next().await.is_some() {}
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.services).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.services).is_empty()
    }

    /// Keys of all open projects, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<ProjectKey> {
        let mut keys: Vec<_> = lock(&self.services).keys().cloned().collect();
        keys.sort();
        keys
    }
}
