//! Per-scope registration: the installing, waiting and active worker slots.

use std::sync::Arc;
use std::time::Instant;

use url::Url;

use crate::lifecycle::ServiceWorkerState;
use crate::worker::ServiceWorker;

/// A service worker registration.
///
/// At most one worker is active and at most one is waiting.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<Arc<ServiceWorker>>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<Arc<ServiceWorker>>,

    /// Active worker.
    pub active: Option<Arc<ServiceWorker>>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&Arc<ServiceWorker>> {
        self.active.as_ref()
    }

    /// Whether `url` falls under this registration's scope.
    pub fn covers(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    /// Start installing a new worker version.
    pub fn update(&mut self, worker: Arc<ServiceWorker>) {
        if let Some(previous) = self.installing.replace(worker) {
            previous.set_state(ServiceWorkerState::Redundant);
        }
        self.last_update_check = Some(Instant::now());
    }

    /// Move `worker` from the installing slot to the waiting slot. An older
    /// waiting worker is replaced and becomes redundant.
    ///
    /// Returns `false` when a newer registration took the installing slot in
    /// the meantime; `worker` is then redundant and no slot changes.
    pub fn install_complete(&mut self, worker: &Arc<ServiceWorker>) -> bool {
        if !self.is_installing(worker) {
            worker.set_state(ServiceWorkerState::Redundant);
            return false;
        }
        self.installing = None;
        if let Some(stale) = self.waiting.replace(Arc::clone(worker)) {
            stale.set_state(ServiceWorkerState::Redundant);
        }
        true
    }

    /// Drop `worker` after a failed install. A newer installing worker is
    /// left alone.
    pub fn install_failed(&mut self, worker: &Arc<ServiceWorker>) {
        if self.is_installing(worker) {
            self.installing = None;
        }
        worker.set_state(ServiceWorkerState::Redundant);
    }

    fn is_installing(&self, worker: &Arc<ServiceWorker>) -> bool {
        self.installing
            .as_ref()
            .is_some_and(|installing| Arc::ptr_eq(installing, worker))
    }

    /// Make the (already activated) waiting worker the active one.
    ///
    /// Returns the worker it replaced, now redundant.
    pub fn promote(&mut self) -> Option<Arc<ServiceWorker>> {
        let worker = self.waiting.take()?;
        let old = self.active.replace(worker);
        if let Some(old) = &old {
            old.set_state(ServiceWorkerState::Redundant);
        }
        old
    }

    /// Drop the waiting worker after a failed activation. The active worker
    /// stays in place.
    pub fn activation_failed(&mut self) -> Option<Arc<ServiceWorker>> {
        let worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    /// Unregister (mark every worker redundant).
    pub fn unregister(&mut self) {
        for worker in [self.active.take(), self.waiting.take(), self.installing.take()]
            .into_iter()
            .flatten()
        {
            worker.set_state(ServiceWorkerState::Redundant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CacheStorage, Clients, WorkerConfig};
    use tokio::sync::RwLock;

    fn worker(scope: &Url) -> Arc<ServiceWorker> {
        Arc::new(
            ServiceWorker::new(
                scope.clone(),
                WorkerConfig::default(),
                Arc::new(CacheStorage::new()),
                Arc::new(RwLock::new(Clients::new())),
                Arc::new(pwakit_net::ResourceLoader::new(Default::default()).unwrap()),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_registration_lifecycle() {
        let scope = Url::parse("https://example.com/").unwrap();
        let mut registration = ServiceWorkerRegistration::new(scope.clone());
        assert!(registration.covers(&scope.join("/a/b").unwrap()));

        let first = worker(&scope);
        registration.update(Arc::clone(&first));
        assert!(registration.installing.is_some());
        assert!(registration.last_update_check.is_some());

        assert!(registration.install_complete(&first));
        assert!(registration.installing.is_none());
        assert!(registration.waiting.is_some());

        assert!(registration.promote().is_none());
        assert_eq!(registration.get_active().map(|w| w.id()), Some(first.id()));

        let second = worker(&scope);
        registration.update(Arc::clone(&second));
        assert!(registration.install_complete(&second));
        let old = registration.promote().unwrap();
        assert_eq!(old.id(), first.id());
        assert!(first.is_redundant());
        assert_eq!(registration.get_active().map(|w| w.id()), Some(second.id()));
    }

    #[test]
    fn test_failed_install_leaves_active() {
        let scope = Url::parse("https://example.com/").unwrap();
        let mut registration = ServiceWorkerRegistration::new(scope.clone());
        let active = worker(&scope);
        registration.active = Some(Arc::clone(&active));

        let broken = worker(&scope);
        registration.update(Arc::clone(&broken));
        registration.install_failed(&broken);

        assert!(broken.is_redundant());
        assert!(registration.installing.is_none());
        assert_eq!(registration.get_active().map(|w| w.id()), Some(active.id()));
    }

    #[test]
    fn test_superseded_install_does_not_move_newer_worker() {
        let scope = Url::parse("https://example.com/").unwrap();
        let mut registration = ServiceWorkerRegistration::new(scope.clone());
        let older = worker(&scope);
        let newer = worker(&scope);
        registration.update(Arc::clone(&older));
        registration.update(Arc::clone(&newer));

        assert!(!registration.install_complete(&older));
        assert!(older.is_redundant());
        assert!(registration.waiting.is_none());
        assert!(Arc::ptr_eq(registration.installing.as_ref().unwrap(), &newer));

        registration.install_failed(&older);
        assert!(Arc::ptr_eq(registration.installing.as_ref().unwrap(), &newer));

        assert!(registration.install_complete(&newer));
        assert!(Arc::ptr_eq(registration.waiting.as_ref().unwrap(), &newer));
    }

    #[test]
    fn test_unregister() {
        let scope = Url::parse("https://example.com/").unwrap();
        let mut registration = ServiceWorkerRegistration::new(scope.clone());
        let active = worker(&scope);
        registration.active = Some(Arc::clone(&active));

        registration.unregister();
        assert!(registration.get_active().is_none());
        assert!(active.is_redundant());
    }
}
