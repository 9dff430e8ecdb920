//! The service worker global scope.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use pwakit_net::{Fetcher, Request};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::control::VersionClock;
use crate::lifecycle::ServiceWorkerState;
use crate::strategy::{CacheController, FetchOutcome};
use crate::sync::{NoopSync, SyncHandler};
use crate::Result;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// One version of the service worker for a scope.
///
/// Every worker version of an origin shares the same [`CacheStorage`] and
/// [`Clients`]; the partitions it owns are named from its config.
pub struct ServiceWorker {
    pub(crate) id: ServiceWorkerId,
    pub(crate) scope: Url,
    pub(crate) config: Arc<WorkerConfig>,
    pub(crate) state: watch::Sender<ServiceWorkerState>,
    pub(crate) controller: CacheController,
    pub(crate) caches: Arc<CacheStorage>,
    pub(crate) clients: Arc<RwLock<Clients>>,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) skip_waiting: AtomicBool,
    pub(crate) clock: VersionClock,
    pub(crate) sync_handler: Arc<dyn SyncHandler>,
}

impl ServiceWorker {
    /// Create a worker in the `Parsed` state.
    pub fn new(
        scope: Url,
        config: WorkerConfig,
        caches: Arc<CacheStorage>,
        clients: Arc<RwLock<Clients>>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let controller = CacheController::new(
            scope.clone(),
            Arc::clone(&config),
            Arc::clone(&caches),
            Arc::clone(&fetcher),
        )?;
        let (state, _) = watch::channel(ServiceWorkerState::Parsed);

        Ok(Self {
            id: ServiceWorkerId::new(),
            scope,
            config,
            state,
            controller,
            caches,
            clients,
            fetcher,
            skip_waiting: AtomicBool::new(false),
            clock: VersionClock::default(),
            sync_handler: Arc::new(NoopSync),
        })
    }

    /// Replace the background sync handler.
    pub fn with_sync_handler(mut self, handler: Arc<dyn SyncHandler>) -> Self {
        self.sync_handler = handler;
        self
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<CacheStorage> {
        &self.caches
    }

    /// Current state.
    pub fn state(&self) -> ServiceWorkerState {
        *self.state.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<ServiceWorkerState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, state: ServiceWorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(worker = self.id.raw(), from = ?previous, to = ?state, "Worker state changed");
        }
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state() == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state() == ServiceWorkerState::Redundant
    }

    /// Ask to be promoted without waiting for controlled pages to close.
    pub fn skip_waiting(&self) {
        if !self.skip_waiting.swap(true, Ordering::AcqRel) {
            info!(worker = self.id.raw(), "Skip waiting requested");
        }
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::Acquire)
    }

    /// Handle an intercepted fetch. Only an activated worker serves fetches.
    pub async fn handle_fetch(&self, request: Request) -> FetchOutcome {
        if !self.is_active() {
            debug!(worker = self.id.raw(), url = %request.url, "Worker not active, bypassing");
            return FetchOutcome::Bypass;
        }
        self.controller.handle(request).await
    }

    /// Wait for background cache refreshes started by earlier fetches.
    pub async fn settle(&self) {
        self.controller.settle().await;
    }
}

impl std::fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("scope", &self.scope.as_str())
            .field("version", &self.config.version)
            .field("state", &self.state())
            .finish()
    }
}
