//! Caching strategies.
//!
//! | Route          | Strategy               | Writes to                 |
//! |----------------|------------------------|---------------------------|
//! | static         | cache-first + refresh  | static                    |
//! | dynamic page   | network-first          | dynamic                   |
//! | asset          | stale-while-revalidate | static or dynamic by path |
//! | other (same origin) | network-first     | dynamic                   |
//! | cross-origin   | bypass                 | -                         |
//!
//! Only 2xx responses reached without a redirect are stored. Anything that
//! ends without a response goes to the offline fallback.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use http::Method;
use pwakit_net::{Fetcher, NetError, Request, Response};
use tokio::task::JoinSet;
use tracing::{debug, trace, warn};
use url::Url;

use crate::cache::{CacheEntry, CacheKey, CacheStorage};
use crate::config::WorkerConfig;
use crate::offline;
use crate::route::{RouteClass, RouteClassifier};
use crate::Result;

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
    OfflinePage,
    Synthesized,
}

/// A response produced by the worker.
#[derive(Debug, Clone)]
pub struct ServedResponse {
    pub response: Response,
    pub source: ResponseSource,
}

impl ServedResponse {
    pub(crate) fn network(response: Response) -> Self {
        Self {
            response,
            source: ResponseSource::Network,
        }
    }

    pub(crate) fn cached(entry: &CacheEntry) -> Self {
        Self {
            response: entry.to_response(),
            source: ResponseSource::Cache,
        }
    }
}

/// Result of intercepting a fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The worker produced a response.
    Respond(ServedResponse),
    /// Not intercepted: the caller goes to the network unmodified.
    Bypass,
}

/// Background work that outlives the fetch that started it.
#[derive(Debug, Default, Clone)]
pub(crate) struct BackgroundTasks {
    set: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        // Drop bookkeeping for tasks that already finished.
        while set.try_join_next().is_some() {}
        set.spawn(task);
    }

    /// Wait until no background task is left, including ones spawned meanwhile.
    async fn settle(&self) {
        loop {
            let mut pending = {
                let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *set)
            };
            if pending.is_empty() {
                return;
            }
            while let Some(result) = pending.join_next().await {
                if let Err(e) = result {
                    warn!(error = %e, "Background task did not complete");
                }
            }
        }
    }
}

struct ControllerInner {
    scope: Url,
    config: Arc<WorkerConfig>,
    routes: RouteClassifier,
    caches: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    tasks: BackgroundTasks,
}

/// Chooses and runs a caching strategy per intercepted request.
#[derive(Clone)]
pub struct CacheController {
    inner: Arc<ControllerInner>,
}

impl CacheController {
    pub fn new(
        scope: Url,
        config: Arc<WorkerConfig>,
        caches: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        let routes = RouteClassifier::new(&config)?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                scope,
                config,
                routes,
                caches,
                fetcher,
                tasks: BackgroundTasks::default(),
            }),
        })
    }

    pub fn routes(&self) -> &RouteClassifier {
        &self.inner.routes
    }

    /// Produce a response for `request`, or decline to intercept it.
    pub async fn handle(&self, request: Request) -> FetchOutcome {
        if !request.is_http() || request.url.origin() != self.inner.scope.origin() {
            trace!(url = %request.url, "Not intercepted");
            return FetchOutcome::Bypass;
        }

        let served = if request.method != Method::GET {
            self.network_only(&request).await
        } else {
            let route = self.inner.routes.classify(request.url.path());
            debug!(url = %request.url, ?route, "Handling fetch");
            match route {
                RouteClass::Static => self.cache_first(&request).await,
                RouteClass::DynamicPage | RouteClass::Other => self.network_first(&request).await,
                RouteClass::Asset => self.stale_while_revalidate(&request).await,
            }
        };

        let served = match served {
            Ok(served) => served,
            Err(e) => {
                warn!(url = %request.url, error = %e, "No response available, using offline fallback");
                offline::respond(
                    &self.inner.caches,
                    &self.inner.config,
                    &self.inner.scope,
                    &request,
                )
                .await
            }
        };
        FetchOutcome::Respond(served)
    }

    /// Wait for outstanding background refreshes.
    pub async fn settle(&self) {
        self.inner.tasks.settle().await;
    }

    async fn network_only(&self, request: &Request) -> std::result::Result<ServedResponse, NetError> {
        let response = self.inner.fetcher.fetch(request.clone()).await?;
        Ok(ServedResponse::network(response))
    }

    /// Serve from cache when present and refresh in the background; otherwise
    /// fetch and store into the static partition.
    async fn cache_first(&self, request: &Request) -> std::result::Result<ServedResponse, NetError> {
        let key = CacheKey::for_request(request);
        if let Some(entry) = self.inner.caches.match_request(&key).await {
            trace!(key = %key, "Cache hit");
            self.spawn_refresh(request);
            return Ok(ServedResponse::cached(&entry));
        }

        let response = self.inner.fetcher.fetch(request.clone()).await?;
        if response.cacheable() {
            self.store(&self.inner.config.static_cache_name(), request, &response)
                .await;
        }
        Ok(ServedResponse::network(response))
    }

    /// Prefer the network, storing successes into the dynamic partition; fall
    /// back to any cached copy when the network fails.
    async fn network_first(&self, request: &Request) -> std::result::Result<ServedResponse, NetError> {
        match self.inner.fetcher.fetch(request.clone()).await {
            Ok(response) => {
                if response.cacheable() {
                    self.store(&self.inner.config.dynamic_cache_name(), request, &response)
                        .await;
                }
                Ok(ServedResponse::network(response))
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Network failed, trying cache");
                let key = CacheKey::for_request(request);
                match self.inner.caches.match_request(&key).await {
                    Some(entry) => Ok(ServedResponse::cached(&entry)),
                    None => Err(e),
                }
            }
        }
    }

    /// Serve the cached copy as read now and refresh behind it; without a
    /// cached copy, wait for the network.
    async fn stale_while_revalidate(
        &self,
        request: &Request,
    ) -> std::result::Result<ServedResponse, NetError> {
        let key = CacheKey::for_request(request);
        if let Some(entry) = self.inner.caches.match_request(&key).await {
            self.spawn_refresh(request);
            return Ok(ServedResponse::cached(&entry));
        }
        let response = self.refresh(request.clone()).await?;
        Ok(ServedResponse::network(response))
    }

    /// Fetch and store into the partition matching the path.
    async fn refresh(&self, request: Request) -> std::result::Result<Response, NetError> {
        let response = self.inner.fetcher.fetch(request.clone()).await?;
        if response.cacheable() {
            let partition = if self.inner.routes.is_static(request.url.path()) {
                self.inner.config.static_cache_name()
            } else {
                self.inner.config.dynamic_cache_name()
            };
            self.store(&partition, &request, &response).await;
        }
        Ok(response)
    }

    fn spawn_refresh(&self, request: &Request) {
        let this = self.clone();
        let request = request.duplicate();
        self.inner.tasks.spawn(async move {
            let url = request.url.clone();
            match this.refresh(request).await {
                Ok(response) => trace!(url = %url, status = %response.status, "Background refresh done"),
                Err(e) => warn!(url = %url, error = %e, "Background refresh failed"),
            }
        });
    }

    async fn store(&self, partition: &str, request: &Request, response: &Response) {
        let entry = CacheEntry::from_response(request, response);
        if let Err(e) = self.inner.caches.put(partition, entry).await {
            warn!(cache = partition, url = %request.url, error = %e, "Cache write failed");
        }
    }
}
