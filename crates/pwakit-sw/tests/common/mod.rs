//! Shared fixtures: an in-memory site behind a scriptable network.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use hashbrown::HashMap;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use pwakit_net::{Fetcher, NetError, Request, Response};
use pwakit_sw::{CacheStorage, ServiceWorkerContainer, ServiceWorkerEvent, WorkerConfig};
use tokio::sync::mpsc;
use url::Url;

pub const SCOPE: &str = "https://app.test/";

#[derive(Clone)]
struct Resource {
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
}

/// Network double keyed by path. Unknown paths answer 404.
#[derive(Default)]
pub struct MockFetcher {
    resources: Mutex<HashMap<String, Resource>>,
    offline: AtomicBool,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A site serving every file of [`site_config`].
    pub fn site() -> Arc<Self> {
        let fetcher = Self::new();
        fetcher.serve("/", "text/html", "<h1>home</h1>");
        fetcher.serve("/index.html", "text/html", "<h1>home</h1>");
        fetcher.serve("/assets/css/style.css", "text/css", "body{}");
        fetcher.serve("/assets/images/logo.jpg", "image/jpeg", "JPEG");
        fetcher.serve("/manifest.json", "application/json", "{}");
        fetcher.serve("/offline.html", "text/html", "<h1>offline</h1>");
        fetcher
    }

    pub fn serve(&self, path: &str, content_type: &'static str, body: &'static str) {
        self.respond(path, StatusCode::OK, content_type, body);
    }

    pub fn respond(
        &self,
        path: &str,
        status: StatusCode,
        content_type: &'static str,
        body: &'static str,
    ) {
        self.resources.lock().unwrap().insert(
            path.to_string(),
            Resource {
                status,
                content_type,
                body: Bytes::from_static(body.as_bytes()),
            },
        );
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Number of fetches made for `path`.
    pub fn calls_to(&self, path: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.as_str() == path)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl Fetcher for MockFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'_, Result<Response, NetError>> {
        Box::pin(async move {
            let path = request.url.path().to_string();
            self.calls.lock().unwrap().push(path.clone());

            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.offline.load(Ordering::SeqCst) {
                return Err(NetError::Offline(request.url.to_string()));
            }

            let resource = self.resources.lock().unwrap().get(&path).cloned();
            let response = match resource {
                Some(resource) => {
                    let mut headers = HeaderMap::new();
                    headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static(resource.content_type),
                    );
                    Response::new(request.url, resource.status, headers, resource.body)
                }
                None => Response::new(request.url, StatusCode::NOT_FOUND, HeaderMap::new(), "not found"),
            };
            Ok(response)
        })
    }
}

/// A deployment of the site at `version`.
pub fn site_config(version: &str) -> WorkerConfig {
    WorkerConfig {
        version: version.to_string(),
        static_files: [
            "/",
            "/index.html",
            "/assets/css/style.css",
            "/assets/images/logo.jpg",
            "/manifest.json",
            "/offline.html",
        ]
        .iter()
        .map(|p| p.to_string())
        .collect(),
        dynamic_files: vec!["/dashboard".to_string(), "/portfolio.html".to_string()],
        ..WorkerConfig::default()
    }
}

pub fn url(path: &str) -> Url {
    Url::parse(SCOPE).unwrap().join(path).unwrap()
}

pub fn get(path: &str) -> Request {
    Request::get(url(path))
}

pub fn page(path: &str) -> Request {
    get(path).accept("text/html,application/xhtml+xml")
}

pub struct Harness {
    pub container: Arc<ServiceWorkerContainer>,
    pub events: mpsc::UnboundedReceiver<ServiceWorkerEvent>,
    pub fetcher: Arc<MockFetcher>,
    pub caches: Arc<CacheStorage>,
}

impl Harness {
    pub fn new() -> Self {
        let fetcher = MockFetcher::site();
        let caches = Arc::new(CacheStorage::new());
        let (container, events) = ServiceWorkerContainer::new(Arc::clone(&caches), fetcher.clone());
        Self {
            container: Arc::new(container),
            events,
            fetcher,
            caches,
        }
    }

    /// Register `version` and wait for it to be active.
    pub async fn deploy(&self, version: &str) {
        self.container
            .register(SCOPE, site_config(version))
            .await
            .unwrap();
    }

    pub fn drain_events(&mut self) -> Vec<ServiceWorkerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}
