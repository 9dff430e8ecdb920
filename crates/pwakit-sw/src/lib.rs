//! # pwakit Service Worker
//!
//! An offline-first caching service worker plus the page-side pieces that
//! drive it.
//!
//! ## Features
//!
//! - **Cache partitions**: versioned `static` and `dynamic` caches, optionally
//!   persisted to disk
//! - **Strategies**: cache-first, network-first, stale-while-revalidate, bypass
//! - **Offline fallback**: cached offline page for documents, JSON 503 otherwise
//! - **Lifecycle**: install (fail-fast precache), activate (prune + claim)
//! - **Control channel**: `SKIP_WAITING`, `GET_VERSION`, `CLEAR_CACHE`, `CACHE_URLS`
//! - **Push / notification click** and **background sync** hooks
//! - **Update notifier**: page-side prompt and one-shot reload
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (page side)
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing / waiting / active: ServiceWorker
//!     │       └── scope
//!     ├── CacheStorage (shared by every worker version of the origin)
//!     └── Clients
//!
//! ServiceWorker
//!     ├── CacheController ── RouteClassifier
//!     │       └── Fetcher (network)
//!     ├── lifecycle: install / activate
//!     └── control: ControlMessage → ControlReply
//!
//! UpdateNotifier ◄── ServiceWorkerEvent ── ServiceWorkerContainer
//! ```

use pwakit_common::PwaError;
use pwakit_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod clients;
pub mod config;
pub mod container;
pub mod control;
pub mod lifecycle;
pub mod notifier;
pub mod offline;
pub mod push;
pub mod registration;
pub mod route;
pub mod strategy;
pub mod sync;
pub mod worker;

pub use cache::{CacheEntry, CacheKey, CacheStorage};
pub use clients::{Client, ClientMatchOptions, ClientType, Clients};
pub use config::{NotificationDefaults, WorkerConfig};
pub use container::{ServiceWorkerContainer, ServiceWorkerEvent, WorkerTarget};
pub use control::{reply_channel, ControlMessage, ControlReply, ReplyPort};
pub use lifecycle::ServiceWorkerState;
pub use notifier::{AppInfo, PageHost, ToastKind, UpdateNotifier};
pub use push::{ClickOutcome, Notification, NotificationAction, PushPayload};
pub use registration::ServiceWorkerRegistration;
pub use route::{RouteClass, RouteClassifier};
pub use strategy::{CacheController, FetchOutcome, ResponseSource, ServedResponse};
pub use sync::{NoopSync, SyncHandler};
pub use worker::{ServiceWorker, ServiceWorkerId};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed for {url}: {reason}")]
    InstallFailed { url: String, reason: String },

    #[error("Activation failed: {0}")]
    ActivationFailed(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] NetError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown message type: {0}")]
    UnknownMessage(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Sync failed for tag {tag}: {reason}")]
    SyncFailed { tag: String, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;

impl From<ServiceWorkerError> for PwaError {
    fn from(err: ServiceWorkerError) -> Self {
        match err {
            ServiceWorkerError::NetworkError(net) => net.into(),
            ServiceWorkerError::Io(io) => PwaError::Io(io),
            ServiceWorkerError::NotFound(what) => PwaError::NotFound(what),
            ServiceWorkerError::Config(msg) => PwaError::config(msg),
            ServiceWorkerError::CacheError(msg) => PwaError::cache(msg),
            e @ (ServiceWorkerError::UnknownMessage(_) | ServiceWorkerError::InvalidMessage(_)) => {
                PwaError::message(e.to_string())
            }
            other => PwaError::lifecycle_with_source("service worker", other),
        }
    }
}
