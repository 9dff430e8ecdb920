//! Page-side entry point (`navigator.serviceWorker`).
//!
//! Owns the registrations of an origin, drives install and activation, and
//! reports every transition on an event channel for the [`UpdateNotifier`].
//!
//! [`UpdateNotifier`]: crate::notifier::UpdateNotifier

use std::sync::Arc;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use pwakit_net::{Fetcher, NetError, Request};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::cache::CacheStorage;
use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::control::{reply_channel, ControlMessage, ControlReply};
use crate::lifecycle::ServiceWorkerState;
use crate::push::{ClickOutcome, Notification};
use crate::registration::ServiceWorkerRegistration;
use crate::strategy::{FetchOutcome, ServedResponse};
use crate::sync::{NoopSync, SyncHandler};
use crate::worker::{ServiceWorker, ServiceWorkerId};
use crate::{Result, ServiceWorkerError};

/// Which worker of a registration a message goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTarget {
    Active,
    Waiting,
}

/// Service worker events.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceWorkerEvent {
    /// A new worker version started installing.
    UpdateFound { registration_scope: String },
    /// State changed.
    StateChange {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// Install failed; the worker was discarded.
    InstallFailed {
        registration_scope: String,
        worker_id: ServiceWorkerId,
        reason: String,
    },
    /// A client got a new controller.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}

/// Service worker container.
pub struct ServiceWorkerContainer {
    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    /// Cache storage shared by every worker of the origin.
    pub caches: Arc<CacheStorage>,

    /// Clients.
    pub clients: Arc<RwLock<Clients>>,

    fetcher: Arc<dyn Fetcher>,
    sync_handler: Arc<dyn SyncHandler>,

    /// Notifications currently shown, one per tag.
    notifications: RwLock<Vec<Notification>>,

    /// Event sender for state changes.
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a new container.
    pub fn new(
        caches: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registrations: Arc::new(RwLock::new(HashMap::new())),
                caches,
                clients: Arc::new(RwLock::new(Clients::new())),
                fetcher,
                sync_handler: Arc::new(NoopSync),
                notifications: RwLock::new(Vec::new()),
                event_tx,
            },
            event_rx,
        )
    }

    /// Use `handler` for background sync in workers registered from now on.
    pub fn with_sync_handler(mut self, handler: Arc<dyn SyncHandler>) -> Self {
        self.sync_handler = handler;
        self
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, scope: &str, worker: &ServiceWorker) {
        self.emit(ServiceWorkerEvent::StateChange {
            registration_scope: scope.to_string(),
            worker_id: worker.id(),
            new_state: worker.state(),
        });
    }

    /// Register (or update) the worker for `scope` and install it.
    ///
    /// The new worker activates right away when nothing is active yet or
    /// when it asked to skip waiting. Otherwise it stays waiting.
    pub async fn register(&self, scope: &str, config: WorkerConfig) -> Result<Arc<ServiceWorker>> {
        let scope = Url::parse(scope)
            .map_err(|e| ServiceWorkerError::RegistrationFailed(format!("{scope}: {e}")))?;
        let scope_str = scope.to_string();

        let worker = Arc::new(
            ServiceWorker::new(
                scope.clone(),
                config,
                Arc::clone(&self.caches),
                Arc::clone(&self.clients),
                Arc::clone(&self.fetcher),
            )?
            .with_sync_handler(Arc::clone(&self.sync_handler)),
        );

        self.registrations
            .write()
            .await
            .entry(scope_str.clone())
            .or_insert_with(|| ServiceWorkerRegistration::new(scope))
            .update(Arc::clone(&worker));
        info!(scope = %scope_str, worker = worker.id().raw(), "Registering service worker");
        self.emit(ServiceWorkerEvent::UpdateFound {
            registration_scope: scope_str.clone(),
        });

        let installed = worker.install().await;
        let (installed, has_active) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(&scope_str)
                .ok_or_else(|| ServiceWorkerError::NotFound(scope_str.clone()))?;
            let installed = match installed {
                Ok(()) => {
                    if registration.install_complete(&worker) {
                        Ok(())
                    } else {
                        Err(ServiceWorkerError::StateError(format!(
                            "worker {} superseded during install",
                            worker.id().raw()
                        )))
                    }
                }
                Err(e) => {
                    registration.install_failed(&worker);
                    Err(e)
                }
            };
            (installed, registration.active.is_some())
        };

        if let Err(e) = installed {
            self.emit(ServiceWorkerEvent::InstallFailed {
                registration_scope: scope_str.clone(),
                worker_id: worker.id(),
                reason: e.to_string(),
            });
            self.emit_state(&scope_str, &worker);
            return Err(e);
        }
        self.emit_state(&scope_str, &worker);

        if !has_active || worker.skip_waiting_requested() {
            self.activate(&scope_str).await?;
        } else {
            info!(scope = %scope_str, worker = worker.id().raw(), "New worker waiting");
        }
        Ok(worker)
    }

    /// Activate the waiting worker of `scope`.
    ///
    /// Fetches for the scope wait until activation finishes. On failure the
    /// waiting worker is discarded and the previous active worker keeps
    /// serving. Returns the ids of clients that changed controller.
    pub async fn activate(&self, scope: &str) -> Result<Vec<String>> {
        let mut registrations = self.registrations.write().await;
        let registration = registrations
            .get_mut(scope)
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
        let worker = registration
            .waiting
            .clone()
            .ok_or_else(|| ServiceWorkerError::StateError(format!("no waiting worker for {scope}")))?;

        let claimed = match worker.activate().await {
            Ok(claimed) => claimed,
            Err(e) => {
                registration.activation_failed();
                drop(registrations);
                self.emit_state(scope, &worker);
                return Err(e);
            }
        };
        let old = registration.promote();
        drop(registrations);

        if let Some(old) = old {
            self.emit_state(scope, &old);
        }
        self.emit_state(scope, &worker);
        for client_id in &claimed {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id: client_id.clone(),
                worker_id: worker.id(),
            });
        }
        Ok(claimed)
    }

    /// Get the scope of the registration covering `url`.
    pub async fn get_registration(&self, url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let registrations = self.registrations.read().await;
        registrations
            .iter()
            .filter(|(_, r)| r.covers(&url))
            .max_by_key(|(scope, _)| scope.len())
            .map(|(scope, _)| scope.clone())
    }

    /// Get all registrations.
    pub async fn get_registrations(&self) -> Vec<String> {
        let mut scopes: Vec<String> = self.registrations.read().await.keys().cloned().collect();
        scopes.sort();
        scopes
    }

    /// Unregister a service worker.
    pub async fn unregister(&self, scope: &str) -> Result<bool> {
        let mut registrations = self.registrations.write().await;
        match registrations.remove(scope) {
            Some(mut registration) => {
                registration.unregister();
                info!(scope, "Unregistered service worker");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The worker in `target` for `scope`.
    pub async fn worker(&self, scope: &str, target: WorkerTarget) -> Option<Arc<ServiceWorker>> {
        let registrations = self.registrations.read().await;
        let registration = registrations.get(scope)?;
        match target {
            WorkerTarget::Active => registration.active.clone(),
            WorkerTarget::Waiting => registration.waiting.clone(),
        }
    }

    async fn active_for(&self, url: &Url) -> Option<Arc<ServiceWorker>> {
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .filter(|r| r.covers(url))
            .max_by_key(|r| r.scope.as_str().len())
            .and_then(|r| r.active.clone())
    }

    /// Load `request` through the active worker of its scope, or straight
    /// from the network when no worker intercepts it.
    pub async fn fetch(&self, request: Request) -> std::result::Result<ServedResponse, NetError> {
        if let Some(worker) = self.active_for(&request.url).await {
            match worker.handle_fetch(request.duplicate()).await {
                FetchOutcome::Respond(served) => return Ok(served),
                FetchOutcome::Bypass => {
                    debug!(url = %request.url, "Worker bypassed request");
                }
            }
        }
        let response = self.fetcher.fetch(request).await?;
        Ok(ServedResponse::network(response))
    }

    /// Wait for background refreshes of every active worker.
    pub async fn settle(&self) {
        let workers: Vec<Arc<ServiceWorker>> = self
            .registrations
            .read()
            .await
            .values()
            .filter_map(|r| r.active.clone())
            .collect();
        for worker in workers {
            worker.settle().await;
        }
    }

    // ==================== Messaging ====================

    /// Post a control message and wait for its reply, if it has one.
    ///
    /// `SKIP_WAITING` sent to the waiting worker activates it.
    pub async fn post_message(
        &self,
        scope: &str,
        target: WorkerTarget,
        message: ControlMessage,
    ) -> Result<Option<ControlReply>> {
        let worker = self
            .worker(scope, target)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("{target:?} worker for {scope}")))?;

        if message == ControlMessage::SkipWaiting {
            worker.handle_message(message, None).await?;
            if target == WorkerTarget::Waiting {
                self.activate(scope).await?;
            }
            return Ok(None);
        }

        let (port, reply) = reply_channel();
        worker.handle_message(message, Some(port)).await?;
        Ok(reply.await.ok())
    }

    /// Post a raw JSON message.
    pub async fn post_raw_message(
        &self,
        scope: &str,
        target: WorkerTarget,
        message: &Value,
    ) -> Result<Option<ControlReply>> {
        let message = ControlMessage::from_value(message)?;
        self.post_message(scope, target, message).await
    }

    /// `GET_VERSION` on the active worker.
    pub async fn get_version(&self, scope: &str) -> Result<(String, DateTime<Utc>)> {
        match self
            .post_message(scope, WorkerTarget::Active, ControlMessage::GetVersion)
            .await?
        {
            Some(ControlReply::Version { version, timestamp }) => Ok((version, timestamp)),
            other => Err(ServiceWorkerError::InvalidMessage(format!(
                "unexpected GET_VERSION reply: {other:?}"
            ))),
        }
    }

    /// `CLEAR_CACHE` on the active worker.
    pub async fn clear_cache(&self, scope: &str) -> Result<bool> {
        let reply = self
            .post_message(scope, WorkerTarget::Active, ControlMessage::ClearCache)
            .await?;
        Ok(matches!(reply, Some(ControlReply::Success { success: true })))
    }

    /// `CACHE_URLS` on the active worker.
    pub async fn cache_urls(&self, scope: &str, urls: Vec<String>) -> Result<bool> {
        let reply = self
            .post_message(scope, WorkerTarget::Active, ControlMessage::CacheUrls { urls })
            .await?;
        Ok(matches!(reply, Some(ControlReply::Success { success: true })))
    }

    // ==================== Push & Sync ====================

    async fn active_worker(&self, scope: &str) -> Result<Arc<ServiceWorker>> {
        self.worker(scope, WorkerTarget::Active)
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("active worker for {scope}")))
    }

    /// Deliver push data. A shown notification replaces any with the same tag.
    pub async fn push(&self, scope: &str, data: &[u8]) -> Result<Option<Notification>> {
        let worker = self.active_worker(scope).await?;
        let Some(notification) = worker.handle_push(data).await? else {
            return Ok(None);
        };
        let mut shown = self.notifications.write().await;
        shown.retain(|n| n.tag != notification.tag);
        shown.push(notification.clone());
        Ok(Some(notification))
    }

    /// Notifications currently shown.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().await.clone()
    }

    /// Click the notification tagged `tag`. The notification closes first.
    pub async fn notification_click(
        &self,
        scope: &str,
        tag: &str,
        action: Option<&str>,
    ) -> Result<ClickOutcome> {
        let notification = {
            let mut shown = self.notifications.write().await;
            let index = shown
                .iter()
                .position(|n| n.tag == tag)
                .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {tag}")))?;
            shown.remove(index)
        };
        let worker = self.active_worker(scope).await?;
        worker.handle_notification_click(&notification, action).await
    }

    /// Fire a background sync on the active worker.
    pub async fn sync(&self, scope: &str, tag: &str) -> Result<bool> {
        let worker = self.active_worker(scope).await?;
        worker.handle_sync(tag).await
    }

    // ==================== Clients ====================

    /// Open a page at `url`. Pages loaded under an active worker are
    /// controlled by it from the start.
    pub async fn add_client(&self, url: Url) -> Client {
        let mut client = Client::window(url);
        client.controller = self.active_for(&client.url).await.map(|w| w.id());
        self.clients.write().await.add(client.clone());
        debug!(client = %client.id, controller = ?client.controller, "Client added");
        client
    }

    /// Close a page.
    pub async fn remove_client(&self, client_id: &str) -> Option<Client> {
        self.clients.write().await.remove(client_id)
    }

    /// The worker controlling `client_id`.
    pub async fn controller(&self, client_id: &str) -> Option<ServiceWorkerId> {
        self.clients
            .read()
            .await
            .get(client_id)
            .and_then(|client| client.controller)
    }

    /// Focus a window client.
    pub async fn focus(&self, client_id: &str) -> Result<Client> {
        self.clients.write().await.focus(client_id)
    }

    /// Open a new window.
    pub async fn open_window(&self, url: Url) -> Client {
        let controller = self.active_for(&url).await.map(|w| w.id());
        let mut clients = self.clients.write().await;
        let mut client = clients.open_window(url);
        if controller.is_some() {
            client.controller = controller;
            clients.add(client.clone());
        }
        client
    }
}

impl std::fmt::Debug for ServiceWorkerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceWorkerContainer").finish_non_exhaustive()
    }
}
