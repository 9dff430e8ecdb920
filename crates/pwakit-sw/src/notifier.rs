//! Page-side update handling.
//!
//! A newly installed worker while the page already has a controller means an
//! update is available: the page shows a prompt, and accepting it sends
//! `SKIP_WAITING` to the waiting worker. The page reloads once, on the first
//! controller change.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::container::{ServiceWorkerContainer, ServiceWorkerEvent, WorkerTarget};
use crate::control::ControlMessage;
use crate::lifecycle::ServiceWorkerState;
use crate::Result;

/// Toast severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    Info,
    Success,
    Error,
}

/// The UI the notifier drives.
pub trait PageHost: Send {
    fn show_update_prompt(&mut self);
    fn hide_update_prompt(&mut self);
    fn reload(&mut self);
    fn show_connection_status(&mut self, online: bool);
    fn toast(&mut self, message: &str, kind: ToastKind);
}

/// Snapshot of the page's app state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppInfo {
    pub update_available: bool,
    pub online: bool,
    pub has_service_worker: bool,
}

/// Watches one page's registration and surfaces updates.
pub struct UpdateNotifier<H> {
    container: Arc<ServiceWorkerContainer>,
    scope: String,
    client_id: String,
    host: H,
    has_controller: bool,
    update_available: bool,
    refreshing: bool,
    online: bool,
}

impl<H: PageHost> UpdateNotifier<H> {
    /// Create a notifier for the page `client_id` under `scope`.
    pub async fn new(
        container: Arc<ServiceWorkerContainer>,
        scope: impl Into<String>,
        client_id: impl Into<String>,
        host: H,
    ) -> Self {
        let client_id = client_id.into();
        let has_controller = container.controller(&client_id).await.is_some();
        Self {
            container,
            scope: scope.into(),
            client_id,
            host,
            has_controller,
            update_available: false,
            refreshing: false,
            online: true,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn update_available(&self) -> bool {
        self.update_available
    }

    /// React to one container event.
    pub fn handle_event(&mut self, event: &ServiceWorkerEvent) {
        match event {
            ServiceWorkerEvent::StateChange {
                registration_scope,
                worker_id,
                new_state: ServiceWorkerState::Installed,
            } if *registration_scope == self.scope => {
                if self.has_controller {
                    info!(worker = worker_id.raw(), "Update available");
                    self.update_available = true;
                    self.host.show_update_prompt();
                } else {
                    info!(worker = worker_id.raw(), "Service worker installed for the first time");
                    self.host.toast("Ready to work offline", ToastKind::Success);
                }
            }
            ServiceWorkerEvent::InstallFailed {
                registration_scope,
                reason,
                ..
            } if *registration_scope == self.scope => {
                warn!(reason = %reason, "Service worker install failed");
                self.host.toast("Update could not be installed", ToastKind::Error);
            }
            ServiceWorkerEvent::ControllerChange { client_id, worker_id }
                if *client_id == self.client_id =>
            {
                self.has_controller = true;
                if self.refreshing {
                    debug!(worker = worker_id.raw(), "Controller changed again, already reloading");
                    return;
                }
                self.refreshing = true;
                self.update_available = false;
                info!(worker = worker_id.raw(), "Controller changed, reloading");
                self.host.reload();
            }
            _ => {}
        }
    }

    /// Accept the update: tell the waiting worker to skip waiting.
    ///
    /// Returns `false` when there is no waiting worker.
    pub async fn accept_update(&mut self) -> Result<bool> {
        if self
            .container
            .worker(&self.scope, WorkerTarget::Waiting)
            .await
            .is_none()
        {
            warn!(scope = %self.scope, "No update available");
            return Ok(false);
        }
        self.host.hide_update_prompt();
        self.host.toast("Updating app...", ToastKind::Info);
        self.container
            .post_message(&self.scope, WorkerTarget::Waiting, ControlMessage::SkipWaiting)
            .await?;
        Ok(true)
    }

    /// Hide the prompt. The update stays available.
    pub fn dismiss_update(&mut self) {
        self.host.hide_update_prompt();
    }

    /// Connectivity changed. Coming back online requests a background sync.
    pub async fn set_online(&mut self, online: bool) {
        self.online = online;
        self.host.show_connection_status(online);
        if !online {
            return;
        }

        let Some(worker) = self.container.worker(&self.scope, WorkerTarget::Active).await else {
            return;
        };
        let tag = worker.config().sync_tag.clone();
        match self.container.sync(&self.scope, &tag).await {
            Ok(_) => debug!(tag = %tag, "Sync requested"),
            Err(e) => warn!(tag = %tag, error = %e, "Sync request failed"),
        }
    }

    pub async fn app_info(&self) -> AppInfo {
        AppInfo {
            update_available: self.update_available,
            online: self.online,
            has_service_worker: self
                .container
                .get_registrations()
                .await
                .contains(&self.scope),
        }
    }

    /// Handle every event already queued. Returns how many were handled.
    pub fn pump(&mut self, events: &mut mpsc::UnboundedReceiver<ServiceWorkerEvent>) -> usize {
        let mut handled = 0;
        while let Ok(event) = events.try_recv() {
            self.handle_event(&event);
            handled += 1;
        }
        handled
    }
}
