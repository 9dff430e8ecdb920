//! Worker lifecycle: install and activate.
//!
//! ```text
//! Parsed → Installing → Installed ─(skip waiting | no active worker)→ Activating → Activated
//!              └──────────→ Redundant (install failed, or replaced)
//! ```

use futures::future::try_join_all;
use pwakit_net::Request;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::cache::CacheEntry;
use crate::worker::ServiceWorker;
use crate::{Result, ServiceWorkerError};

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, not yet installing.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

impl ServiceWorker {
    /// Precache the static manifest.
    ///
    /// Every manifest entry must come back 2xx. On any failure nothing is
    /// written, the worker becomes redundant and the error is returned.
    pub async fn install(&self) -> Result<()> {
        if self.state() != ServiceWorkerState::Parsed {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot install from {:?}",
                self.state()
            )));
        }
        self.set_state(ServiceWorkerState::Installing);
        info!(
            worker = self.id.raw(),
            version = %self.config.version,
            files = self.config.static_files.len(),
            "Installing service worker"
        );

        match self.precache().await {
            Ok(()) => {
                self.set_state(ServiceWorkerState::Installed);
                info!(worker = self.id.raw(), "Service worker installed");
                if self.config.skip_waiting_on_install {
                    self.skip_waiting();
                }
                Ok(())
            }
            Err(e) => {
                error!(worker = self.id.raw(), error = %e, "Service worker install failed");
                self.set_state(ServiceWorkerState::Redundant);
                Err(e)
            }
        }
    }

    async fn precache(&self) -> Result<()> {
        let fetches = self.config.static_files.iter().map(|path| async move {
            let url = self
                .scope
                .join(path)
                .map_err(|e| ServiceWorkerError::InstallFailed {
                    url: path.clone(),
                    reason: e.to_string(),
                })?;
            let request = Request::get(url);
            let response = self
                .fetcher
                .fetch(request.clone())
                .await
                .map_err(|e| ServiceWorkerError::InstallFailed {
                    url: request.url.to_string(),
                    reason: e.to_string(),
                })?;
            if !response.ok() {
                return Err(ServiceWorkerError::InstallFailed {
                    url: request.url.to_string(),
                    reason: format!("HTTP {}", response.status),
                });
            }
            Ok::<_, ServiceWorkerError>(CacheEntry::from_response(&request, &response))
        });
        let entries = try_join_all(fetches).await?;

        // A failed put_all leaves the partition as it was, which may be the
        // live partition of an active worker with the same version.
        self.caches
            .put_all(&self.config.static_cache_name(), entries)
            .await?;
        self.caches.open(&self.config.dynamic_cache_name()).await
    }

    /// Prune partitions from other versions, then claim open clients.
    ///
    /// Returns the ids of clients whose controller changed. Deletion always
    /// completes before the claim, and a failed deletion fails activation.
    pub async fn activate(&self) -> Result<Vec<String>> {
        if self.state() != ServiceWorkerState::Installed {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot activate from {:?}",
                self.state()
            )));
        }
        self.set_state(ServiceWorkerState::Activating);

        let keep = [
            self.config.static_cache_name(),
            self.config.dynamic_cache_name(),
        ];
        let stale: Vec<String> = self
            .caches
            .keys()
            .await
            .into_iter()
            .filter(|name| !keep.contains(name))
            .collect();

        let deletions = stale.iter().map(|name| async move {
            self.caches
                .delete(name)
                .await
                .map_err(|e| ServiceWorkerError::ActivationFailed(format!("delete {name}: {e}")))?;
            info!(cache = %name, "Deleted stale cache partition");
            Ok::<_, ServiceWorkerError>(())
        });
        if let Err(e) = try_join_all(deletions).await {
            error!(worker = self.id.raw(), error = %e, "Service worker activation failed");
            self.set_state(ServiceWorkerState::Redundant);
            return Err(e);
        }

        let claimed = self.clients.write().await.claim(self.id, &self.scope);
        self.set_state(ServiceWorkerState::Activated);
        info!(
            worker = self.id.raw(),
            pruned = stale.len(),
            claimed = claimed.len(),
            "Service worker activated"
        );
        Ok(claimed)
    }
}
