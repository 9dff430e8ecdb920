//! Background sync.
//!
//! The page registers the configured tag when connectivity returns; what the
//! worker does then is up to the embedding application's [`SyncHandler`].

use futures::future::{self, BoxFuture, FutureExt};
use tracing::{debug, info, warn};

use crate::worker::ServiceWorker;
use crate::{Result, ServiceWorkerError};

/// Work to run when a background sync fires.
pub trait SyncHandler: Send + Sync {
    fn sync<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, pwakit_common::Result<()>>;
}

/// Handler that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSync;

impl SyncHandler for NoopSync {
    fn sync<'a>(&'a self, tag: &'a str) -> BoxFuture<'a, pwakit_common::Result<()>> {
        debug!(tag, "No sync handler installed");
        future::ready(Ok(())).boxed()
    }
}

impl ServiceWorker {
    /// Run a background sync for `tag`.
    ///
    /// Returns `Ok(false)` for tags other than the configured one. Handler
    /// errors are returned so the host can retry later.
    pub async fn handle_sync(&self, tag: &str) -> Result<bool> {
        if !self.is_active() {
            return Err(ServiceWorkerError::StateError(format!(
                "sync on inactive worker {}",
                self.id.raw()
            )));
        }
        if tag != self.config.sync_tag {
            debug!(worker = self.id.raw(), tag, "Ignoring sync tag");
            return Ok(false);
        }

        match self.sync_handler.sync(tag).await {
            Ok(()) => {
                info!(worker = self.id.raw(), tag, "Background sync complete");
                Ok(true)
            }
            Err(e) => {
                warn!(worker = self.id.raw(), tag, error = %e, "Background sync failed");
                Err(ServiceWorkerError::SyncFailed {
                    tag: tag.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }
}
