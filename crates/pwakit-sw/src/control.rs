//! Page-to-worker control channel.
//!
//! Exactly four commands exist. Each call carries its own reply port, so
//! concurrent callers never see each other's replies.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use pwakit_net::Request;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cache::CacheEntry;
use crate::lifecycle::ServiceWorkerState;
use crate::worker::ServiceWorker;
use crate::{Result, ServiceWorkerError};

const MESSAGE_TYPES: [&str; 4] = ["SKIP_WAITING", "GET_VERSION", "CLEAR_CACHE", "CACHE_URLS"];

/// A command sent from a page to its worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Promote a waiting worker now. No reply.
    SkipWaiting,
    /// Report the cache version.
    GetVersion,
    /// Delete every cache partition of the origin.
    ClearCache,
    /// Fetch and store extra URLs into the dynamic partition.
    CacheUrls { urls: Vec<String> },
}

impl ControlMessage {
    /// Decode a raw JSON message.
    ///
    /// A `type` outside the four known commands is [`ServiceWorkerError::UnknownMessage`];
    /// a known type with a malformed payload is [`ServiceWorkerError::InvalidMessage`].
    pub fn from_value(value: &Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ServiceWorkerError::InvalidMessage("missing string field `type`".into()))?;
        if !MESSAGE_TYPES.contains(&kind) {
            return Err(ServiceWorkerError::UnknownMessage(kind.to_string()));
        }
        serde_json::from_value(value.clone())
            .map_err(|e| ServiceWorkerError::InvalidMessage(format!("{kind}: {e}")))
    }

    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::SkipWaiting => MESSAGE_TYPES[0],
            ControlMessage::GetVersion => MESSAGE_TYPES[1],
            ControlMessage::ClearCache => MESSAGE_TYPES[2],
            ControlMessage::CacheUrls { .. } => MESSAGE_TYPES[3],
        }
    }
}

/// Reply to a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlReply {
    Version {
        version: String,
        timestamp: DateTime<Utc>,
    },
    Success {
        success: bool,
    },
}

/// Sending half of a per-call reply channel.
#[derive(Debug)]
pub struct ReplyPort(oneshot::Sender<ControlReply>);

impl ReplyPort {
    /// Deliver the reply. Returns `false` if the caller stopped listening.
    pub fn send(self, reply: ControlReply) -> bool {
        self.0.send(reply).is_ok()
    }
}

/// Create a reply port and the receiver the caller awaits.
pub fn reply_channel() -> (ReplyPort, oneshot::Receiver<ControlReply>) {
    let (tx, rx) = oneshot::channel();
    (ReplyPort(tx), rx)
}

/// Millisecond clock that never repeats or goes backwards.
#[derive(Debug, Default)]
pub(crate) struct VersionClock {
    last: AtomicI64,
}

impl VersionClock {
    pub(crate) fn next(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_millis();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = now.max(prev + 1);
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return DateTime::from_timestamp_millis(next).unwrap_or_else(Utc::now),
                Err(actual) => prev = actual,
            }
        }
    }
}

impl ServiceWorker {
    /// Handle a control message, replying on `port` where the command has a reply.
    pub async fn handle_message(
        &self,
        message: ControlMessage,
        port: Option<ReplyPort>,
    ) -> Result<()> {
        if self.state() == ServiceWorkerState::Redundant {
            return Err(ServiceWorkerError::StateError(format!(
                "worker {} is redundant",
                self.id.raw()
            )));
        }
        debug!(worker = self.id.raw(), message = message.kind(), "Control message");

        match message {
            ControlMessage::SkipWaiting => {
                self.skip_waiting();
                Ok(())
            }
            ControlMessage::GetVersion => {
                reply(
                    port,
                    ControlReply::Version {
                        version: self.config.version_name(),
                        timestamp: self.clock.next(),
                    },
                );
                Ok(())
            }
            ControlMessage::ClearCache => match self.caches.clear().await {
                Ok(deleted) => {
                    info!(worker = self.id.raw(), deleted, "Cleared all caches");
                    reply(port, ControlReply::Success { success: true });
                    Ok(())
                }
                Err(e) => {
                    warn!(worker = self.id.raw(), error = %e, "Clearing caches failed");
                    reply(port, ControlReply::Success { success: false });
                    Err(e)
                }
            },
            ControlMessage::CacheUrls { urls } => {
                let stored = self.cache_urls(&urls).await;
                info!(
                    worker = self.id.raw(),
                    requested = urls.len(),
                    stored,
                    "Cached additional URLs"
                );
                reply(port, ControlReply::Success { success: true });
                Ok(())
            }
        }
    }

    /// Decode and handle a raw JSON message.
    pub async fn handle_raw_message(&self, value: &Value, port: Option<ReplyPort>) -> Result<()> {
        let message = ControlMessage::from_value(value)?;
        self.handle_message(message, port).await
    }

    /// Fetch every URL concurrently. Failures are logged and skipped.
    async fn cache_urls(&self, urls: &[String]) -> usize {
        let dynamic = self.config.dynamic_cache_name();
        let attempts = urls.iter().map(|raw| {
            let dynamic = dynamic.as_str();
            async move {
                let url = match self.scope.join(raw) {
                    Ok(url) => url,
                    Err(e) => {
                        warn!(url = %raw, error = %e, "Skipping unparseable URL");
                        return false;
                    }
                };
                let request = Request::get(url);
                match self.fetcher.fetch(request.clone()).await {
                    Ok(response) if response.cacheable() => {
                        let entry = CacheEntry::from_response(&request, &response);
                        match self.caches.put(dynamic, entry).await {
                            Ok(()) => true,
                            Err(e) => {
                                warn!(url = %request.url, error = %e, "Cache write failed");
                                false
                            }
                        }
                    }
                    Ok(response) => {
                        warn!(url = %request.url, status = %response.status, redirected = response.redirected, "Not caching response");
                        false
                    }
                    Err(e) => {
                        warn!(url = %request.url, error = %e, "Failed to cache URL");
                        false
                    }
                }
            }
        });
        join_all(attempts).await.into_iter().filter(|ok| *ok).count()
    }
}

fn reply(port: Option<ReplyPort>, message: ControlReply) {
    match port {
        Some(port) => {
            if !port.send(message) {
                debug!("Reply receiver dropped");
            }
        }
        None => warn!("Message expects a reply but no reply port was given"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_known_messages() {
        assert_eq!(
            ControlMessage::from_value(&json!({"type": "SKIP_WAITING"})).unwrap(),
            ControlMessage::SkipWaiting
        );
        assert_eq!(
            ControlMessage::from_value(&json!({"type": "GET_VERSION"})).unwrap(),
            ControlMessage::GetVersion
        );
        assert_eq!(
            ControlMessage::from_value(&json!({
                "type": "CACHE_URLS",
                "payload": {"urls": ["/a", "/b"]}
            }))
            .unwrap(),
            ControlMessage::CacheUrls {
                urls: vec!["/a".into(), "/b".into()]
            }
        );
    }

    #[test]
    fn test_unknown_type_is_explicit_error() {
        let err = ControlMessage::from_value(&json!({"type": "PING"})).unwrap_err();
        assert!(matches!(err, ServiceWorkerError::UnknownMessage(t) if t == "PING"));
    }

    #[test]
    fn test_malformed_messages() {
        let err = ControlMessage::from_value(&json!({"type": "CACHE_URLS"})).unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InvalidMessage(_)));

        let err = ControlMessage::from_value(&json!({
            "type": "CACHE_URLS",
            "payload": {"urls": "not-a-list"}
        }))
        .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InvalidMessage(_)));

        let err = ControlMessage::from_value(&json!({"payload": {}})).unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InvalidMessage(_)));
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(ControlMessage::CacheUrls {
            urls: vec!["/x".into()],
        })
        .unwrap();
        assert_eq!(value, json!({"type": "CACHE_URLS", "payload": {"urls": ["/x"]}}));

        let value = serde_json::to_value(ControlReply::Success { success: true }).unwrap();
        assert_eq!(value, json!({"success": true}));
    }

    #[test]
    fn test_clock_strictly_increases() {
        let clock = VersionClock::default();
        let mut last = clock.next();
        for _ in 0..1000 {
            let next = clock.next();
            assert!(next > last);
            last = next;
        }
    }

    #[tokio::test]
    async fn test_reply_ports_are_independent() {
        let (a_port, a_rx) = reply_channel();
        let (b_port, b_rx) = reply_channel();

        assert!(b_port.send(ControlReply::Success { success: false }));
        assert!(a_port.send(ControlReply::Success { success: true }));

        assert_eq!(a_rx.await.unwrap(), ControlReply::Success { success: true });
        assert_eq!(b_rx.await.unwrap(), ControlReply::Success { success: false });
    }
}
