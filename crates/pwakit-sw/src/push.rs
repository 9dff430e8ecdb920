//! Push messages and notification clicks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::clients::{Client, ClientMatchOptions, ClientType};
use crate::config::NotificationDefaults;
use crate::worker::ServiceWorker;
use crate::{Result, ServiceWorkerError};

/// Action id that opens the app.
pub const ACTION_OPEN: &str = "open";
/// Action id that only dismisses.
pub const ACTION_CLOSE: &str = "close";

/// Payload sent by the push service. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushPayload {
    pub title: Option<String>,
    pub message: Option<String>,
    pub tag: Option<String>,
    pub data: Option<Value>,
    pub priority: Option<String>,
}

impl PushPayload {
    /// Decode push data. An empty payload yields `None`.
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(data)
            .map(Some)
            .map_err(|e| ServiceWorkerError::InvalidMessage(format!("push payload: {e}")))
    }
}

/// A notification action button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

/// A notification to show on the platform.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub tag: String,
    pub data: Value,
    pub actions: Vec<NotificationAction>,
    pub require_interaction: bool,
    pub silent: bool,
}

impl Notification {
    /// Build a notification, filling gaps from `defaults`.
    pub fn from_payload(payload: PushPayload, defaults: &NotificationDefaults) -> Self {
        let priority = payload.priority.as_deref();
        Self {
            title: payload.title.unwrap_or_else(|| defaults.title.clone()),
            body: payload.message.unwrap_or_else(|| defaults.body.clone()),
            icon: defaults.icon.clone(),
            badge: defaults.icon.clone(),
            tag: payload.tag.unwrap_or_else(|| defaults.tag.clone()),
            data: payload.data.unwrap_or_else(|| Value::Object(Map::new())),
            actions: vec![
                NotificationAction {
                    action: ACTION_OPEN.to_string(),
                    title: defaults.open_title.clone(),
                    icon: Some(defaults.icon.clone()),
                },
                NotificationAction {
                    action: ACTION_CLOSE.to_string(),
                    title: defaults.close_title.clone(),
                    icon: None,
                },
            ],
            require_interaction: priority == Some("high"),
            silent: priority == Some("low"),
        }
    }

    /// Where a click should navigate: `data.url`, or `/`.
    pub fn target_url(&self) -> &str {
        self.data
            .get("url")
            .and_then(Value::as_str)
            .filter(|url| !url.is_empty())
            .unwrap_or("/")
    }
}

/// What a notification click did.
#[derive(Debug, Clone)]
pub enum ClickOutcome {
    /// The close action; nothing else happens.
    Dismissed,
    /// An existing window of the app was focused.
    Focused(Client),
    /// A new window was opened.
    Opened(Client),
}

impl ServiceWorker {
    /// Turn push data into a notification. Empty data shows nothing.
    pub async fn handle_push(&self, data: &[u8]) -> Result<Option<Notification>> {
        let Some(payload) = PushPayload::parse(data)? else {
            debug!(worker = self.id.raw(), "Empty push, no notification");
            return Ok(None);
        };
        let notification = Notification::from_payload(payload, &self.config.notification);
        info!(worker = self.id.raw(), tag = %notification.tag, "Showing notification");
        Ok(Some(notification))
    }

    /// Handle a click on `notification`. `action` is `None` for a click on
    /// the body.
    ///
    /// Anything but `close` focuses a same-origin window the worker
    /// controls, or opens the notification's target URL.
    pub async fn handle_notification_click(
        &self,
        notification: &Notification,
        action: Option<&str>,
    ) -> Result<ClickOutcome> {
        if action == Some(ACTION_CLOSE) {
            return Ok(ClickOutcome::Dismissed);
        }

        let mut clients = self.clients.write().await;
        let existing = clients
            .match_all(&ClientMatchOptions {
                include_uncontrolled: false,
                client_type: ClientType::Window,
            })
            .into_iter()
            .find(|client| client.same_origin(&self.scope))
            .map(|client| client.id.clone());

        if let Some(id) = existing {
            let client = clients.focus(&id)?;
            debug!(client = %client.id, "Focused existing window");
            return Ok(ClickOutcome::Focused(client));
        }

        let url = self
            .scope
            .join(notification.target_url())
            .map_err(|e| ServiceWorkerError::InvalidMessage(format!("notification url: {e}")))?;
        let client = clients.open_window(url);
        info!(client = %client.id, url = %client.url, "Opened window from notification");
        Ok(ClickOutcome::Opened(client))
    }
}
