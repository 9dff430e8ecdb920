//! Clients API: the pages a worker controls.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use url::Url;

use crate::worker::ServiceWorkerId;
use crate::{Result, ServiceWorkerError};

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// A client (controlled page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Worker currently controlling this client.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// Create an uncontrolled window client.
    pub fn window(url: Url) -> Self {
        Self {
            id: next_client_id(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }

    /// Whether the client lives in the same origin as `scope`.
    pub fn same_origin(&self, scope: &Url) -> bool {
        self.url.origin() == scope.origin()
    }

    fn in_scope(&self, scope: &Url) -> bool {
        self.url.as_str().starts_with(scope.as_str())
    }
}

/// Options for [`Clients::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Match clients, sorted by id for stable iteration.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controller.is_some())
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Open a window.
    pub fn open_window(&mut self, url: Url) -> Client {
        let mut client = Client::window(url);
        client.focused = true;
        for other in self.clients.values_mut() {
            other.focused = false;
        }
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Focus a window client.
    pub fn focus(&mut self, id: &str) -> Result<Client> {
        let target = self
            .clients
            .get(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))?;
        if target.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }
        for client in self.clients.values_mut() {
            client.focused = client.id == id;
        }
        self.clients
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))
    }

    /// Make `worker` the controller of every client in `scope`.
    ///
    /// Returns the ids of clients whose controller changed, sorted.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.in_scope(scope) && c.controller != Some(worker))
            .map(|c| {
                c.controller = Some(worker);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{:06}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::{CacheStorage, ServiceWorker};
    use std::sync::Arc;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_open_window() {
        let mut clients = Clients::new();

        let client = clients.open_window(url("https://example.com/"));
        assert_eq!(client.client_type, ClientType::Window);
        assert!(client.focused);
        assert!(clients.get(&client.id).is_some());
    }

    #[test]
    fn test_focus_moves_between_windows() {
        let mut clients = Clients::new();
        let a = clients.open_window(url("https://example.com/a"));
        let b = clients.open_window(url("https://example.com/b"));
        assert!(!clients.get(&a.id).unwrap().focused);

        let focused = clients.focus(&a.id).unwrap();
        assert!(focused.focused);
        assert!(!clients.get(&b.id).unwrap().focused);
        assert!(clients.focus("client-missing").is_err());
    }

    #[test]
    fn test_claim_only_in_scope() {
        let mut clients = Clients::new();
        let inside = Client::window(url("https://example.com/app/page"));
        let outside = Client::window(url("https://example.com/other"));
        let (inside_id, outside_id) = (inside.id.clone(), outside.id.clone());
        clients.add(inside);
        clients.add(outside);

        let scope = url("https://example.com/app/");
        let worker = ServiceWorker::new(
            scope.clone(),
            WorkerConfig::default(),
            Arc::new(CacheStorage::new()),
            Arc::new(tokio::sync::RwLock::new(Clients::new())),
            Arc::new(pwakit_net::ResourceLoader::new(Default::default()).unwrap()),
        )
        .unwrap();

        let changed = clients.claim(worker.id(), &scope);
        assert_eq!(changed, vec![inside_id.clone()]);
        assert_eq!(clients.get(&inside_id).unwrap().controller, Some(worker.id()));
        assert!(clients.get(&outside_id).unwrap().controller.is_none());

        // Claiming again changes nothing.
        assert!(clients.claim(worker.id(), &scope).is_empty());
    }

    #[test]
    fn test_match_all_filters_uncontrolled() {
        let mut clients = Clients::new();
        clients.add(Client::window(url("https://example.com/")));

        assert!(clients.match_all(&ClientMatchOptions::default()).is_empty());
        let all = clients.match_all(&ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::All,
        });
        assert_eq!(all.len(), 1);
    }
}
