//! Cache partitions and cache storage.
//!
//! A [`CacheStorage`] holds the named partitions of one origin. Every
//! operation is individually atomic: concurrent writers to the same key end
//! in last-write-wins, and a persisted `put` either replaces the partition
//! file completely or leaves the previous one in place.

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use pwakit_net::{Request, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use url::Url;

use crate::{Result, ServiceWorkerError};

// ==================== Keys & Entries ====================

/// Request identity: method plus full URL, query string included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub method: String,
    pub url: String,
}

impl CacheKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self {
            method: Method::GET.to_string(),
            url: url.to_string(),
        }
    }

    /// Key for a request.
    pub fn for_request(request: &Request) -> Self {
        Self {
            method: request.method.to_string(),
            url: request.url.to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: Url,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Capture a network response for `request`.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: request.url.clone(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.clone(),
            cached_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Key this entry is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey {
            method: self.method.clone(),
            url: self.url.to_string(),
        }
    }

    /// Rebuild a response from this entry.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.append(n, v);
            }
        }
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        Response::new(self.url.clone(), status, headers, self.body.clone())
    }
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A cache partition.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Position in creation order. Persisted so a reload keeps match order.
    #[serde(default)]
    seq: u64,

    /// Cached entries.
    #[serde(with = "entry_list")]
    entries: HashMap<CacheKey, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            seq: 0,
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Add entry, replacing any previous one for the same key.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Get all keys.
    pub fn keys(&self) -> Vec<&CacheKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Stored as a list: JSON object keys must be strings.
mod entry_list {
    use super::{CacheEntry, CacheKey};
    use hashbrown::HashMap;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        entries: &HashMap<CacheKey, CacheEntry>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let list: Vec<&CacheEntry> = entries.values().collect();
        list.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<HashMap<CacheKey, CacheEntry>, D::Error> {
        let list = Vec::<CacheEntry>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|e| (e.key(), e)).collect())
    }
}

// ==================== Cache Storage ====================

#[derive(Debug, Default)]
struct Partitions {
    /// Creation order; lookups across partitions follow it.
    order: Vec<String>,
    caches: HashMap<String, Cache>,
    next_seq: u64,
}

impl Partitions {
    /// Rebuild from stored partitions, ordered by their recorded position.
    fn load(mut stored: Vec<Cache>) -> Self {
        stored.sort_by(|a, b| (a.seq, &a.name).cmp(&(b.seq, &b.name)));
        let next_seq = stored.iter().map(|c| c.seq + 1).max().unwrap_or(0);
        let mut partitions = Self {
            next_seq,
            ..Self::default()
        };
        for cache in stored {
            partitions.order.push(cache.name.clone());
            partitions.caches.insert(cache.name.clone(), cache);
        }
        partitions
    }

    /// Position the next new partition takes.
    fn seq_for(&self, name: &str) -> u64 {
        self.caches.get(name).map_or(self.next_seq, |c| c.seq)
    }

    fn insert(&mut self, cache: Cache) {
        if !self.caches.contains_key(&cache.name) {
            self.order.push(cache.name.clone());
            self.next_seq = self.next_seq.max(cache.seq + 1);
        }
        self.caches.insert(cache.name.clone(), cache);
    }

    fn remove(&mut self, name: &str) -> bool {
        self.order.retain(|n| n != name);
        self.caches.remove(name).is_some()
    }
}

/// Cache storage for one origin (the `caches` global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    partitions: RwLock<Partitions>,
    dir: Option<PathBuf>,
}

impl CacheStorage {
    /// Create an in-memory cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache storage persisted under `dir`, loading any partitions
    /// already stored there.
    pub async fn persistent(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut files = Vec::new();
        let mut listing = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = listing.next_entry().await? {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        let mut stored = Vec::with_capacity(files.len());
        for path in files {
            let raw = tokio::fs::read(&path).await?;
            let cache: Cache = serde_json::from_slice(&raw).map_err(|e| {
                ServiceWorkerError::CacheError(format!("corrupt partition {}: {e}", path.display()))
            })?;
            debug!(cache = %cache.name, entries = cache.len(), "Loaded cache partition");
            stored.push(cache);
        }

        Ok(Self {
            partitions: RwLock::new(Partitions::load(stored)),
            dir: Some(dir),
        })
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        if partitions.caches.contains_key(name) {
            return Ok(());
        }
        let mut cache = Cache::new(name);
        cache.seq = partitions.seq_for(name);
        self.persist(&cache).await?;
        partitions.insert(cache);
        debug!(cache = name, "Opened cache partition");
        Ok(())
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> bool {
        self.partitions.read().await.caches.contains_key(name)
    }

    /// Get all cache names, in creation order.
    pub async fn keys(&self) -> Vec<String> {
        self.partitions.read().await.order.clone()
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let mut partitions = self.partitions.write().await;
        if !partitions.caches.contains_key(name) {
            return Ok(false);
        }
        if let Some(path) = self.partition_path(name) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(partitions.remove(name))
    }

    /// Delete every cache. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for name in self.keys().await {
            if self.delete(&name).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Match across all caches.
    pub async fn match_request(&self, key: &CacheKey) -> Option<CacheEntry> {
        let partitions = self.partitions.read().await;
        partitions
            .order
            .iter()
            .filter_map(|name| partitions.caches.get(name))
            .find_map(|cache| cache.match_request(key))
            .cloned()
    }

    /// Match within a single cache.
    pub async fn match_in(&self, name: &str, key: &CacheKey) -> Option<CacheEntry> {
        let partitions = self.partitions.read().await;
        partitions
            .caches
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned()
    }

    /// Store an entry, creating the cache if needed.
    pub async fn put(&self, name: &str, entry: CacheEntry) -> Result<()> {
        self.put_all(name, vec![entry]).await
    }

    /// Store several entries in one step: either all become visible or none do.
    pub async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let mut partitions = self.partitions.write().await;
        let mut cache = partitions
            .caches
            .get(name)
            .cloned()
            .unwrap_or_else(|| Cache::new(name));
        cache.seq = partitions.seq_for(name);
        for entry in entries {
            trace!(cache = name, key = %entry.key(), "Cache put");
            cache.put(entry);
        }
        self.persist(&cache).await?;
        partitions.insert(cache);
        Ok(())
    }

    /// Number of entries in a cache, if it exists.
    pub async fn entry_count(&self, name: &str) -> Option<usize> {
        self.partitions.read().await.caches.get(name).map(Cache::len)
    }

    fn partition_path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_deref().map(|dir| partition_file(dir, name))
    }

    async fn persist(&self, cache: &Cache) -> Result<()> {
        let Some(path) = self.partition_path(&cache.name) else {
            return Ok(());
        };
        let json =
            serde_json::to_vec(cache).map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// File holding partition `name`. Bytes outside `[A-Za-z0-9._-]` are written
/// as `%XX`, so distinct names never share a file.
fn partition_file(dir: &Path, name: &str) -> PathBuf {
    let mut safe = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
            safe.push(char::from(byte));
        } else {
            safe.push_str(&format!("%{byte:02X}"));
        }
    }
    dir.join(format!("{safe}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(url: &str, body: &'static str) -> CacheEntry {
        let url = Url::parse(url).unwrap();
        let request = Request::get(url.clone());
        let response = Response::ok_with(url, "text/plain", body);
        CacheEntry::from_response(&request, &response)
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::new("v1");
        cache.put(entry("https://example.com/style.css", "body{}"));

        let hit = Url::parse("https://example.com/style.css").unwrap();
        let miss = Url::parse("https://example.com/other.css").unwrap();
        assert!(cache.match_request(&CacheKey::get(&hit)).is_some());
        assert!(cache.match_request(&CacheKey::get(&miss)).is_none());
    }

    #[test]
    fn test_cache_key_includes_query() {
        let mut cache = Cache::new("v1");
        cache.put(entry("https://example.com/data?page=1", "one"));

        let other = Url::parse("https://example.com/data?page=2").unwrap();
        assert!(cache.match_request(&CacheKey::get(&other)).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        let e = entry("https://example.com/style.css", "body{}");
        let key = e.key();
        cache.put(e);

        assert!(cache.delete(&key));
        assert!(cache.match_request(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_round_trips_response() {
        let e = entry("https://example.com/a.txt", "hello");
        let response = e.to_response();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.header("content-type"), Some("text/plain"));
        assert_eq!(&response.body[..], b"hello");
    }

    #[tokio::test]
    async fn test_cache_storage() {
        let storage = CacheStorage::new();
        assert!(!storage.has("v1").await);

        storage.open("v1").await.unwrap();
        assert!(storage.has("v1").await);

        assert!(storage.delete("v1").await.unwrap());
        assert!(!storage.has("v1").await);
        assert!(!storage.delete("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_match_follows_creation_order() {
        let storage = CacheStorage::new();
        storage
            .put("first", entry("https://example.com/x", "first"))
            .await
            .unwrap();
        storage
            .put("second", entry("https://example.com/x", "second"))
            .await
            .unwrap();

        let key = CacheKey::get(&Url::parse("https://example.com/x").unwrap());
        let hit = storage.match_request(&key).await.unwrap();
        assert_eq!(&hit.body[..], b"first");
        assert_eq!(storage.keys().await, vec!["first", "second"]);

        let scoped = storage.match_in("second", &key).await.unwrap();
        assert_eq!(&scoped.body[..], b"second");
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let storage = CacheStorage::new();
        storage.open("a").await.unwrap();
        storage.open("b").await.unwrap();

        assert_eq!(storage.clear().await.unwrap(), 2);
        assert!(storage.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_persistent_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = CacheStorage::persistent(dir.path()).await.unwrap();
            storage
                .put("idea-static-v2.0", entry("https://example.com/index.html", "<h1>hi</h1>"))
                .await
                .unwrap();
            storage.open("idea-dynamic-v2.0").await.unwrap();
        }

        let storage = CacheStorage::persistent(dir.path()).await.unwrap();
        assert_eq!(storage.keys().await.len(), 2);
        let key = CacheKey::get(&Url::parse("https://example.com/index.html").unwrap());
        let hit = storage.match_request(&key).await.unwrap();
        assert_eq!(&hit.body[..], b"<h1>hi</h1>");
    }

    #[tokio::test]
    async fn test_persistent_delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CacheStorage::persistent(dir.path()).await.unwrap();
        storage.open("idea-static-v1.0").await.unwrap();
        let file = partition_file(dir.path(), "idea-static-v1.0");
        assert!(file.exists());

        assert!(storage.delete("idea-static-v1.0").await.unwrap());
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_reopen_keeps_creation_order() {
        let dir = tempfile::tempdir().unwrap();
        {
            let storage = CacheStorage::persistent(dir.path()).await.unwrap();
            storage
                .put("idea-static-v1", entry("https://example.com/x", "static"))
                .await
                .unwrap();
            storage
                .put("idea-dynamic-v1", entry("https://example.com/x", "dynamic"))
                .await
                .unwrap();
        }

        let storage = CacheStorage::persistent(dir.path()).await.unwrap();
        assert_eq!(storage.keys().await, vec!["idea-static-v1", "idea-dynamic-v1"]);
        let key = CacheKey::get(&Url::parse("https://example.com/x").unwrap());
        assert_eq!(&storage.match_request(&key).await.unwrap().body[..], b"static");

        // Partitions created after a reload still sort last.
        storage.delete("idea-static-v1").await.unwrap();
        storage.open("idea-static-v2").await.unwrap();
        drop(storage);
        let storage = CacheStorage::persistent(dir.path()).await.unwrap();
        assert_eq!(storage.keys().await, vec!["idea-dynamic-v1", "idea-static-v2"]);
    }

    #[test]
    fn test_partition_file_escapes_name() {
        let path = partition_file(Path::new("/tmp"), "a/b c");
        assert_eq!(path, PathBuf::from("/tmp/a%2Fb%20c.json"));
        assert_ne!(
            partition_file(Path::new("/tmp"), "a/b"),
            partition_file(Path::new("/tmp"), "a_b")
        );
    }
}
