//! Cache partitions and the storage service that holds them.
//!
//! A partition maps a GET request's URL to a stored response. Partitions are
//! looked up by name; [`CacheStorage::match_request`] searches all of them in
//! creation order, like `caches.match()` does in a browser.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use swcache_net::{Request, Response, ResponseType};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use url::Url;

/// Cache storage errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    #[error("Only GET requests can be cached, got {0}")]
    MethodNotAllowed(String),

    #[error("Quota exceeded: storing {needed} bytes would exceed {quota}")]
    QuotaExceeded { needed: usize, quota: usize },

    #[error("Snapshot error: {0}")]
    Snapshot(String),
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method. Always `GET`.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers, in order, repeated names allowed.
    pub headers: Vec<StoredHeader>,

    /// Response body.
    #[serde(with = "base64_bytes")]
    pub body: Vec<u8>,

    /// Response type (`basic`, `cors`, `opaque`).
    pub response_type: String,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

/// One stored response header. The value is kept as raw bytes since header
/// values need not be UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
}

impl CacheEntry {
    /// Build an entry from a request and the response to store for it.
    pub fn new(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| StoredHeader {
                name: name.as_str().to_string(),
                value: value.as_bytes().to_vec(),
            })
            .collect();

        Self {
            url: request.cache_key().to_string(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            response_type: response.response_type.as_str().to_string(),
            cached_at: now_millis(),
        }
    }

    /// Rebuild the stored response. The result is marked as served from cache.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for header in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(header.name.as_str()),
                HeaderValue::from_bytes(&header.value),
            ) {
                headers.append(name, value);
            }
        }

        Response {
            url: Url::parse(&self.url).ok(),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: Bytes::from(self.body.clone()),
            response_type: ResponseType::parse(&self.response_type),
            redirected: false,
            from_cache: true,
        }
    }
}

/// A single named cache partition.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries keyed by request URL.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request URL.
    pub fn match_request(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    /// Insert or replace the entry for its URL.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.url.clone(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, url: &str) -> bool {
        self.entries.remove(url).is_some()
    }

    /// Get all keys (URLs).
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total body bytes held by this partition.
    pub fn size(&self) -> usize {
        self.entries.values().map(|e| e.body.len()).sum()
    }
}

/// The partition service strategies and lifecycle handlers work against.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a partition, creating it if absent.
    async fn open(&self, name: &str) -> Result<(), CacheError>;

    /// Check if a partition exists.
    async fn has(&self, name: &str) -> bool;

    /// Partition names in creation order.
    async fn keys(&self) -> Vec<String>;

    /// Delete a partition. Returns whether it existed.
    async fn delete(&self, name: &str) -> bool;

    /// Match a request across all partitions, oldest partition first.
    async fn match_request(&self, request: &Request) -> Option<Response>;

    /// Match a request in one partition.
    async fn match_in(&self, name: &str, request: &Request) -> Option<Response>;

    /// Store `response` for `request` in partition `name`, creating the
    /// partition if needed. Replaces any existing entry for the request.
    async fn put(&self, name: &str, request: &Request, response: &Response)
        -> Result<(), CacheError>;

    /// Delete every partition whose name is not in `keep`. Returns the deleted names.
    async fn delete_all_except(&self, keep: &[&str]) -> Vec<String> {
        let mut deleted = Vec::new();
        for name in self.keys().await {
            if !keep.contains(&name.as_str()) && self.delete(&name).await {
                deleted.push(name);
            }
        }
        deleted
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StorageInner {
    /// Partitions in creation order.
    caches: Vec<Cache>,
}

impl StorageInner {
    fn size(&self) -> usize {
        self.caches.iter().map(Cache::size).sum()
    }

    fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.iter().find(|c| c.name == name)
    }

    fn get_or_create(&mut self, name: &str) -> &mut Cache {
        let index = match self.caches.iter().position(|c| c.name == name) {
            Some(index) => index,
            None => {
                debug!(cache = name, "Creating cache partition");
                self.caches.push(Cache::new(name));
                self.caches.len() - 1
            }
        };
        &mut self.caches[index]
    }
}

/// In-process cache storage with optional JSON snapshots.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    inner: RwLock<StorageInner>,
    /// Upper bound on stored body bytes across all partitions.
    quota: Option<usize>,
}

impl MemoryCacheStorage {
    /// Create new empty cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the total body bytes the storage may hold.
    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    /// Total body bytes across all partitions.
    pub async fn size(&self) -> usize {
        self.inner.read().await.size()
    }

    /// Number of entries in partition `name`, if it exists.
    pub async fn entry_count(&self, name: &str) -> Option<usize> {
        self.inner.read().await.get(name).map(Cache::len)
    }

    /// Write every partition to `path` as JSON.
    pub async fn save_snapshot(&self, path: &Path) -> Result<(), CacheError> {
        let json = {
            let inner = self.inner.read().await;
            serde_json::to_vec_pretty(&*inner).map_err(|e| CacheError::Snapshot(e.to_string()))?
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CacheError::Snapshot(e.to_string()))?;
        }
        tokio::fs::write(path, json)
            .await
            .map_err(|e| CacheError::Snapshot(e.to_string()))?;

        info!(path = %path.display(), "Cache snapshot saved");
        Ok(())
    }

    /// Restore storage from a snapshot written by [`save_snapshot`](Self::save_snapshot).
    ///
    /// The quota is not part of the snapshot. The restored storage has none
    /// until [`with_quota`](Self::with_quota) is chained, which then applies to
    /// every later `put`.
    pub async fn load_snapshot(path: &Path) -> Result<Self, CacheError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| CacheError::Snapshot(e.to_string()))?;
        let inner: StorageInner =
            serde_json::from_slice(&bytes).map_err(|e| CacheError::Snapshot(e.to_string()))?;

        info!(
            path = %path.display(),
            caches = inner.caches.len(),
            "Cache snapshot loaded"
        );
        Ok(Self {
            inner: RwLock::new(inner),
            quota: None,
        })
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        self.inner.write().await.get_or_create(name);
        Ok(())
    }

    async fn has(&self, name: &str) -> bool {
        self.inner.read().await.get(name).is_some()
    }

    async fn keys(&self) -> Vec<String> {
        self.inner
            .read()
            .await
            .caches
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }

    async fn delete(&self, name: &str) -> bool {
        let mut inner = self.inner.write().await;
        let before = inner.caches.len();
        inner.caches.retain(|c| c.name != name);
        let deleted = inner.caches.len() != before;
        if deleted {
            debug!(cache = name, "Deleted cache partition");
        }
        deleted
    }

    async fn match_request(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET {
            return None;
        }
        let inner = self.inner.read().await;
        let hit = inner
            .caches
            .iter()
            .find_map(|c| c.match_request(request.cache_key()))
            .map(CacheEntry::to_response);
        trace!(url = %request.url, hit = hit.is_some(), "Cache lookup");
        hit
    }

    async fn match_in(&self, name: &str, request: &Request) -> Option<Response> {
        if request.method != Method::GET {
            return None;
        }
        self.inner
            .read()
            .await
            .get(name)
            .and_then(|c| c.match_request(request.cache_key()))
            .map(CacheEntry::to_response)
    }

    async fn put(
        &self,
        name: &str,
        request: &Request,
        response: &Response,
    ) -> Result<(), CacheError> {
        if request.method != Method::GET {
            return Err(CacheError::MethodNotAllowed(request.method.to_string()));
        }
        let entry = CacheEntry::new(request, response);
        let mut inner = self.inner.write().await;

        if let Some(quota) = self.quota {
            let replaced = inner
                .get(name)
                .and_then(|c| c.match_request(&entry.url))
                .map_or(0, |e| e.body.len());
            let needed = inner.size() - replaced + entry.body.len();
            if needed > quota {
                return Err(CacheError::QuotaExceeded { needed, quota });
            }
        }

        inner.get_or_create(name).put(entry);
        trace!(cache = name, url = %request.url, "Cache write");
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Bodies and header values are stored base64 encoded so binary data
/// survives JSON snapshots.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> Request {
        Request::parse(url).unwrap()
    }

    fn ok(body: &'static str) -> Response {
        Response::new(StatusCode::OK, body).with_header(http::header::CONTENT_TYPE, "text/plain")
    }

    #[test]
    fn test_cache() {
        let mut cache = Cache::new("v1");
        let request = get("https://example.com/style.css");
        cache.put(CacheEntry::new(&request, &ok("body")));

        assert!(cache.match_request("https://example.com/style.css").is_some());
        assert!(cache.match_request("https://example.com/other.css").is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_delete() {
        let mut cache = Cache::new("v1");
        let request = get("https://example.com/style.css");
        cache.put(CacheEntry::new(&request, &ok("body")));

        assert!(cache.delete("https://example.com/style.css"));
        assert!(cache.match_request("https://example.com/style.css").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_round_trips_response() {
        let request = get("https://example.com/a.txt");
        let response = ok("hello").with_header(http::header::CACHE_CONTROL, "max-age=60");
        let restored = CacheEntry::new(&request, &response).to_response();

        assert_eq!(restored.status, StatusCode::OK);
        assert_eq!(restored.body, response.body);
        assert_eq!(restored.content_type(), Some("text/plain"));
        assert_eq!(restored.header("cache-control"), Some("max-age=60"));
        assert_eq!(restored.response_type, ResponseType::Basic);
        assert!(restored.from_cache);
    }

    #[test]
    fn test_entry_keeps_non_utf8_header_values() {
        let request = get("https://example.com/files/report.pdf");
        let mut response = ok("pdf");
        let disposition =
            HeaderValue::from_bytes(b"attachment; filename=\"r\xe9sum\xe9.pdf\"").unwrap();
        response
            .headers
            .insert(http::header::CONTENT_DISPOSITION, disposition.clone());
        response
            .headers
            .append(http::header::SET_COOKIE, HeaderValue::from_static("a=1"));
        response
            .headers
            .append(http::header::SET_COOKIE, HeaderValue::from_static("b=2"));

        let entry = CacheEntry::new(&request, &response);
        let json = serde_json::to_string(&entry).unwrap();
        let restored: CacheEntry = serde_json::from_str(&json).unwrap();
        let restored = restored.to_response();

        assert_eq!(restored.headers.get(http::header::CONTENT_DISPOSITION), Some(&disposition));
        assert_eq!(restored.headers.get_all(http::header::SET_COOKIE).iter().count(), 2);
        assert_eq!(restored.headers.len(), response.headers.len());
    }

    #[tokio::test]
    async fn test_storage_open_has_delete() {
        let storage = MemoryCacheStorage::new();

        assert!(!storage.has("v1").await);
        storage.open("v1").await.unwrap();
        assert!(storage.has("v1").await);

        assert!(storage.delete("v1").await);
        assert!(!storage.has("v1").await);
        assert!(!storage.delete("v1").await);
    }

    #[tokio::test]
    async fn test_storage_put_and_match() {
        let storage = MemoryCacheStorage::new();
        let request = get("https://example.com/images/a.png");
        storage.put("static", &request, &ok("png")).await.unwrap();

        let hit = storage.match_request(&request).await.unwrap();
        assert_eq!(&hit.body[..], b"png");
        assert!(hit.from_cache);

        assert!(storage.match_in("static", &request).await.is_some());
        assert!(storage.match_in("dynamic", &request).await.is_none());
        assert_eq!(storage.entry_count("static").await, Some(1));
    }

    #[tokio::test]
    async fn test_storage_put_overwrites() {
        let storage = MemoryCacheStorage::new();
        let request = get("https://example.com/");
        storage.put("dynamic", &request, &ok("old")).await.unwrap();
        storage.put("dynamic", &request, &ok("new")).await.unwrap();

        let hit = storage.match_request(&request).await.unwrap();
        assert_eq!(&hit.body[..], b"new");
        assert_eq!(storage.entry_count("dynamic").await, Some(1));
    }

    #[tokio::test]
    async fn test_storage_rejects_non_get() {
        let storage = MemoryCacheStorage::new();
        let url = Url::parse("https://example.com/api/items").unwrap();
        let request = Request::new(Method::POST, url);

        let result = storage.put("dynamic", &request, &ok("x")).await;
        assert_eq!(result, Err(CacheError::MethodNotAllowed("POST".to_string())));
        assert!(!storage.has("dynamic").await);
        assert!(storage.match_request(&request).await.is_none());
    }

    #[tokio::test]
    async fn test_storage_match_searches_in_creation_order() {
        let storage = MemoryCacheStorage::new();
        let request = get("https://example.com/shared.js");
        storage.put("first", &request, &ok("first")).await.unwrap();
        storage.put("second", &request, &ok("second")).await.unwrap();

        let hit = storage.match_request(&request).await.unwrap();
        assert_eq!(&hit.body[..], b"first");
        assert_eq!(storage.keys().await, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_delete_all_except() {
        let storage = MemoryCacheStorage::new();
        for name in [
            "site-cache-v1-static",
            "site-cache-v1-dynamic",
            "site-cache-v2-static",
            "site-cache-v2-dynamic",
        ] {
            storage.open(name).await.unwrap();
        }

        let mut deleted = storage
            .delete_all_except(&["site-cache-v2-static", "site-cache-v2-dynamic"])
            .await;
        deleted.sort();

        assert_eq!(deleted, vec!["site-cache-v1-dynamic", "site-cache-v1-static"]);
        assert_eq!(
            storage.keys().await,
            vec!["site-cache-v2-static", "site-cache-v2-dynamic"]
        );
    }

    #[tokio::test]
    async fn test_quota() {
        let storage = MemoryCacheStorage::new().with_quota(8);
        let a = get("https://example.com/a");
        let b = get("https://example.com/b");

        storage.put("static", &a, &ok("12345")).await.unwrap();
        // Replacing an entry only counts the difference.
        storage.put("static", &a, &ok("123456")).await.unwrap();

        let result = storage.put("static", &b, &ok("1234")).await;
        assert_eq!(result, Err(CacheError::QuotaExceeded { needed: 10, quota: 8 }));
        assert!(storage.match_request(&b).await.is_none());
        assert_eq!(storage.size().await, 6);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("caches.json");

        let storage = MemoryCacheStorage::new();
        let request = get("https://example.com/images/logo.png");
        let binary = Response::new(StatusCode::OK, vec![0u8, 159, 146, 150]);
        storage.put("static", &request, &binary).await.unwrap();
        storage.open("dynamic").await.unwrap();
        storage.save_snapshot(&path).await.unwrap();

        let restored = MemoryCacheStorage::load_snapshot(&path).await.unwrap();
        assert_eq!(restored.keys().await, vec!["static", "dynamic"]);
        let hit = restored.match_request(&request).await.unwrap();
        assert_eq!(&hit.body[..], &[0u8, 159, 146, 150]);
    }

    #[tokio::test]
    async fn test_restored_snapshot_with_quota() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("caches.json");

        let storage = MemoryCacheStorage::new().with_quota(8);
        storage.put("static", &get("https://example.com/a"), &ok("123456")).await.unwrap();
        storage.save_snapshot(&path).await.unwrap();

        let restored = MemoryCacheStorage::load_snapshot(&path)
            .await
            .unwrap()
            .with_quota(8);

        let result = restored.put("static", &get("https://example.com/b"), &ok("1234")).await;
        assert_eq!(result, Err(CacheError::QuotaExceeded { needed: 10, quota: 8 }));
        assert_eq!(restored.size().await, 6);
    }

    #[tokio::test]
    async fn test_load_snapshot_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = MemoryCacheStorage::load_snapshot(&dir.path().join("absent.json")).await;
        assert!(matches!(result, Err(CacheError::Snapshot(_))));
    }
}
