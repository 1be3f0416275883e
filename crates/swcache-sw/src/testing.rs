//! In-crate test doubles for the network and storage seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use swcache_net::{Fetcher, NetError, Request, Response};
use url::Url;

use crate::cache::{CacheError, CacheStorage, MemoryCacheStorage};

/// Scripted network. URLs without a reply reject like an offline fetch.
#[derive(Default)]
pub struct MockFetcher {
    replies: Mutex<HashMap<String, Response>>,
    calls: Mutex<HashMap<String, usize>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &Url, response: Response) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), response.with_url(url.clone()));
    }

    /// Hold the reply for `url` back by `delay`.
    pub fn delay(&self, url: &Url, delay: Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    pub fn go_offline(&self, url: &Url) {
        self.replies.lock().unwrap().remove(url.as_str());
    }

    pub fn calls(&self, url: &Url) -> usize {
        self.calls.lock().unwrap().get(url.as_str()).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(request.url.to_string())
            .or_default() += 1;

        let delay = self.delays.lock().unwrap().get(request.url.as_str()).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.replies
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .cloned()
            .ok_or_else(|| NetError::RequestFailed(format!("offline: {}", request.url)))
    }
}

/// Memory storage that records every `put` and can be told to fail them.
#[derive(Default)]
pub struct RecordingStorage {
    inner: MemoryCacheStorage,
    writes: Mutex<Vec<(String, String)>>,
    fail_writes: AtomicBool,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store without recording a write.
    pub async fn seed(&self, cache: &str, request: &Request, response: Response) {
        self.inner.put(cache, request, &response).await.unwrap();
    }

    /// `(partition, url)` of every recorded write, in order.
    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheStorage for RecordingStorage {
    async fn open(&self, name: &str) -> Result<(), CacheError> {
        self.inner.open(name).await
    }

    async fn has(&self, name: &str) -> bool {
        self.inner.has(name).await
    }

    async fn keys(&self) -> Vec<String> {
        self.inner.keys().await
    }

    async fn delete(&self, name: &str) -> bool {
        self.inner.delete(name).await
    }

    async fn match_request(&self, request: &Request) -> Option<Response> {
        self.inner.match_request(request).await
    }

    async fn match_in(&self, name: &str, request: &Request) -> Option<Response> {
        self.inner.match_in(name, request).await
    }

    async fn put(
        &self,
        name: &str,
        request: &Request,
        response: &Response,
    ) -> Result<(), CacheError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::QuotaExceeded { needed: response.body.len(), quota: 0 });
        }
        self.inner.put(name, request, response).await?;
        self.writes
            .lock()
            .unwrap()
            .push((name.to_string(), request.url.to_string()));
        Ok(())
    }
}
