//! Caching strategies.
//!
//! Every strategy returns:
//! - `Ok(Some(response))`: respond with it
//! - `Ok(None)`: the network rejected and the cache had nothing (treat as 404)
//! - `Err(_)`: the request fails like a network error

use std::sync::Arc;

use http::{header, StatusCode};
use swcache_net::{Fetcher, Request, Response};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::CacheStorage;
use crate::config::RouterConfig;
use crate::event::FetchEvent;
use crate::route::Strategy;
use crate::{Result, ServiceWorkerError};

const IMAGE_FALLBACK_SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="200" height="200" viewBox="0 0 200 200"><rect width="200" height="200" fill="#f3f4f6"/><text x="100" y="100" text-anchor="middle" dominant-baseline="middle" font-family="sans-serif" font-size="14" fill="#9ca3af">Image unavailable</text></svg>"##;

/// Everything a strategy needs: storage, network and the version's partition names.
#[derive(Clone)]
pub struct StrategyContext {
    pub storage: Arc<dyn CacheStorage>,
    pub fetcher: Arc<dyn Fetcher>,
    pub static_cache: String,
    pub dynamic_cache: String,
    pub image_marker: String,
}

impl StrategyContext {
    pub fn new(
        config: &RouterConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            static_cache: config.static_cache_name(),
            dynamic_cache: config.dynamic_cache_name(),
            image_marker: config.image_marker.clone(),
        }
    }

    fn is_image(&self, request: &Request) -> bool {
        !self.image_marker.is_empty() && request.url.path().contains(&self.image_marker)
    }

    /// Store `response` for `request` in `cache` once the event's caller has its answer.
    fn store_in_background(&self, event: &FetchEvent, cache: &str, response: &Response) {
        let storage = Arc::clone(&self.storage);
        let request = event.request.clone();
        let response = response.clone();
        let cache = cache.to_string();
        event.wait_until("cache-put", async move {
            storage.put(&cache, &request, &response).await?;
            Ok(())
        });
    }
}

/// Run `strategy` for `event`.
pub async fn run(
    strategy: Strategy,
    ctx: &StrategyContext,
    event: &FetchEvent,
) -> Result<Option<Response>> {
    match strategy {
        Strategy::CacheFirst => cache_first(ctx, event).await,
        Strategy::NetworkFirst => network_first(ctx, event).await,
        Strategy::StaleWhileRevalidate => stale_while_revalidate(ctx, event).await,
        Strategy::NetworkFallback => network_fallback(ctx, event).await,
    }
}

/// Cached copy if there is one, otherwise the network. Cacheable network
/// responses are written to the static partition in the background. A
/// rejected image request gets a placeholder SVG.
pub async fn cache_first(ctx: &StrategyContext, event: &FetchEvent) -> Result<Option<Response>> {
    let request = &event.request;

    if let Some(cached) = ctx.storage.match_request(request).await {
        debug!(url = %request.url, "Cache hit");
        return Ok(Some(cached));
    }

    match ctx.fetcher.fetch(request).await {
        Ok(response) => {
            if response.is_cacheable() {
                ctx.store_in_background(event, &ctx.static_cache, &response);
            } else {
                debug!(
                    url = %request.url,
                    status = %response.status,
                    response_type = response.response_type.as_str(),
                    "Response not cacheable"
                );
            }
            Ok(Some(response))
        }
        Err(e) if ctx.is_image(request) => {
            warn!(url = %request.url, error = %e, "Image fetch failed, serving placeholder");
            Ok(Some(image_fallback()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Network response if the fetch resolves, otherwise whatever the cache holds.
/// Nothing is written to any partition.
pub async fn network_first(ctx: &StrategyContext, event: &FetchEvent) -> Result<Option<Response>> {
    network_or_cache(ctx, event, Strategy::NetworkFirst).await
}

/// Strategy for requests no route matched. Same mechanics as [`network_first`].
pub async fn network_fallback(
    ctx: &StrategyContext,
    event: &FetchEvent,
) -> Result<Option<Response>> {
    network_or_cache(ctx, event, Strategy::NetworkFallback).await
}

async fn network_or_cache(
    ctx: &StrategyContext,
    event: &FetchEvent,
    strategy: Strategy,
) -> Result<Option<Response>> {
    let request = &event.request;
    match ctx.fetcher.fetch(request).await {
        Ok(response) => Ok(Some(response)),
        Err(e) => {
            let cached = ctx.storage.match_request(request).await;
            warn!(
                url = %request.url,
                %strategy,
                error = %e,
                cache_hit = cached.is_some(),
                "Network failed, falling back to cache"
            );
            Ok(cached)
        }
    }
}

/// Cached copy immediately when present; the network fetch always runs and
/// refreshes the dynamic partition for the next request. With a cold cache the
/// caller waits for the network.
pub async fn stale_while_revalidate(
    ctx: &StrategyContext,
    event: &FetchEvent,
) -> Result<Option<Response>> {
    let request = &event.request;
    let cached = ctx.storage.match_request(request).await;

    let (tx, rx) = oneshot::channel();
    let storage = Arc::clone(&ctx.storage);
    let fetcher = Arc::clone(&ctx.fetcher);
    let dynamic_cache = ctx.dynamic_cache.clone();
    let revalidate = request.clone();

    event.wait_until("revalidate", async move {
        match fetcher.fetch(&revalidate).await {
            Ok(response) => {
                let store = response.is_cacheable().then(|| response.clone());
                // The caller may already have been answered from cache.
                let _ = tx.send(Ok(response));
                if let Some(response) = store {
                    storage.put(&dynamic_cache, &revalidate, &response).await?;
                    debug!(url = %revalidate.url, "Revalidated");
                }
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let _ = tx.send(Err(e));
                Err(ServiceWorkerError::StateError(format!(
                    "revalidation of {} failed: {message}",
                    revalidate.url
                )))
            }
        }
    });

    if let Some(cached) = cached {
        debug!(url = %request.url, "Serving stale copy");
        return Ok(Some(cached));
    }

    match rx.await {
        Ok(Ok(response)) => Ok(Some(response)),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(ServiceWorkerError::StateError(
            "revalidation task ended without a result".to_string(),
        )),
    }
}

/// Placeholder for images that could not be fetched.
pub fn image_fallback() -> Response {
    Response::new(StatusCode::OK, IMAGE_FALLBACK_SVG)
        .with_header(header::CONTENT_TYPE, "image/svg+xml")
}
