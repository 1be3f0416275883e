//! HTTP front end: every request becomes a fetch event for the worker host.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::Body;
use axum::extract::{Request as HttpRequest, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use swcache_net::{Fetcher, Request, Response};
use swcache_sw::{FetchEvent, FetchOutcome, HostStatus, ServiceWorkerHost};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use url::Url;

/// Response header naming where the body came from.
pub const SOURCE_HEADER: &str = "x-swcache-source";

const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub host: Arc<ServiceWorkerHost>,
    /// Used for requests the worker does not intercept. Must not follow
    /// redirects, so the client sees the origin's 3xx.
    pub network: Arc<dyn Fetcher>,
    /// Site being proxied.
    pub origin: Url,
    pub background: BackgroundTasks,
}

/// Fetch events still running cache work after their response went out.
/// [`serve`] drains them after shutdown so the work lands before the snapshot.
#[derive(Clone, Default)]
pub struct BackgroundTasks(Arc<Mutex<JoinSet<()>>>);

impl BackgroundTasks {
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.lock();
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                warn!(error = %e, "Background task panicked");
            }
        }
        tasks.spawn(task);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait for every task, including ones spawned while waiting.
    pub async fn drain(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.lock());
            if tasks.is_empty() {
                return;
            }
            while let Some(finished) = tasks.join_next().await {
                if let Err(e) = finished {
                    warn!(error = %e, "Background task panicked");
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    host: HostStatus,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let host = state.host.status().await;
    let status = if host.version.is_some() { "ok" } else { "degraded" };
    Json(HealthResponse { status, host })
}

async fn intercept(State(state): State<AppState>, request: HttpRequest) -> HttpResponse {
    let request = match to_fetch_request(&state.origin, request).await {
        Ok(request) => request,
        Err(response) => return response,
    };

    let event = FetchEvent::new(request);
    let response = match state.host.handle_fetch(&event).await {
        FetchOutcome::Respond(response) => {
            let source = if response.from_cache { "cache" } else { "network" };
            to_http_response(&response, source)
        }
        FetchOutcome::Passthrough(reason) => {
            debug!(url = %event.request.url, %reason, "Forwarding to origin");
            match state.network.fetch(&event.request).await {
                Ok(response) => to_http_response(&response, "passthrough"),
                Err(e) => {
                    warn!(url = %event.request.url, error = %e, "Origin unreachable");
                    error_response(StatusCode::BAD_GATEWAY, &e.to_string())
                }
            }
        }
        FetchOutcome::NotFound => error_response(StatusCode::NOT_FOUND, "Not found"),
        FetchOutcome::NetworkError(message) => {
            error_response(StatusCode::BAD_GATEWAY, &message)
        }
    };

    if event.pending() > 0 {
        state.background.spawn(async move {
            event.settled().await;
            debug!(url = %event.request.url, "Fetch event settled");
        });
    }
    response
}

async fn to_fetch_request(origin: &Url, request: HttpRequest) -> Result<Request, HttpResponse> {
    let (parts, body) = request.into_parts();
    let target = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());

    let url = origin
        .join(target)
        .ok()
        .filter(|url| url.origin() == origin.origin())
        .ok_or_else(|| {
            error_response(StatusCode::BAD_REQUEST, &format!("Invalid path: {target}"))
        })?;

    let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| error_response(StatusCode::PAYLOAD_TOO_LARGE, &e.to_string()))?;

    let mut request = Request::new(parts.method, url);
    request.headers = end_to_end_headers(&parts.headers);
    if !body.is_empty() {
        request = request.body(body);
    }
    Ok(request)
}

fn to_http_response(response: &Response, source: &'static str) -> HttpResponse {
    let mut out = HttpResponse::new(Body::from(response.body.clone()));
    *out.status_mut() = response.status;
    *out.headers_mut() = end_to_end_headers(&response.headers);
    out.headers_mut()
        .insert(SOURCE_HEADER, HeaderValue::from_static(source));
    out
}

fn error_response(status: StatusCode, message: &str) -> HttpResponse {
    (status, message.to_string()).into_response()
}

/// Headers that describe one connection and must not be copied across the proxy.
fn is_connection_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_connection_header(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/__swcache/health", get(health))
        .fallback(intercept)
        .with_state(state)
}

/// Serve until `shutdown` resolves, then wait for outstanding cache work.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, origin = %state.origin, "Proxy listening");
    let background = state.background.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    let pending = background.len();
    if pending > 0 {
        info!(pending, "Waiting for background cache work");
    }
    background.drain().await;
    Ok(())
}
