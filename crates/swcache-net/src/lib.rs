//! # SwCache Net
//!
//! Request/response model and network access for the SwCache offline router.
//!
//! ## Design Goals
//!
//! 1. **Injectable network**: strategies only ever see the [`Fetcher`] trait
//! 2. **Browser response types**: responses are tagged basic / cors / opaque
//!    so cacheability can be decided without the transport
//! 3. **Cheap clones**: bodies are [`Bytes`], so a response can be returned to
//!    the caller and stored in a cache at the same time

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use thiserror::Error;
use url::{Origin, Url};

pub mod loader;

pub use loader::{FetcherConfig, HttpFetcher};

/// Errors that can occur while fetching from the network.
///
/// Any of these is a *rejected* fetch. An HTTP error status is not a
/// rejection; it comes back as an `Ok` [`Response`].
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl Request {
    /// Create a request. The URL fragment is dropped, it never reaches the network.
    pub fn new(method: Method, mut url: Url) -> Self {
        url.set_fragment(None);
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(e.to_string()))?;
        Ok(Self::get(url))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Key used to identify this request in a cache partition.
    pub fn cache_key(&self) -> &str {
        self.url.as_str()
    }

    /// Whether the scheme is one the router may intercept.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }
}

/// Response type as exposed by the Fetch standard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response allowed by CORS.
    Cors,
    /// Cross-origin response whose contents the page may not inspect.
    Opaque,
    /// Network error placeholder.
    Error,
}

impl ResponseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "basic" => ResponseType::Basic,
            "cors" => ResponseType::Cors,
            "opaque" => ResponseType::Opaque,
            _ => ResponseType::Error,
        }
    }
}

/// Classify a response the way a page at `origin` would see it.
pub fn classify_response_type(origin: &Origin, url: &Url, headers: &HeaderMap) -> ResponseType {
    if url.origin() == *origin {
        ResponseType::Basic
    } else if headers.contains_key(http::header::ACCESS_CONTROL_ALLOW_ORIGIN) {
        ResponseType::Cors
    } else {
        ResponseType::Opaque
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct Response {
    /// Final URL, `None` for synthesized responses.
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_type: ResponseType,
    /// Whether redirects were followed to produce this response.
    pub redirected: bool,
    /// Whether this response was served out of a cache partition.
    pub from_cache: bool,
}

impl Response {
    /// Create a same-origin response.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            url: None,
            status,
            headers: HeaderMap::new(),
            body: body.into(),
            response_type: ResponseType::Basic,
            redirected: false,
            from_cache: false,
        }
    }

    /// Add a header. Invalid header values are ignored.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Check if the status is 2xx.
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// A response may be stored only if it is a plain 200 from our own origin.
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK && self.response_type == ResponseType::Basic
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }
}

/// Network access as seen by the router.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. `Err` means the fetch was rejected (offline, DNS, ...).
    async fn fetch(&self, request: &Request) -> Result<Response, NetError>;
}
