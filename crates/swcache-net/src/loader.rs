//! reqwest-backed [`Fetcher`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, trace};
use url::{Origin, Url};

use crate::{classify_response_type, Fetcher, NetError, Request, Response};

/// Network configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// User agent string.
    pub user_agent: String,
    /// Request timeout. `None` waits for as long as the network takes.
    pub timeout: Option<Duration>,
    /// Maximum redirects. `0` hands 3xx responses back unfollowed.
    pub max_redirects: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("SwCache/{}", env!("CARGO_PKG_VERSION")),
            timeout: None,
            max_redirects: 10,
        }
    }
}

/// Fetches requests over HTTP on behalf of pages served from `origin`.
pub struct HttpFetcher {
    client: Client,
    origin: Origin,
    config: FetcherConfig,
}

impl HttpFetcher {
    /// Create a fetcher for pages served from `origin`.
    pub fn new(origin: &Url, config: FetcherConfig) -> Result<Self, NetError> {
        let redirect = match config.max_redirects {
            0 => reqwest::redirect::Policy::none(),
            max => reqwest::redirect::Policy::limited(max),
        };
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .redirect(redirect);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        debug!(origin = %origin, "HttpFetcher initialized");

        Ok(Self {
            client,
            origin: origin.origin(),
            config,
        })
    }

    pub fn config(&self) -> &FetcherConfig {
        &self.config
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if !request.is_http() {
            return Err(NetError::UnsupportedScheme(request.url.scheme().to_string()));
        }

        debug!(url = %request.url, method = %request.method, "Fetching from network");

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if let Some(ref body) = request.body {
            req_builder = req_builder.body(body.clone());
        }

        let response = req_builder.send().await.map_err(|e| match self.config.timeout {
            Some(timeout) if e.is_timeout() => NetError::Timeout(timeout),
            _ => NetError::Http(e),
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let redirected = url != request.url;
        let response_type = classify_response_type(&self.origin, &url, &headers);

        let body = response.bytes().await?;

        trace!(
            url = %url,
            status = %status,
            response_type = response_type.as_str(),
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            url: Some(url),
            status,
            headers,
            body,
            response_type,
            redirected,
            from_cache: false,
        })
    }
}
