//! # SwCache Service Worker
//!
//! An offline cache router modelled on a browser service worker.
//!
//! ## Features
//!
//! - **Lifecycle**: install (pre-cache the static manifest), activate (evict
//!   caches from older versions), then intercept fetches
//! - **Cache storage**: named partitions of request → response pairs behind the
//!   [`CacheStorage`] trait
//! - **Dispatch**: an ordered route table picks exactly one strategy per request
//! - **Strategies**: cache-first, network-first, stale-while-revalidate and a
//!   network-with-cache-fallback default
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker)
//!     │
//!     ├── RouteTable ──► Strategy ──► strategy::run
//!     │
//!     └── CacheStorage
//!             ├── <app>-cache-<version>-static
//!             └── <app>-cache-<version>-dynamic
//! ```

use swcache_net::NetError;
use thiserror::Error;

pub mod cache;
pub mod config;
pub mod event;
pub mod lifecycle;
pub mod route;
pub mod strategy;
pub mod worker;

#[cfg(test)]
mod testing;

pub use cache::{
    Cache, CacheEntry, CacheError, CacheStorage, MemoryCacheStorage, StoredHeader,
};
pub use config::{ConfigError, RouteConfig, RouterConfig};
pub use event::{ExtendableEvent, FetchEvent};
pub use lifecycle::{
    ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
pub use route::{dispatch, Dispatch, PassthroughReason, PathPattern, Route, RouteTable, Strategy};
pub use strategy::{image_fallback, StrategyContext};
pub use worker::{FetchOutcome, HostStatus, ServiceWorkerHost};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("State error: {0}")]
    StateError(String),
}

/// Result type alias for service worker operations.
pub type Result<T> = std::result::Result<T, ServiceWorkerError>;
