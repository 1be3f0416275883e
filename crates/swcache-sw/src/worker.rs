//! Service worker host.
//!
//! Binds the lifecycle handlers, dispatcher and strategies to one scope. A
//! host adapter (the proxy, or a test) feeds it registrations and fetch events.

use std::sync::Arc;

use serde::Serialize;
use swcache_net::{Fetcher, Response};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::config::RouterConfig;
use crate::event::FetchEvent;
use crate::lifecycle::{self, ServiceWorkerRegistration, ServiceWorkerState};
use crate::route::{dispatch, Dispatch, PassthroughReason, RouteTable, Strategy};
use crate::strategy::{self, StrategyContext};
use crate::{Result, ServiceWorkerError};

/// What the host adapter should do with a request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Not intercepted; let the request go to the network untouched.
    Passthrough(PassthroughReason),
    /// Respond with this response.
    Respond(Response),
    /// Handled, but there is nothing to respond with (404 equivalent).
    NotFound,
    /// Handled and failed like a network error.
    NetworkError(String),
}

/// Snapshot of the host for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct HostStatus {
    /// State of the newest worker, `None` before the first registration.
    pub state: Option<ServiceWorkerState>,
    /// Version of the controlling worker.
    pub version: Option<String>,
    pub static_cache: Option<String>,
    pub dynamic_cache: Option<String>,
}

/// Everything one installed version needs to serve fetches.
struct WorkerVersion {
    config: RouterConfig,
    routes: RouteTable,
    context: StrategyContext,
}

impl WorkerVersion {
    fn new(
        config: RouterConfig,
        storage: &Arc<dyn CacheStorage>,
        fetcher: &Arc<dyn Fetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let routes = RouteTable::from_config(&config.routes);
        let context = StrategyContext::new(&config, Arc::clone(storage), Arc::clone(fetcher));
        Ok(Self {
            config,
            routes,
            context,
        })
    }
}

struct HostState {
    registration: ServiceWorkerRegistration,
    waiting: Option<Arc<WorkerVersion>>,
    active: Option<Arc<WorkerVersion>>,
}

/// Runs worker versions for one scope against a cache storage and a network.
pub struct ServiceWorkerHost {
    config: RouterConfig,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    state: RwLock<HostState>,
}

impl ServiceWorkerHost {
    /// Create a host. Nothing is installed until [`register`](Self::register).
    pub fn new(
        config: RouterConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let registration = ServiceWorkerRegistration::new(config.scope.clone());
        Ok(Self {
            config,
            storage,
            fetcher,
            state: RwLock::new(HostState {
                registration,
                waiting: None,
                active: None,
            }),
        })
    }

    /// Install the configured version, activating it if nothing controls the scope.
    pub async fn register(&self) -> Result<ServiceWorkerState> {
        self.update(self.config.clone()).await
    }

    /// Install a new version.
    ///
    /// On success the version waits, or activates right away when there is no
    /// controller or `skip_waiting` is set. On failure the current controller
    /// keeps serving. An update overtaken by a newer one while installing
    /// fails with `StateError` and leaves the newer one in place.
    pub async fn update(&self, config: RouterConfig) -> Result<ServiceWorkerState> {
        let version = Arc::new(WorkerVersion::new(config, &self.storage, &self.fetcher)?);

        let id = self
            .state
            .write()
            .await
            .registration
            .begin_install(&version.config.version);

        let installed =
            lifecycle::install(self.storage.as_ref(), self.fetcher.as_ref(), &version.config)
                .await;

        let activate_now = {
            let mut state = self.state.write().await;
            if let Err(e) = installed {
                state.registration.install_failed(id, &e.to_string());
                return Err(e);
            }
            // A newer update may have replaced this worker while it installed.
            state.registration.install_complete(id)?;
            state.waiting = Some(Arc::clone(&version));
            state.registration.controller().is_none() || version.config.skip_waiting
        };

        if activate_now {
            self.activate_waiting().await?;
            Ok(ServiceWorkerState::Activated)
        } else {
            info!(version = %version.config.version, "Installed, waiting for clients to close");
            Ok(ServiceWorkerState::Installed)
        }
    }

    /// Activate the waiting version if `controlled_clients` allows it.
    pub async fn try_activate(&self, controlled_clients: usize) -> Result<bool> {
        if !self
            .state
            .read()
            .await
            .registration
            .can_activate(controlled_clients)
        {
            return Ok(false);
        }
        self.activate_waiting().await?;
        Ok(true)
    }

    /// Activate the waiting version regardless of controlled clients.
    pub async fn skip_waiting(&self) -> Result<()> {
        self.activate_waiting().await
    }

    async fn activate_waiting(&self) -> Result<()> {
        // Held across the activate handler so no fetch sees a half-evicted storage.
        let mut state = self.state.write().await;
        let version = state
            .waiting
            .clone()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;

        state.registration.begin_activate()?;
        let deleted = lifecycle::activate(self.storage.as_ref(), &version.config).await;
        state.registration.activate_complete()?;
        state.waiting = None;
        state.active = Some(Arc::clone(&version));

        info!(
            version = %version.config.version,
            deleted = deleted.len(),
            "Activated"
        );
        Ok(())
    }

    /// Handle an intercepted request.
    pub async fn handle_fetch(&self, event: &FetchEvent) -> FetchOutcome {
        let active = self.state.read().await.active.clone();
        let Some(version) = active else {
            return FetchOutcome::Passthrough(PassthroughReason::NoController);
        };

        let strategy = match dispatch(&version.routes, &event.request) {
            Dispatch::Passthrough(reason) => {
                debug!(url = %event.request.url, %reason, "Not intercepted");
                return FetchOutcome::Passthrough(reason);
            }
            Dispatch::Handle(strategy) => strategy,
        };

        match strategy::run(strategy, &version.context, event).await {
            Ok(Some(response)) => FetchOutcome::Respond(response),
            Ok(None) => {
                debug!(url = %event.request.url, %strategy, "No response available");
                FetchOutcome::NotFound
            }
            Err(e) => {
                warn!(url = %event.request.url, %strategy, error = %e, "Fetch failed");
                FetchOutcome::NetworkError(e.to_string())
            }
        }
    }

    /// Strategy the controlling version would use for a URL.
    pub async fn classify(&self, url: &url::Url) -> Option<Strategy> {
        let state = self.state.read().await;
        state.active.as_ref().map(|v| v.routes.classify(url))
    }

    pub async fn state(&self) -> Option<ServiceWorkerState> {
        self.state.read().await.registration.newest().map(|w| w.state)
    }

    pub async fn status(&self) -> HostStatus {
        let state = self.state.read().await;
        let active = state.active.as_ref();
        HostStatus {
            state: state.registration.newest().map(|w| w.state),
            version: active.map(|v| v.config.version.clone()),
            static_cache: active.map(|v| v.config.static_cache_name()),
            dynamic_cache: active.map(|v| v.config.dynamic_cache_name()),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }
}
