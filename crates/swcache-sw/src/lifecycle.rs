//! Worker lifecycle: the registration state machine and the install/activate handlers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use swcache_net::{Fetcher, Request, Response};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheError, CacheStorage};
use crate::config::RouterConfig;
use crate::{Result, ServiceWorkerError};

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

impl ServiceWorkerState {
    /// Only an activated worker intercepts fetches.
    pub fn can_intercept_fetch(&self) -> bool {
        matches!(self, ServiceWorkerState::Activated)
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceWorkerState::Parsed => write!(f, "parsed"),
            ServiceWorkerState::Installing => write!(f, "installing"),
            ServiceWorkerState::Installed => write!(f, "installed"),
            ServiceWorkerState::Activating => write!(f, "activating"),
            ServiceWorkerState::Activated => write!(f, "activated"),
            ServiceWorkerState::Redundant => write!(f, "redundant"),
        }
    }
}

/// One version of the worker.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Version label from the router config.
    pub version: String,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Error message if install failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    pub fn new(version: &str) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            version: version.to_string(),
            state: ServiceWorkerState::Parsed,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        debug!(
            worker = self.id.raw(),
            version = %self.version,
            from = %self.state,
            to = %state,
            "Worker state change"
        );
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

/// The installing/waiting/active slots for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed or activating).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
        }
    }

    /// The worker controlling pages, if any.
    pub fn controller(&self) -> Option<&ServiceWorker> {
        self.active.as_ref().filter(|w| w.is_active())
    }

    /// The most recently introduced worker.
    pub fn newest(&self) -> Option<&ServiceWorker> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
    }

    /// Start installing a new version. A previous installing worker is superseded.
    pub fn begin_install(&mut self, version: &str) -> ServiceWorkerId {
        if let Some(mut old) = self.installing.take() {
            old.set_state(ServiceWorkerState::Redundant);
        }
        let mut worker = ServiceWorker::new(version);
        worker.set_state(ServiceWorkerState::Installing);
        let id = worker.id;
        self.installing = Some(worker);
        id
    }

    /// Transition the installing worker `id` to waiting.
    ///
    /// Fails without touching any slot if `id` is not the installing worker,
    /// e.g. because a newer version superseded it mid-install.
    pub fn install_complete(&mut self, id: ServiceWorkerId) -> Result<()> {
        let mut worker = self.take_installing(id)?;
        worker.set_state(ServiceWorkerState::Installed);
        if let Some(mut old) = self.waiting.replace(worker) {
            old.set_state(ServiceWorkerState::Redundant);
        }
        Ok(())
    }

    /// The installing worker `id` failed. The active worker keeps control.
    /// Returns `None` if `id` is no longer the installing worker.
    pub fn install_failed(&mut self, id: ServiceWorkerId, reason: &str) -> Option<ServiceWorker> {
        let mut worker = self.take_installing(id).ok()?;
        worker.error = Some(reason.to_string());
        worker.set_state(ServiceWorkerState::Redundant);
        Some(worker)
    }

    fn take_installing(&mut self, id: ServiceWorkerId) -> Result<ServiceWorker> {
        match self.installing.take() {
            Some(worker) if worker.id == id => Ok(worker),
            other => {
                self.installing = other;
                Err(ServiceWorkerError::StateError(format!(
                    "worker {} is not installing",
                    id.raw()
                )))
            }
        }
    }

    /// A waiting worker may activate once no pages are controlled by the
    /// current one, or right away if nothing is active.
    pub fn can_activate(&self, controlled_clients: usize) -> bool {
        self.waiting.is_some() && (self.controller().is_none() || controlled_clients == 0)
    }

    /// Transition waiting to activating.
    pub fn begin_activate(&mut self) -> Result<()> {
        let worker = self
            .waiting
            .as_mut()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;
        if worker.state != ServiceWorkerState::Installed {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot activate a worker that is {}",
                worker.state
            )));
        }
        worker.set_state(ServiceWorkerState::Activating);
        Ok(())
    }

    /// Promote the activating worker. The old active worker becomes redundant.
    pub fn activate_complete(&mut self) -> Result<()> {
        let mut worker = match self.waiting.take() {
            Some(w) if w.state == ServiceWorkerState::Activating => w,
            other => {
                self.waiting = other;
                return Err(ServiceWorkerError::StateError(
                    "no activating worker".to_string(),
                ));
            }
        };
        if let Some(mut old) = self.active.take() {
            old.set_state(ServiceWorkerState::Redundant);
        }
        worker.set_state(ServiceWorkerState::Activated);
        self.active = Some(worker);
        Ok(())
    }

    /// Mark every worker redundant.
    pub fn unregister(&mut self) {
        for mut worker in [self.installing.take(), self.waiting.take(), self.active.take()]
            .into_iter()
            .flatten()
        {
            worker.set_state(ServiceWorkerState::Redundant);
        }
    }
}

/// Install handler: pre-cache the static manifest.
///
/// Every manifest URL is fetched first. If any fetch rejects or answers with a
/// non-2xx status the install fails and no partition is touched. Only then is
/// the static partition opened and filled. If a write then fails, a partition
/// this install created is deleted again. Returns the number of assets cached.
pub async fn install(
    storage: &dyn CacheStorage,
    fetcher: &dyn Fetcher,
    config: &RouterConfig,
) -> Result<usize> {
    let requests: Vec<Request> = config
        .manifest_urls()?
        .into_iter()
        .map(Request::get)
        .collect();

    info!(version = %config.version, assets = requests.len(), "Installing");

    let responses = try_join_all(requests.iter().map(|request| async move {
        let response = fetcher.fetch(request).await.map_err(|e| {
            ServiceWorkerError::InstallFailed(format!("{}: {e}", request.url))
        })?;
        if !response.ok() {
            return Err(ServiceWorkerError::InstallFailed(format!(
                "{} returned {}",
                request.url, response.status
            )));
        }
        Ok(response)
    }))
    .await
    .inspect_err(|e| warn!(version = %config.version, error = %e, "Install failed"))?;

    let static_cache = config.static_cache_name();
    let existed = storage.has(&static_cache).await;
    if let Err(e) = fill(storage, &static_cache, &requests, &responses).await {
        // A partly filled partition would be served by the current controller.
        if !existed {
            storage.delete(&static_cache).await;
        }
        warn!(version = %config.version, cache = %static_cache, error = %e, "Install failed");
        return Err(ServiceWorkerError::InstallFailed(format!("writing {static_cache}: {e}")));
    }

    info!(version = %config.version, cache = %static_cache, "Installed");
    Ok(responses.len())
}

async fn fill(
    storage: &dyn CacheStorage,
    cache: &str,
    requests: &[Request],
    responses: &[Response],
) -> std::result::Result<(), CacheError> {
    storage.open(cache).await?;
    for (request, response) in requests.iter().zip(responses) {
        storage.put(cache, request, response).await?;
    }
    Ok(())
}

/// Activate handler: delete every partition that does not belong to this version.
pub async fn activate(storage: &dyn CacheStorage, config: &RouterConfig) -> Vec<String> {
    let static_cache = config.static_cache_name();
    let dynamic_cache = config.dynamic_cache_name();

    let deleted = storage
        .delete_all_except(&[static_cache.as_str(), dynamic_cache.as_str()])
        .await;

    for name in &deleted {
        info!(cache = %name, "Deleted old cache");
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::testing::MockFetcher;
    use http::StatusCode;

    fn scope() -> Url {
        Url::parse("https://example.com/").unwrap()
    }

    fn config(version: &str) -> RouterConfig {
        RouterConfig {
            version: version.to_string(),
            scope: scope(),
            ..Default::default()
        }
    }

    fn serve_manifest(fetcher: &MockFetcher, config: &RouterConfig) {
        for url in config.manifest_urls().unwrap() {
            fetcher.respond(&url, Response::new(StatusCode::OK, url.path().to_string()));
        }
    }

    #[test]
    fn test_service_worker_creation() {
        let worker = ServiceWorker::new("v1");
        assert_eq!(worker.state, ServiceWorkerState::Parsed);
        assert!(!worker.is_active());
        assert!(!worker.state.can_intercept_fetch());
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut registration = ServiceWorkerRegistration::new(scope());

        let id = registration.begin_install("v1");
        assert!(registration.installing.is_some());
        assert!(registration.controller().is_none());

        registration.install_complete(id).unwrap();
        assert!(registration.installing.is_none());
        assert_eq!(
            registration.waiting.as_ref().unwrap().state,
            ServiceWorkerState::Installed
        );

        registration.begin_activate().unwrap();
        assert_eq!(
            registration.waiting.as_ref().unwrap().state,
            ServiceWorkerState::Activating
        );

        registration.activate_complete().unwrap();
        assert!(registration.waiting.is_none());
        assert_eq!(registration.controller().unwrap().version, "v1");
        assert!(registration.controller().unwrap().state.can_intercept_fetch());
    }

    #[test]
    fn test_install_failure_keeps_controller() {
        let mut registration = ServiceWorkerRegistration::new(scope());
        let id = registration.begin_install("v1");
        registration.install_complete(id).unwrap();
        registration.begin_activate().unwrap();
        registration.activate_complete().unwrap();

        let id = registration.begin_install("v2");
        let failed = registration.install_failed(id, "logo missing").unwrap();

        assert!(failed.is_redundant());
        assert_eq!(failed.error.as_deref(), Some("logo missing"));
        assert_eq!(registration.controller().unwrap().version, "v1");
        assert!(registration.waiting.is_none());
    }

    #[test]
    fn test_can_activate_waits_for_clients() {
        let mut registration = ServiceWorkerRegistration::new(scope());
        assert!(!registration.can_activate(0));

        let id = registration.begin_install("v1");
        registration.install_complete(id).unwrap();
        // Nothing active yet.
        assert!(registration.can_activate(3));

        registration.begin_activate().unwrap();
        registration.activate_complete().unwrap();

        let id = registration.begin_install("v2");
        registration.install_complete(id).unwrap();
        assert!(!registration.can_activate(2));
        assert!(registration.can_activate(0));
    }

    #[test]
    fn test_activate_replaces_old_worker() {
        let mut registration = ServiceWorkerRegistration::new(scope());
        for version in ["v1", "v2"] {
            let id = registration.begin_install(version);
            registration.install_complete(id).unwrap();
            registration.begin_activate().unwrap();
            registration.activate_complete().unwrap();
        }
        assert_eq!(registration.controller().unwrap().version, "v2");
    }

    #[test]
    fn test_invalid_transitions() {
        let mut registration = ServiceWorkerRegistration::new(scope());
        let stray = ServiceWorkerId::new();
        assert!(registration.install_complete(stray).is_err());
        assert!(registration.begin_activate().is_err());
        assert!(registration.activate_complete().is_err());
        assert!(registration.install_failed(stray, "nothing installing").is_none());

        let id = registration.begin_install("v1");
        registration.install_complete(id).unwrap();
        // Must pass through activating first.
        assert!(registration.activate_complete().is_err());
        assert!(registration.waiting.is_some());
    }

    #[test]
    fn test_superseded_install_cannot_complete() {
        let mut registration = ServiceWorkerRegistration::new(scope());
        let v2 = registration.begin_install("v2");
        let v3 = registration.begin_install("v3");

        assert!(matches!(
            registration.install_complete(v2),
            Err(ServiceWorkerError::StateError(_))
        ));
        assert!(registration.install_failed(v2, "late failure").is_none());
        assert_eq!(registration.installing.as_ref().unwrap().version, "v3");
        assert!(registration.waiting.is_none());

        registration.install_complete(v3).unwrap();
        assert_eq!(registration.waiting.as_ref().unwrap().version, "v3");
    }

    #[test]
    fn test_unregister() {
        let mut registration = ServiceWorkerRegistration::new(scope());
        registration.begin_install("v1");
        registration.unregister();
        assert!(registration.newest().is_none());
    }

    #[tokio::test]
    async fn test_install_populates_static_partition() {
        let storage = MemoryCacheStorage::new();
        let fetcher = MockFetcher::new();
        let config = config("v1");
        serve_manifest(&fetcher, &config);

        let cached = install(&storage, &fetcher, &config).await.unwrap();

        assert_eq!(cached, 3);
        assert_eq!(storage.entry_count("site-cache-v1-static").await, Some(3));
        let logo = Request::get(scope().join("/images/logo.png").unwrap());
        let hit = storage.match_in("site-cache-v1-static", &logo).await.unwrap();
        assert_eq!(&hit.body[..], b"/images/logo.png");
    }

    #[tokio::test]
    async fn test_install_is_all_or_nothing() {
        let storage = MemoryCacheStorage::new();
        let fetcher = MockFetcher::new();
        let config = config("v1");
        serve_manifest(&fetcher, &config);
        fetcher.go_offline(&scope().join("/images/logo.png").unwrap());

        let result = install(&storage, &fetcher, &config).await;

        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
        assert!(!storage.has("site-cache-v1-static").await);
        assert!(storage.keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_install_write_failure_removes_partition() {
        // Room for one 3-byte asset out of three.
        let storage = MemoryCacheStorage::new().with_quota(5);
        let fetcher = MockFetcher::new();
        let config = config("v1");
        for url in config.manifest_urls().unwrap() {
            fetcher.respond(&url, Response::new(StatusCode::OK, "abc"));
        }

        let result = install(&storage, &fetcher, &config).await;

        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
        assert!(!storage.has("site-cache-v1-static").await);
        assert_eq!(storage.size().await, 0);
    }

    #[tokio::test]
    async fn test_install_write_failure_keeps_existing_partition() {
        let storage = MemoryCacheStorage::new().with_quota(5);
        storage.open("site-cache-v1-static").await.unwrap();
        let fetcher = MockFetcher::new();
        let config = config("v1");
        for url in config.manifest_urls().unwrap() {
            fetcher.respond(&url, Response::new(StatusCode::OK, "abc"));
        }

        let result = install(&storage, &fetcher, &config).await;

        assert!(result.is_err());
        assert!(storage.has("site-cache-v1-static").await);
    }

    #[tokio::test]
    async fn test_install_fails_on_error_status() {
        let storage = MemoryCacheStorage::new();
        let fetcher = MockFetcher::new();
        let config = config("v1");
        serve_manifest(&fetcher, &config);
        fetcher.respond(
            &scope().join("/manifest.json").unwrap(),
            Response::new(StatusCode::NOT_FOUND, ""),
        );

        let result = install(&storage, &fetcher, &config).await;
        assert!(matches!(result, Err(ServiceWorkerError::InstallFailed(_))));
        assert!(!storage.has("site-cache-v1-static").await);
    }

    #[tokio::test]
    async fn test_activate_evicts_other_versions() {
        let storage = MemoryCacheStorage::new();
        for name in [
            "site-cache-v1-static",
            "site-cache-v1-dynamic",
            "unrelated",
            "site-cache-v2-static",
            "site-cache-v2-dynamic",
        ] {
            storage.open(name).await.unwrap();
        }

        let mut deleted = activate(&storage, &config("v2")).await;
        deleted.sort();

        assert_eq!(
            deleted,
            vec!["site-cache-v1-dynamic", "site-cache-v1-static", "unrelated"]
        );
        assert_eq!(
            storage.keys().await,
            vec!["site-cache-v2-static", "site-cache-v2-dynamic"]
        );
    }

    #[tokio::test]
    async fn test_activate_without_dynamic_partition() {
        let storage = MemoryCacheStorage::new();
        storage.open("site-cache-v1-static").await.unwrap();

        let deleted = activate(&storage, &config("v1")).await;
        assert!(deleted.is_empty());
        assert!(storage.has("site-cache-v1-static").await);
    }
}
