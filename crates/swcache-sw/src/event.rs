//! Extendable events.
//!
//! A handler answers a request as soon as it has a response, but work it hands
//! to [`ExtendableEvent::wait_until`] (cache writes, revalidation) keeps
//! running on the runtime. The event is complete once
//! [`ExtendableEvent::settled`] resolves.

use std::future::Future;
use std::sync::Mutex;

use swcache_net::Request;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::ServiceWorkerError;

/// Tracks background work started on behalf of one event.
#[derive(Debug, Default)]
pub struct ExtendableEvent {
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl ExtendableEvent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `work` and extend the event's lifetime until it finishes.
    ///
    /// Failures are logged and never reach the response already handed out.
    pub fn wait_until<F>(&self, task: &'static str, work: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            if let Err(e) = work.await {
                warn!(task, error = %e, "Background work failed");
            }
        });
        self.lock().push(handle);
    }

    /// Number of background tasks not yet awaited by [`settled`](Self::settled).
    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Wait for all background work, including work added while waiting.
    pub async fn settled(&self) {
        loop {
            let handles = std::mem::take(&mut *self.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Background task panicked or was cancelled");
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A fetch event: the intercepted request plus its extendable lifetime.
#[derive(Debug)]
pub struct FetchEvent {
    pub request: Request,
    event: ExtendableEvent,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            event: ExtendableEvent::new(),
        }
    }

    pub fn wait_until<F>(&self, task: &'static str, work: F)
    where
        F: Future<Output = Result<(), ServiceWorkerError>> + Send + 'static,
    {
        self.event.wait_until(task, work);
    }

    pub fn pending(&self) -> usize {
        self.event.pending()
    }

    pub async fn settled(&self) {
        self.event.settled().await;
    }
}
