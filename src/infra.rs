//! Execution infrastructure behind the scheduling core.
//!
//! Gathers the handles every operation needs (persistence, resource-manager
//! proxies, the internal task pool and the timer) behind one trait so tests
//! can substitute a recording implementation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::ports::{Persistence, RmProxiesManager};

pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Infrastructure: Send + Sync {
    /// Run `fut` once after `delay`. The callable is dropped without running
    /// if the infrastructure shuts down first.
    fn schedule(&self, delay: Duration, fut: BoxFuture);

    /// Run `fut` on the bounded internal pool.
    fn spawn_internal(&self, fut: BoxFuture);

    fn db(&self) -> &Arc<dyn Persistence>;

    fn rm_proxies(&self) -> &Arc<dyn RmProxiesManager>;

    /// Stop timers and refuse further work. Idempotent.
    fn shutdown(&self);
}

/// Production infrastructure on the tokio runtime. Internal operations share
/// a semaphore so a burst of terminations cannot spawn without bound.
pub struct TokioInfrastructure {
    db: Arc<dyn Persistence>,
    rm_proxies: Arc<dyn RmProxiesManager>,
    token: CancellationToken,
    internal_pool: Arc<Semaphore>,
}

impl TokioInfrastructure {
    pub fn new(
        db: Arc<dyn Persistence>,
        rm_proxies: Arc<dyn RmProxiesManager>,
        internal_pool_size: usize,
    ) -> Self {
        Self {
            db,
            rm_proxies,
            token: CancellationToken::new(),
            internal_pool: Arc::new(Semaphore::new(internal_pool_size)),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Infrastructure for TokioInfrastructure {
    fn schedule(&self, delay: Duration, fut: BoxFuture) {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("timer cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => {
                    fut.await;
                }
            }
        });
    }

    fn spawn_internal(&self, fut: BoxFuture) {
        let pool = Arc::clone(&self.internal_pool);
        let token = self.token.clone();
        tokio::spawn(async move {
            if token.is_cancelled() {
                return;
            }
            // Closed only on shutdown, where dropping the work is intended.
            if let Ok(_permit) = pool.acquire().await {
                fut.await;
            }
        });
    }

    fn db(&self) -> &Arc<dyn Persistence> {
        &self.db
    }

    fn rm_proxies(&self) -> &Arc<dyn RmProxiesManager> {
        &self.rm_proxies
    }

    fn shutdown(&self) {
        self.token.cancel();
        self.internal_pool.close();
    }
}
