//! Worker pool management with structured concurrency.
//!
//! Lifecycle management and graceful shutdown for supervised upsert worker
//! tasks.

use std::{sync::Arc, time::Duration};

use relay_core::{AccessTokenProvider, Clock};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    crm::CrmApi,
    error::{DeliveryError, Result},
    storage::JobStore,
    worker::{EngineStats, RelayConfig, UpsertWorker},
};

/// Pool of supervised upsert worker tasks.
///
/// Spawns the configured number of workers, tracks their join handles and
/// shuts them down collectively. Workers run until the shared cancellation
/// token fires.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    crm: Arc<dyn CrmApi>,
    tokens: Arc<dyn AccessTokenProvider>,
    config: RelayConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Creates a new worker pool with the given dependencies.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        crm: Arc<dyn CrmApi>,
        tokens: Arc<dyn AccessTokenProvider>,
        config: RelayConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            crm,
            tokens,
            config,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns all configured workers and begins processing.
    ///
    /// Returns immediately after spawning; workers run until cancellation.
    ///
    /// # Errors
    ///
    /// Currently never returns error but signature allows for future
    /// validation.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        info!(worker_count = self.config.worker_count, "spawning upsert workers");

        {
            let mut stats = self.stats.write().await;
            stats.active_workers = self.config.worker_count;
        }

        for worker_id in 0..self.config.worker_count {
            let worker = UpsertWorker::new(
                worker_id,
                self.store.clone(),
                self.crm.clone(),
                self.tokens.clone(),
                self.config.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            );

            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "upsert worker terminated with error");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        info!(spawned_workers = self.worker_handles.len(), "all upsert workers spawned");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Signals cancellation and waits for workers to finish their in-flight
    /// jobs within the timeout.
    ///
    /// # Errors
    ///
    /// Returns error if the timeout is exceeded before all workers join.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let shutdown_future = async {
            let mut results = Vec::new();

            for (worker_id, handle) in
                std::mem::take(&mut self.worker_handles).into_iter().enumerate()
            {
                match handle.await {
                    Ok(worker_result) => {
                        if let Err(error) = worker_result {
                            warn!(
                                worker_id,
                                error = %error,
                                "worker completed with error during shutdown"
                            );
                        }
                        results.push(Ok(()));
                    },
                    Err(join_error) => {
                        error!(
                            worker_id,
                            error = %join_error,
                            "worker task panicked during shutdown"
                        );
                        results.push(Err(DeliveryError::WorkerPanic {
                            worker_id,
                            error: format!("{join_error}"),
                        }));
                    },
                }
            }

            {
                let mut stats = self.stats.write().await;
                stats.active_workers = 0;
            }

            results
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(results) => {
                let error_count = results.iter().filter(|r| r.is_err()).count();
                if error_count > 0 {
                    warn!(
                        error_count,
                        total_workers = results.len(),
                        "some workers completed with errors during shutdown"
                    );
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_timeout) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Whether any workers are still running.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.worker_handles.is_empty() {
            let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

            if active_count > 0 && !self.cancellation_token.is_cancelled() {
                error!(
                    active_workers = active_count,
                    "WorkerPool dropped with active workers, forcing cancellation"
                );

                self.cancellation_token.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use relay_core::{StaticTokenProvider, TestClock};

    use super::*;
    use crate::{
        crm::{CrmClient, CrmConfig},
        storage::mock::InMemoryJobStore,
    };

    fn create_test_worker_pool(config: RelayConfig) -> WorkerPool {
        let clock = Arc::new(TestClock::new());
        let crm = Arc::new(CrmClient::new(CrmConfig::default(), clock.clone()).unwrap());

        WorkerPool::new(
            Arc::new(InMemoryJobStore::new()),
            crm,
            Arc::new(StaticTokenProvider::new("test-token")),
            config,
            Arc::new(RwLock::new(EngineStats::default())),
            CancellationToken::new(),
            clock,
        )
    }

    #[tokio::test]
    async fn worker_pool_spawns_configured_number_of_workers() {
        let mut pool =
            create_test_worker_pool(RelayConfig { worker_count: 5, ..Default::default() });

        pool.spawn_workers().await.expect("workers should spawn");

        assert_eq!(pool.worker_handles.len(), 5);

        pool.shutdown_graceful(Duration::from_secs(1)).await.expect("graceful shutdown");
    }

    #[tokio::test]
    async fn worker_pool_updates_active_worker_stats() {
        let stats = Arc::new(RwLock::new(EngineStats::default()));
        let clock = Arc::new(TestClock::new());
        let crm = Arc::new(CrmClient::new(CrmConfig::default(), clock.clone()).unwrap());
        let mut pool = WorkerPool::new(
            Arc::new(InMemoryJobStore::new()),
            crm,
            Arc::new(StaticTokenProvider::new("test-token")),
            RelayConfig { worker_count: 4, ..Default::default() },
            stats.clone(),
            CancellationToken::new(),
            clock,
        );

        assert_eq!(stats.read().await.active_workers, 0);

        pool.spawn_workers().await.expect("workers should spawn");
        assert_eq!(stats.read().await.active_workers, 4);

        pool.shutdown_graceful(Duration::from_secs(1)).await.expect("graceful shutdown");
        assert_eq!(stats.read().await.active_workers, 0);
    }

    #[tokio::test]
    async fn worker_pool_shutdown_without_spawn_is_immediate() {
        let pool = create_test_worker_pool(RelayConfig::default());

        assert!(!pool.has_active_workers());
        pool.shutdown_graceful(Duration::from_millis(10)).await.expect("nothing to wait for");
    }
}
