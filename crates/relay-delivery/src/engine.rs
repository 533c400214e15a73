//! Relay engine coordinating the upsert worker pool.

use std::sync::Arc;

use relay_core::{AccessTokenProvider, Clock, storage::Storage};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    crm::{CrmApi, CrmClient},
    error::Result,
    storage::{JobStore, PostgresJobStore},
    worker::{EngineStats, RelayConfig, UpsertWorker},
    worker_pool::WorkerPool,
};

/// Main engine coordinating upsert workers.
///
/// Owns the worker pool, the shared statistics and the cancellation token.
/// Construct with [`RelayEngine::new`] for production wiring or
/// [`RelayEngine::with_dependencies`] to inject mocks in tests.
pub struct RelayEngine {
    store: Arc<dyn JobStore>,
    crm: Arc<dyn CrmApi>,
    tokens: Arc<dyn AccessTokenProvider>,
    config: RelayConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl RelayEngine {
    /// Creates an engine with injected dependencies.
    pub fn with_dependencies(
        store: Arc<dyn JobStore>,
        crm: Arc<dyn CrmApi>,
        tokens: Arc<dyn AccessTokenProvider>,
        config: RelayConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            crm,
            tokens,
            config,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        }
    }

    /// Creates a production engine over a PostgreSQL pool.
    ///
    /// # Errors
    ///
    /// Returns error if the CRM HTTP client cannot be built.
    pub fn new(
        pool: &PgPool,
        tokens: Arc<dyn AccessTokenProvider>,
        config: RelayConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let storage = Arc::new(Storage::new(pool.clone()));
        let store: Arc<dyn JobStore> = Arc::new(PostgresJobStore::new(storage));
        let crm: Arc<dyn CrmApi> =
            Arc::new(CrmClient::new(config.crm_config.clone(), clock.clone())?);

        Ok(Self::with_dependencies(store, crm, tokens, config, clock))
    }

    /// Starts the worker pool.
    ///
    /// Returns immediately after spawning workers; use [`Self::shutdown`] to
    /// stop gracefully.
    ///
    /// # Errors
    ///
    /// Returns error if the worker pool fails to spawn.
    pub async fn start(&mut self) -> Result<()> {
        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting relay engine"
        );

        let mut worker_pool = WorkerPool::new(
            self.store.clone(),
            self.crm.clone(),
            self.tokens.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker_pool.spawn_workers().await?;
        self.worker_pool = Some(worker_pool);

        info!("relay engine started");
        Ok(())
    }

    /// Gracefully shuts down the engine.
    ///
    /// # Errors
    ///
    /// Returns error if graceful shutdown times out.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down relay engine");

        if let Some(worker_pool) = self.worker_pool.take() {
            worker_pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        }
        Ok(())
    }

    /// Returns current engine statistics.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Processes exactly one batch of ready jobs synchronously.
    ///
    /// Claims one batch, processes it to completion and returns the number
    /// of jobs handled. No background workers are started; meant for tests
    /// and controlled drains.
    ///
    /// # Errors
    ///
    /// Returns error if claiming from the queue fails.
    pub async fn process_batch(&self) -> Result<usize> {
        let worker = UpsertWorker::new(
            0,
            self.store.clone(),
            self.crm.clone(),
            self.tokens.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        );

        worker.process_batch().await
    }
}
