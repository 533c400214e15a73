//! CRM relay service.
//!
//! Main entry point. Initializes tracing, loads configuration, prepares
//! the database, then runs the webhook intake server and the upsert
//! worker engine side by side until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use relay_api::{AppState, Config, intake_store::PostgresIntakeStore};
use relay_core::{AccessTokenProvider, Clock, RealClock, StaticTokenProvider, storage::Storage};
use relay_delivery::{RelayConfig, RelayEngine, crm::CrmConfig};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting CRM relay service");

    // Local development convenience; real deployments set the environment.
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        server_addr = %config.server_addr,
        worker_count = config.worker_count,
        webhook_source = %config.webhook_source,
        "Configuration loaded"
    );

    if config.metrics_enabled {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus metrics exporter")?;
        info!("Prometheus metrics exporter installed");
    }

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let tokens: Arc<dyn AccessTokenProvider> =
        Arc::new(StaticTokenProvider::new(config.crm_access_token.clone()));
    let storage = Arc::new(Storage::new(db_pool.clone()));

    let state = AppState::new(
        Arc::new(PostgresIntakeStore::new(storage)),
        tokens.clone(),
        clock.clone(),
        config.webhook_source.clone(),
        Duration::from_secs(config.idempotency_ttl_secs),
    );

    // Expired keys are only ever overwritten on conflict; sweep them out
    // periodically so the table does not grow unbounded.
    let purge_handle = tokio::spawn({
        let storage = Storage::new(db_pool.clone());
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                match storage.idempotency_keys.purge_expired().await {
                    Ok(0) => {},
                    Ok(removed) => info!(removed, "purged expired idempotency keys"),
                    Err(e) => error!(error = %e, "idempotency key purge failed"),
                }
            }
        }
    });

    let relay_config = RelayConfig {
        worker_count: config.worker_count,
        crm_config: CrmConfig { base_url: config.crm_base_url.clone(), ..CrmConfig::default() },
        ..RelayConfig::default()
    };
    let mut engine = RelayEngine::new(&db_pool, tokens, relay_config, clock)?;
    engine.start().await?;

    let server_handle = tokio::spawn({
        let addr = config.server_addr;
        async move {
            if let Err(e) = relay_api::start_server(state, addr).await {
                error!(error = %e, "Server failed");
            }
        }
    });

    info!(addr = %config.server_addr, "CRM relay is ready to receive webhooks");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    purge_handle.abort();

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "Engine shutdown incomplete");
    }

    // Give in-flight requests time to complete.
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(30)) => {
            info!("Shutdown grace period expired");
        }
        _ = server_handle => {
            info!("Server stopped");
        }
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("CRM relay shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,crm_relay=debug,relay_api=debug,tower_http=debug"))
        .expect("Invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                // Verify connection works
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Runs database migrations.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL,
            attempts_made INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 5,
            last_error TEXT,
            request_id TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_attempt_at TIMESTAMPTZ,
            next_retry_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            failed_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create jobs table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS idempotency_keys (
            key TEXT PRIMARY KEY,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            expires_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create idempotency_keys table")?;

    // Claim scans only touch claimable jobs. 'active' rows are included
    // because stalled ones become claimable again after the visibility
    // timeout.
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_jobs_claimable
        ON jobs(status, next_retry_at, created_at)
        WHERE status IN ('waiting', 'delayed', 'active')
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create jobs claim index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_jobs_failed
        ON jobs(failed_at DESC)
        WHERE status = 'failed'
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create dead letter index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_idempotency_keys_expiry
        ON idempotency_keys(expires_at)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create idempotency expiry index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
