//! Operator CLI for the dead letter queue.
//!
//! Inspects and re-drives dead-lettered jobs directly against the
//! database. Runs alongside the service; the workers pick retried jobs
//! up on their next poll.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_core::{JobId, storage::Storage};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "dlq", about = "Inspect and retry dead-lettered relay jobs")]
struct Cli {
    /// PostgreSQL connection string (falls back to DATABASE_URL).
    #[arg(long)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List dead-lettered jobs with their failure reasons.
    List {
        /// Maximum number of jobs to show.
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Reset dead-lettered jobs to waiting so workers pick them up again.
    Retry {
        /// Retry only this job instead of every dead letter.
        #[arg(long)]
        id: Option<Uuid>,
    },
    /// Print per-state job counts as JSON.
    States,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    let database_url = match cli.database_url {
        Some(url) => url,
        None => std::env::var("DATABASE_URL")
            .context("DATABASE_URL not set and --database-url not given")?,
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .context("Failed to connect to database")?;
    let storage = Storage::new(pool);

    match cli.command {
        Command::List { limit } => list(&storage, limit).await,
        Command::Retry { id } => retry(&storage, id).await,
        Command::States => states(&storage).await,
    }
}

async fn list(storage: &Storage, limit: i64) -> Result<()> {
    let jobs = storage.jobs.find_dead_lettered(limit).await?;

    if jobs.is_empty() {
        println!("no dead-lettered jobs");
        return Ok(());
    }

    println!("{:<38} {:<18} {:>8}  {}", "ID", "NAME", "ATTEMPTS", "LAST ERROR");
    for job in jobs {
        println!(
            "{:<38} {:<18} {:>8}  {}",
            job.id,
            job.name,
            job.attempts_made,
            job.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn retry(storage: &Storage, id: Option<Uuid>) -> Result<()> {
    match id {
        Some(id) => {
            let retried = storage.jobs.retry_dead_lettered(JobId::from(id)).await?;
            if retried {
                println!("retried {id}");
            } else {
                println!("{id} is not dead-lettered");
            }
        },
        None => {
            // Page through everything currently dead-lettered. Jobs reset
            // here change status, so each pass fetches a fresh batch.
            let mut total = 0usize;
            loop {
                let batch = storage.jobs.find_dead_lettered(100).await?;
                if batch.is_empty() {
                    break;
                }
                for job in batch {
                    if storage.jobs.retry_dead_lettered(job.id).await? {
                        total += 1;
                    }
                }
            }
            println!("retried {total} job(s)");
        },
    }
    Ok(())
}

async fn states(storage: &Storage) -> Result<()> {
    let counts = storage.jobs.counts().await?;
    println!("{}", serde_json::to_string_pretty(&counts)?);
    Ok(())
}
