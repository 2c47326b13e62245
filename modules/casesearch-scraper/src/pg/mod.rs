//! Postgres implementations of the storage, failure-log, liveness, and queue
//! boundaries. All share one pool and one migration set.

mod cases;
mod failures;
mod liveness;
mod pages;
mod queue;

pub use cases::PgCaseStore;
pub use failures::PgFailureLog;
pub use liveness::PgLivenessTable;
pub use pages::PgPageStore;
pub use queue::PgQueue;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Name of the main scraper queue.
pub const SCRAPER_QUEUE: &str = "scraper";
/// Name of the queue holding previously failed cases.
pub const SCRAPER_FAILED_QUEUE: &str = "scraper_failed";

pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .context("Failed to connect to Postgres")
}

/// Run the embedded SQL migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run migrations")?;
    Ok(())
}
