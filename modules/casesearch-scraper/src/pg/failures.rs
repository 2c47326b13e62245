use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use crate::traits::FailureLog;

/// One row per case; a later failure replaces the earlier description.
#[derive(Clone)]
pub struct PgFailureLog {
    pool: PgPool,
}

impl PgFailureLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FailureLog for PgFailureLog {
    async fn record(&self, case_number: &str, description: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scrape_failures (case_number, error, failed_at)
            VALUES ($1, $2, now())
            ON CONFLICT (case_number) DO UPDATE
                SET error = EXCLUDED.error, failed_at = EXCLUDED.failed_at
            "#,
        )
        .bind(case_number)
        .bind(description)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn case_numbers(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query_scalar::<_, String>("SELECT case_number FROM scrape_failures")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }
}
