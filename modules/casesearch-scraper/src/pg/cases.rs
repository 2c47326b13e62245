use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;

use casesearch_common::{ScrapeAudit, UnscrapedCase};

use crate::traits::CaseStore;

#[derive(Clone)]
pub struct PgCaseStore {
    pool: PgPool,
}

impl PgCaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register a case (or refresh its detail locator).
    pub async fn upsert_case(&self, case_number: &str, detail_loc: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cases (case_number, detail_loc)
            VALUES ($1, $2)
            ON CONFLICT (case_number) DO UPDATE SET detail_loc = EXCLUDED.detail_loc
            "#,
        )
        .bind(case_number)
        .bind(detail_loc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CaseStore for PgCaseStore {
    async fn record_scrape(&self, audit: &ScrapeAudit) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Executed before the scrapes insert so its foreign key resolves.
        sqlx::query(
            r#"
            INSERT INTO scrape_versions (version_id, case_number, length, sha256)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&audit.version.version_id)
        .bind(&audit.version.case_number)
        .bind(audit.version.length)
        .bind(&audit.version.sha256)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO scrapes (case_number, version_id, scraped_at, duration_secs)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&audit.event.case_number)
        .bind(&audit.event.version_id)
        .bind(audit.event.timestamp)
        .bind(audit.event.duration_secs)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE cases SET last_scrape = $2 WHERE case_number = $1")
            .bind(&audit.event.case_number)
            .bind(audit.event.timestamp)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn detail_loc(&self, case_number: &str) -> Result<Option<String>> {
        let row = sqlx::query_scalar::<_, String>(
            "SELECT detail_loc FROM cases WHERE case_number = $1",
        )
        .bind(case_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn count_unscraped(&self, excluded: &HashSet<String>) -> Result<u64> {
        let excluded: Vec<String> = excluded.iter().cloned().collect();
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT count(*) FROM cases
            WHERE last_scrape IS NULL
              AND NOT scrape_exempt
              AND NOT (case_number = ANY($1))
            "#,
        )
        .bind(&excluded)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn unscraped_batch(
        &self,
        after: Option<&str>,
        limit: i64,
        excluded: &HashSet<String>,
    ) -> Result<Vec<UnscrapedCase>> {
        let excluded: Vec<String> = excluded.iter().cloned().collect();
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT case_number, detail_loc FROM cases
            WHERE last_scrape IS NULL
              AND NOT scrape_exempt
              AND NOT (case_number = ANY($1))
              AND ($2::text IS NULL OR case_number > $2)
            ORDER BY case_number
            LIMIT $3
            "#,
        )
        .bind(&excluded)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(case_number, detail_loc)| UnscrapedCase {
                case_number,
                detail_loc,
            })
            .collect())
    }
}
