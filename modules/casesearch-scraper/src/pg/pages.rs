use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use casesearch_common::StoredPage;

use crate::traits::PageStore;

/// Page bodies kept as append-only rows; the newest row per case is current.
#[derive(Clone)]
pub struct PgPageStore {
    pool: PgPool,
}

impl PgPageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of stored versions for a case.
    pub async fn version_count(&self, case_number: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM case_pages WHERE case_number = $1",
        )
        .bind(case_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

#[async_trait]
impl PageStore for PgPageStore {
    async fn get(&self, case_number: &str) -> Result<Option<StoredPage>> {
        let row = sqlx::query_as::<_, (String, Vec<u8>, DateTime<Utc>, String, String)>(
            r#"
            SELECT case_number, body, stored_at, detail_loc, content_hash
            FROM case_pages
            WHERE case_number = $1
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(case_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(case_number, body, timestamp, detail_loc, content_hash)| StoredPage {
                case_number,
                body,
                timestamp,
                detail_loc,
                content_hash,
            },
        ))
    }

    // Autocommitted on insert, so the default no-op commit applies.
    async fn put(&self, page: StoredPage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO case_pages (case_number, body, detail_loc, content_hash, stored_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&page.case_number)
        .bind(&page.body)
        .bind(&page.detail_loc)
        .bind(&page.content_hash)
        .bind(page.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
