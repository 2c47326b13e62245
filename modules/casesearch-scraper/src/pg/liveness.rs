use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use casesearch_common::LivenessRecord;

use crate::traits::LivenessTable;

#[derive(Clone)]
pub struct PgLivenessTable {
    pool: PgPool,
}

impl PgLivenessTable {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LivenessTable for PgLivenessTable {
    async fn get(&self, id: &str) -> Result<Option<LivenessRecord>> {
        let invoked_at = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT invoked_at FROM scraper_liveness WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(invoked_at.map(|invoked_at| LivenessRecord {
            id: id.to_string(),
            invoked_at,
        }))
    }

    async fn put(&self, record: &LivenessRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scraper_liveness (id, invoked_at)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET invoked_at = EXCLUDED.invoked_at
            "#,
        )
        .bind(&record.id)
        .bind(record.invoked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM scraper_liveness WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
