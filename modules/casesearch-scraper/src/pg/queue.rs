use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;

use casesearch_common::QueuedCase;

use crate::traits::{QueueMessage, WorkQueue};

/// Visibility-timeout queue on a Postgres table. Receiving a message hides
/// it for `visibility_timeout_secs`; deleting it with its receipt
/// acknowledges it. Unacknowledged messages reappear once hidden time lapses.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
    name: String,
    visibility_timeout_secs: i64,
}

impl PgQueue {
    pub fn new(pool: PgPool, name: &str, visibility_timeout_secs: i64) -> Self {
        Self {
            pool,
            name: name.to_string(),
            visibility_timeout_secs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn enqueue(&self, case: &QueuedCase) -> Result<()> {
        sqlx::query("INSERT INTO scraper_queue (queue_name, body) VALUES ($1, $2)")
            .bind(&self.name)
            .bind(case.to_json())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PgQueue {
    async fn fetch_batch(&self, max_items: usize) -> Result<Vec<QueueMessage>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            WITH next AS (
                SELECT id FROM scraper_queue
                WHERE queue_name = $1 AND visible_at <= now()
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE scraper_queue q
            SET receive_count = q.receive_count + 1,
                receipt = q.id::text || ':' || (q.receive_count + 1)::text,
                visible_at = now() + make_interval(secs => $3)
            FROM next
            WHERE q.id = next.id
            RETURNING q.receipt, q.body
            "#,
        )
        .bind(&self.name)
        .bind(max_items as i64)
        .bind(self.visibility_timeout_secs as f64)
        .fetch_all(&self.pool)
        .await?;

        debug!(queue = %self.name, received = rows.len(), "Received queue messages");
        Ok(rows
            .into_iter()
            .map(|(receipt, body)| QueueMessage { receipt, body })
            .collect())
    }

    async fn delete(&self, message: &QueueMessage) -> Result<()> {
        sqlx::query("DELETE FROM scraper_queue WHERE queue_name = $1 AND receipt = $2")
            .bind(&self.name)
            .bind(&message.receipt)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn approximate_depth(&self) -> Result<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM scraper_queue WHERE queue_name = $1 AND visible_at <= now()",
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}
