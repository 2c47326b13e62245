// Worker lifecycle controller.
//
// Keeps at most one worker chain alive. Schedule ticks and queue alarms start
// a chain when the queue has work and no live chain holds the liveness
// record. Each worker link scrapes one batch, refreshes the record, and
// invokes its successor. The chain ends when a link finds the queue empty.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use casesearch_common::{CaseSearchError, Config, LivenessRecord, WORKER_LIVENESS_KEY};
use casesearch_scraper::{Harness, HarnessError, LivenessTable, PortalSession, WorkQueue};

use crate::invoker::WorkerInvoker;
use crate::trigger::Trigger;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Items per worker batch.
    pub default_concurrency: usize,
    pub liveness_ttl: Duration,
    /// Only alarms with this name start a chain.
    pub alarm_name: String,
}

impl WorkerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_concurrency: config.scraper_default_concurrency,
            liveness_ttl: Duration::minutes(config.liveness_ttl_minutes),
            alarm_name: config.queue_alarm_name.clone(),
        }
    }
}

/// What one `handle` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing queued; no chain started.
    QueueEmpty,
    /// A chain holds an unexpired liveness record.
    ChainAlive,
    ChainStarted,
    /// Batch done, next link invoked.
    ChainContinued { total: usize, succeeded: usize },
    /// Queue drained; liveness record removed.
    ChainEnded,
}

pub struct WorkerController<S> {
    harness: Arc<Harness<S>>,
    queue: Arc<dyn WorkQueue>,
    liveness: Arc<dyn LivenessTable>,
    invoker: Arc<dyn WorkerInvoker>,
    config: WorkerConfig,
}

impl<S: PortalSession + 'static> WorkerController<S> {
    pub fn new(
        harness: Arc<Harness<S>>,
        queue: Arc<dyn WorkQueue>,
        liveness: Arc<dyn LivenessTable>,
        invoker: Arc<dyn WorkerInvoker>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            harness,
            queue,
            liveness,
            invoker,
            config,
        }
    }

    pub async fn handle(&self, trigger: Trigger) -> Result<Decision> {
        match trigger {
            Trigger::Scheduled => {
                info!("Scheduled tick");
                self.start_chain().await
            }
            Trigger::Alarm { name } => {
                if name != self.config.alarm_name {
                    return Err(CaseSearchError::UnknownTrigger(format!("alarm {name}")).into());
                }
                info!(alarm = %name, "Queue alarm");
                self.start_chain().await
            }
            Trigger::Worker => self.run_worker().await,
        }
    }

    async fn start_chain(&self) -> Result<Decision> {
        let depth = self.queue.approximate_depth().await?;
        if depth == 0 {
            info!("Scraper queue is empty, nothing to do");
            return Ok(Decision::QueueEmpty);
        }

        if let Some(record) = self.liveness.get(WORKER_LIVENESS_KEY).await? {
            let now = Utc::now();
            if !record.is_expired(now, self.config.liveness_ttl) {
                info!(
                    invoked_at = %record.invoked_at,
                    depth,
                    "Scraper worker chain is alive"
                );
                return Ok(Decision::ChainAlive);
            }
            warn!(
                invoked_at = %record.invoked_at,
                ttl_minutes = self.config.liveness_ttl.num_minutes(),
                "Scraper worker liveness expired, restarting chain"
            );
            self.liveness.delete(WORKER_LIVENESS_KEY).await?;
        }

        info!(depth, "Starting scraper worker chain");
        self.hand_off().await?;
        Ok(Decision::ChainStarted)
    }

    async fn run_worker(&self) -> Result<Decision> {
        let nitems = self.config.default_concurrency;
        let (total, succeeded) = match self
            .harness
            .scrape_from_queue(self.queue.as_ref(), Some(nitems))
            .await
        {
            Ok(stats) => (stats.total, stats.succeeded),
            Err(HarnessError::NoItems { total: 0 }) => {
                info!("Scraper queue drained, ending worker chain");
                self.liveness.delete(WORKER_LIVENESS_KEY).await?;
                return Ok(Decision::ChainEnded);
            }
            // Every item failed. The failures are either acknowledged or
            // hidden by the queue, so the chain still makes progress.
            Err(HarnessError::NoItems { total }) => {
                warn!(total, "No cases scraped in batch");
                (total, 0)
            }
            Err(e) => return Err(e.into()),
        };

        self.hand_off().await?;
        Ok(Decision::ChainContinued { total, succeeded })
    }

    /// Refresh the lease, then ask for the next link.
    async fn hand_off(&self) -> Result<()> {
        self.liveness
            .put(&LivenessRecord::worker(Utc::now()))
            .await?;
        self.invoker.invoke_worker().await
    }
}
