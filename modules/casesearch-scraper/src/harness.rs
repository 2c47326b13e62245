// Concurrency harness: drain a queue (or the backfill cursor) through a
// bounded pool of sessions, acknowledging each item on success and deferring
// failures to an error hook.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{info, warn};

use casesearch_common::QueuedCase;

use crate::outcome::ScrapeError;
use crate::pool::SessionPool;
use crate::scraper::{ScrapeOptions, Scraper};
use crate::traits::{PortalSession, QueueMessage, SessionFactory, WorkQueue};

/// What to do with a case whose scrape failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Acknowledge; the case is done with.
    Delete,
    /// Store the failed response body anyway, then acknowledge.
    Store,
    /// Leave unacknowledged so the queue redelivers it.
    Retry,
}

/// Operator policy for failed scrapes. Returning `Err` aborts the batch.
pub trait ErrorHook: Send + Sync {
    fn decide(&self, error: &ScrapeError, case_number: &str) -> anyhow::Result<ErrorAction>;
}

impl<F> ErrorHook for F
where
    F: Fn(&ScrapeError, &str) -> anyhow::Result<ErrorAction> + Send + Sync,
{
    fn decide(&self, error: &ScrapeError, case_number: &str) -> anyhow::Result<ErrorAction> {
        self(error, case_number)
    }
}

/// Delete cases that failed permanently (they are already in the failure
/// log) and leave transport or storage errors for redelivery.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeletePermanentFailures;

impl ErrorHook for DeletePermanentFailures {
    fn decide(&self, error: &ScrapeError, _case_number: &str) -> anyhow::Result<ErrorAction> {
        Ok(match error {
            ScrapeError::Failed(_) => ErrorAction::Delete,
            ScrapeError::Request(_) | ScrapeError::Other(_) => ErrorAction::Retry,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Items received from the queue or cursor.
    pub total: usize,
    /// Items scraped to completion.
    pub succeeded: usize,
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} cases scraped", self.succeeded, self.total)
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    /// The run scraped nothing. `total` tells an empty queue apart from a
    /// queue whose items all failed.
    #[error("no items scraped ({total} received)")]
    NoItems { total: usize },

    /// A failure no hook was willing to handle.
    #[error("batch aborted on case {case_number}: {source}")]
    Aborted {
        case_number: String,
        #[source]
        source: ScrapeError,
    },

    #[error("error hook rejected case {case_number}: {source}")]
    Hook {
        case_number: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One unit of work: a case plus, when it came from a queue, the message to
/// acknowledge.
struct WorkItem {
    case_number: String,
    detail_loc: String,
    message: Option<QueueMessage>,
}

pub struct Harness<S> {
    scraper: Arc<Scraper>,
    pool: SessionPool<S>,
    hook: Option<Arc<dyn ErrorHook>>,
}

impl<S: PortalSession + 'static> Harness<S> {
    /// Build a harness with a pool of `threads` freshly renewed sessions.
    pub async fn create<F>(scraper: Arc<Scraper>, factory: &F, threads: usize) -> anyhow::Result<Self>
    where
        F: SessionFactory<Session = S>,
    {
        let pool = SessionPool::create(factory, threads).await?;
        Ok(Self::with_pool(scraper, pool))
    }

    pub fn with_pool(scraper: Arc<Scraper>, pool: SessionPool<S>) -> Self {
        Self {
            scraper,
            pool,
            hook: None,
        }
    }

    pub fn with_error_hook(mut self, hook: Arc<dyn ErrorHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn pool(&self) -> &SessionPool<S> {
        &self.pool
    }

    /// Drain `queue` in batches. With `nitems`, process a single batch of at
    /// most that many items. Returns `NoItems` when nothing was scraped.
    pub async fn scrape_from_queue(
        &self,
        queue: &dyn WorkQueue,
        nitems: Option<usize>,
    ) -> Result<RunStats, HarnessError> {
        let options = self.scraper.queue_options();
        self.drain_queue(queue, nitems, options).await
    }

    /// Drain the failed-items queue. Failures are not logged again.
    pub async fn scrape_from_failed_queue(
        &self,
        queue: &dyn WorkQueue,
        nitems: Option<usize>,
    ) -> Result<RunStats, HarnessError> {
        let options = ScrapeOptions {
            check_before_store: true,
            log_failures: false,
        };
        self.drain_queue(queue, nitems, options).await
    }

    async fn drain_queue(
        &self,
        queue: &dyn WorkQueue,
        nitems: Option<usize>,
        options: ScrapeOptions,
    ) -> Result<RunStats, HarnessError> {
        let mut stats = RunStats::default();

        loop {
            let messages = fetch_from_queue(queue, nitems).await?;
            if messages.is_empty() {
                info!("No items found in queue");
                break;
            }
            stats.total += messages.len();

            let mut items = Vec::with_capacity(messages.len());
            for message in messages {
                match QueuedCase::from_json(&message.body) {
                    Ok(case) => items.push(WorkItem {
                        case_number: case.case_number,
                        detail_loc: case.detail_loc,
                        message: Some(message),
                    }),
                    // Acknowledged so it is never redelivered.
                    Err(e) => {
                        warn!(
                            receipt = %message.receipt,
                            body = %message.body,
                            error = %e,
                            "Dropping malformed queue message"
                        );
                        queue.delete(&message).await?;
                    }
                }
            }

            info!(cases = items.len(), "Scraping batch");
            stats.succeeded += self.process_batch(items, Some(queue), options).await?;
            info!(total = stats.total, "Finished scraping batch");

            if nitems.is_some() {
                break;
            }
        }

        info!(scraped = stats.succeeded, total = stats.total, "Total number of scraped cases");
        if stats.succeeded == 0 {
            return Err(HarnessError::NoItems { total: stats.total });
        }
        Ok(stats)
    }

    /// Scrape every case that has never been scraped, skipping exempt cases
    /// and cases already in the failure log. Walks the case table in pages of
    /// `batch_size` and writes without comparing against stored content.
    pub async fn scrape_missing_cases(&self, batch_size: i64) -> Result<RunStats, HarnessError> {
        let cases = self.scraper.cases().clone();
        let excluded: HashSet<String> = self.scraper.failures().case_numbers().await?;
        let unscraped = cases.count_unscraped(&excluded).await?;
        info!(unscraped, excluded = excluded.len(), "Starting backfill of unscraped cases");

        let options = ScrapeOptions {
            check_before_store: false,
            log_failures: self.scraper.config().log_failed_scrapes,
        };
        let mut stats = RunStats::default();
        let mut after: Option<String> = None;

        loop {
            let batch = cases
                .unscraped_batch(after.as_deref(), batch_size, &excluded)
                .await?;
            let Some(last) = batch.last() else {
                break;
            };
            after = Some(last.case_number.clone());
            stats.total += batch.len();

            let items = batch
                .into_iter()
                .map(|case| WorkItem {
                    case_number: case.case_number,
                    detail_loc: case.detail_loc,
                    message: None,
                })
                .collect();
            stats.succeeded += self.process_batch(items, None, options).await?;
            info!(scraped = stats.succeeded, of = unscraped, "Backfill progress");
        }

        info!(%stats, "Backfill complete");
        Ok(stats)
    }

    /// Run one batch with at most `pool.size()` scrapes in flight. Returns
    /// the number of successes.
    async fn process_batch(
        &self,
        items: Vec<WorkItem>,
        queue: Option<&dyn WorkQueue>,
        options: ScrapeOptions,
    ) -> Result<usize, HarnessError> {
        let scrapes: Vec<_> = items
            .into_iter()
            .map(|item| self.scrape_item(item, options))
            .collect();
        let mut results = stream::iter(scrapes).buffer_unordered(self.pool.size());

        let mut succeeded = 0;
        while let Some((item, result)) = results.next().await {
            match result {
                Ok(()) => {
                    succeeded += 1;
                    acknowledge(queue, item.message.as_ref()).await?;
                }
                Err(error) => self.on_error(&item, error, queue, options).await?,
            }
        }
        Ok(succeeded)
    }

    async fn scrape_item(
        &self,
        item: WorkItem,
        options: ScrapeOptions,
    ) -> (WorkItem, Result<(), ScrapeError>) {
        let result = self
            .scrape_pooled(&item.case_number, &item.detail_loc, options)
            .await;
        (item, result)
    }

    async fn scrape_pooled(
        &self,
        case_number: &str,
        detail_loc: &str,
        options: ScrapeOptions,
    ) -> Result<(), ScrapeError> {
        let mut session = self.pool.checkout().await?;
        self.scraper
            .scrape_case(&mut *session, case_number, detail_loc, options)
            .await
    }

    async fn on_error(
        &self,
        item: &WorkItem,
        error: ScrapeError,
        queue: Option<&dyn WorkQueue>,
        options: ScrapeOptions,
    ) -> Result<(), HarnessError> {
        let Some(hook) = &self.hook else {
            return Err(HarnessError::Aborted {
                case_number: item.case_number.clone(),
                source: error,
            });
        };

        let action = hook
            .decide(&error, &item.case_number)
            .map_err(|source| HarnessError::Hook {
                case_number: item.case_number.clone(),
                source,
            })?;
        info!(case_number = %item.case_number, ?action, error = %error, "Error hook decision");

        match action {
            ErrorAction::Retry => {}
            ErrorAction::Delete => acknowledge(queue, item.message.as_ref()).await?,
            ErrorAction::Store => {
                match error.html() {
                    Some(html) => {
                        self.scraper
                            .writer()
                            .store(
                                &item.case_number,
                                &item.detail_loc,
                                html,
                                None,
                                options.check_before_store,
                            )
                            .await?;
                    }
                    None => warn!(
                        case_number = %item.case_number,
                        "No response body to store, acknowledging only"
                    ),
                }
                acknowledge(queue, item.message.as_ref()).await?;
            }
        }
        Ok(())
    }
}

/// Receive up to `nitems` messages, or everything available when `nitems` is
/// `None`, in as many round trips as the queue's batch limit requires.
async fn fetch_from_queue(
    queue: &dyn WorkQueue,
    nitems: Option<usize>,
) -> anyhow::Result<Vec<QueueMessage>> {
    let per_call = queue.max_batch().max(1);
    let mut messages = Vec::new();

    loop {
        let want = match nitems {
            Some(n) => n.saturating_sub(messages.len()).min(per_call),
            None => per_call,
        };
        if want == 0 {
            break;
        }
        let received = queue.fetch_batch(want).await?;
        if received.is_empty() {
            break;
        }
        messages.extend(received);
    }

    Ok(messages)
}

async fn acknowledge(
    queue: Option<&dyn WorkQueue>,
    message: Option<&QueueMessage>,
) -> anyhow::Result<()> {
    if let (Some(queue), Some(message)) = (queue, message) {
        queue.delete(message).await?;
    }
    Ok(())
}
