// Per-case scrape loop.
//
// Requesting → Retrying        (counted failure below its limit, loop)
//            → RenewingSession (expired auth, renew and loop, not counted)
//            → Completed       (stored or unchanged)
//            → PermanentlyFailed (logged, body attached, returned to caller)

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use tracing::{debug, info, warn};

use casesearch_common::{CaseItem, CaseSearchError, Config};

use crate::classify::{classify_response, Limits};
use crate::outcome::{
    FailureKind, RequestError, ScrapeError, ScrapeFailure, ScrapeOutcome, TransientKind, Verdict,
};
use crate::store::PageWriter;
use crate::traits::{CaseStore, FailureLog, PageStore, PortalResponse, PortalSession, SessionFactory};

/// Pause after a request timeout before asking again.
const TIMEOUT_COOLDOWN: Duration = Duration::from_millis(100);
/// Pause after a permanent failure so a failing batch doesn't hammer the portal.
const FAILURE_COOLDOWN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub detail_url: String,
    pub auth_target: String,
    pub limits: Limits,
    pub log_failed_scrapes: bool,
    /// Per-case progress at debug instead of info.
    pub quiet: bool,
    pub timeout_cooldown: Duration,
    pub failure_cooldown: Duration,
}

impl ScraperConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            detail_url: config.detail_url.clone(),
            auth_target: config.auth_target.clone(),
            limits: Limits {
                query_error_limit: config.query_error_limit,
                query_timeouts_limit: config.query_timeouts_limit,
            },
            log_failed_scrapes: config.log_failed_scrapes,
            quiet: config.quiet,
            timeout_cooldown: TIMEOUT_COOLDOWN,
            failure_cooldown: FAILURE_COOLDOWN,
        }
    }
}

/// Per-run knobs for a scrape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeOptions {
    pub check_before_store: bool,
    pub log_failures: bool,
}

pub struct Scraper {
    config: ScraperConfig,
    writer: PageWriter,
    cases: Arc<dyn CaseStore>,
    failures: Arc<dyn FailureLog>,
}

impl Scraper {
    pub fn new(
        config: ScraperConfig,
        pages: Arc<dyn PageStore>,
        cases: Arc<dyn CaseStore>,
        failures: Arc<dyn FailureLog>,
    ) -> Self {
        Self {
            writer: PageWriter::new(pages, cases.clone()),
            config,
            cases,
            failures,
        }
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }

    pub fn writer(&self) -> &PageWriter {
        &self.writer
    }

    pub fn cases(&self) -> &Arc<dyn CaseStore> {
        &self.cases
    }

    pub fn failures(&self) -> &Arc<dyn FailureLog> {
        &self.failures
    }

    /// Options for draining the main scraper queue.
    pub fn queue_options(&self) -> ScrapeOptions {
        ScrapeOptions {
            check_before_store: true,
            log_failures: self.config.log_failed_scrapes,
        }
    }

    /// Scrape one case on `session` until it completes or fails for good.
    pub async fn scrape_case<S>(
        &self,
        session: &mut S,
        case_number: &str,
        detail_loc: &str,
        options: ScrapeOptions,
    ) -> Result<(), ScrapeError>
    where
        S: PortalSession + ?Sized,
    {
        let mut item = CaseItem::new(case_number, detail_loc);

        loop {
            self.progress(case_number, "Requesting case details");
            let begin = Instant::now();
            let result = session
                .post(&self.config.detail_url, &[("caseId", case_number)])
                .await;
            let duration = begin.elapsed();

            let (outcome, body) = match result {
                Ok(response) => {
                    let outcome = self
                        .handle_response(&mut item, &response, duration, options)
                        .await?;
                    (outcome, Some(response.text))
                }
                Err(RequestError::Timeout) => {
                    tokio::time::sleep(self.config.timeout_cooldown).await;
                    (self.handle_request_timeout(&mut item, options).await?, None)
                }
                Err(e) => return Err(e.into()),
            };

            match outcome {
                ScrapeOutcome::Completed => {
                    self.progress(case_number, "Completed scraping");
                    return Ok(());
                }
                ScrapeOutcome::ExpiredSession => {
                    self.progress(case_number, "Renewing session");
                    session.renew().await?;
                }
                ScrapeOutcome::TransientError(kind) => {
                    debug!(
                        case_number,
                        ?kind,
                        errors = item.error_count,
                        timeouts = item.timeout_count,
                        "Retrying"
                    );
                }
                ScrapeOutcome::PermanentError(mut failure) => {
                    failure.html = body;
                    tokio::time::sleep(self.config.failure_cooldown).await;
                    return Err(failure.into());
                }
            }
        }
    }

    /// Count a request that got no response. Fails for good once the timeout
    /// limit is reached.
    pub async fn handle_request_timeout(
        &self,
        item: &mut CaseItem,
        options: ScrapeOptions,
    ) -> Result<ScrapeOutcome, ScrapeError> {
        item.timeout_count += 1;
        if item.timeout_count < self.config.limits.query_timeouts_limit {
            return Ok(ScrapeOutcome::TransientError(TransientKind::RequestTimeout));
        }

        let kind = FailureKind::TimeoutLimitReached;
        self.log_failed_scrape(item, kind.description(), options)
            .await?;
        Ok(ScrapeOutcome::PermanentError(ScrapeFailure {
            case_number: item.case_number.clone(),
            kind,
            detail: kind.description().to_string(),
            html: None,
        }))
    }

    /// Classify one response and carry out the side effects of the verdict:
    /// failure-log write on terminal failures, storage on success.
    pub async fn handle_response(
        &self,
        item: &mut CaseItem,
        response: &PortalResponse,
        duration: Duration,
        options: ScrapeOptions,
    ) -> Result<ScrapeOutcome, ScrapeError> {
        let verdict = classify_response(
            item,
            response,
            &self.config.limits,
            &self.config.auth_target,
        );

        match verdict {
            Verdict::Retry(kind) => Ok(ScrapeOutcome::TransientError(kind)),
            Verdict::ExpiredSession => Ok(ScrapeOutcome::ExpiredSession),
            Verdict::Store => {
                self.writer
                    .store(
                        &item.case_number,
                        &item.detail_loc,
                        &response.text,
                        Some(duration),
                        options.check_before_store,
                    )
                    .await?;
                Ok(ScrapeOutcome::Completed)
            }
            Verdict::Fail { kind, detail } => {
                self.log_failed_scrape(item, &detail, options).await?;
                Ok(ScrapeOutcome::PermanentError(ScrapeFailure {
                    case_number: item.case_number.clone(),
                    kind,
                    detail,
                    html: None,
                }))
            }
        }
    }

    /// Look up a case's detail locator and scrape it on a fresh session.
    pub async fn scrape_specific_case<F>(
        &self,
        factory: &F,
        case_number: &str,
    ) -> Result<(), ScrapeError>
    where
        F: SessionFactory,
    {
        let detail_loc = self
            .cases
            .detail_loc(case_number)
            .await?
            .ok_or_else(|| anyhow!(CaseSearchError::CaseNotFound(case_number.to_string())))?;

        let mut session = factory.create()?;
        session.renew().await?;
        self.scrape_case(&mut session, case_number, &detail_loc, self.queue_options())
            .await
    }

    async fn log_failed_scrape(
        &self,
        item: &CaseItem,
        description: &str,
        options: ScrapeOptions,
    ) -> anyhow::Result<()> {
        warn!(
            case_number = %item.case_number,
            detail_loc = %item.detail_loc,
            error = description,
            "Failed to scrape case"
        );
        if options.log_failures {
            self.failures.record(&item.case_number, description).await?;
        }
        Ok(())
    }

    fn progress(&self, case_number: &str, message: &str) {
        if self.config.quiet {
            debug!(case_number, "{message}");
        } else {
            info!(case_number, "{message}");
        }
    }
}
