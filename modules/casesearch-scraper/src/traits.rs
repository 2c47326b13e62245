// Collaborator boundaries for the scrape engine.
//
// PortalSession: authenticated capability against the portal.
// WorkQueue    : at-least-once queue with explicit per-item delete.
// PageStore    : versioned blob store for compressed page bodies.
// CaseStore    : relational case/scrape metadata.
// FailureLog   : case_number → error description.
// LivenessTable: single-key lease record for the worker chain.
//
// Postgres implementations live in `pg`, the reqwest session in `session`,
// and in-memory mocks in `testing`.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use casesearch_common::{LivenessRecord, ScrapeAudit, StoredPage, UnscrapedCase};

use crate::outcome::RequestError;

// ---------------------------------------------------------------------------
// Portal session
// ---------------------------------------------------------------------------

/// A raw portal response. Redirects are never followed, so a 302 shows up
/// here with its `Location` header intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub text: String,
}

impl PortalResponse {
    pub fn new(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            text: text.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
pub trait PortalSession: Send {
    /// POST a form without following redirects.
    async fn post(
        &mut self,
        url: &str,
        form: &[(&str, &str)],
    ) -> std::result::Result<PortalResponse, RequestError>;

    /// Discard the current authentication and establish a fresh one.
    async fn renew(&mut self) -> Result<()>;
}

/// Builds sessions for the pool.
pub trait SessionFactory: Send + Sync {
    type Session: PortalSession + 'static;

    fn create(&self) -> Result<Self::Session>;
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// One delivered queue message. `receipt` identifies this delivery for
/// acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub receipt: String,
    pub body: String,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Receive up to `max_items` messages. Received messages stay hidden from
    /// other consumers until deleted or until their visibility lapses.
    async fn fetch_batch(&self, max_items: usize) -> Result<Vec<QueueMessage>>;

    /// Acknowledge a message so it is never redelivered.
    async fn delete(&self, message: &QueueMessage) -> Result<()>;

    /// Approximate number of messages waiting.
    async fn approximate_depth(&self) -> Result<u64>;

    /// Largest batch a single `fetch_batch` may return.
    fn max_batch(&self) -> usize {
        10
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PageStore: Send + Sync {
    /// Latest stored version for a case, if any.
    async fn get(&self, case_number: &str) -> Result<Option<StoredPage>>;

    /// Write a new version. Prior versions are superseded, never mutated.
    async fn put(&self, page: StoredPage) -> Result<()>;

    /// Make preceding puts durable.
    async fn commit(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait CaseStore: Send + Sync {
    /// Insert the version row, then the scrape-event row referencing it, and
    /// update the case's `last_scrape`, all in one transaction.
    async fn record_scrape(&self, audit: &ScrapeAudit) -> Result<()>;

    /// Detail locator for a known case.
    async fn detail_loc(&self, case_number: &str) -> Result<Option<String>>;

    /// Number of cases never scraped, not exempt, and not in `excluded`.
    async fn count_unscraped(&self, excluded: &HashSet<String>) -> Result<u64>;

    /// Next page of unscraped cases ordered by case number, strictly after
    /// `after`.
    async fn unscraped_batch(
        &self,
        after: Option<&str>,
        limit: i64,
        excluded: &HashSet<String>,
    ) -> Result<Vec<UnscrapedCase>>;
}

#[async_trait]
pub trait FailureLog: Send + Sync {
    async fn record(&self, case_number: &str, description: &str) -> Result<()>;

    /// Every case number with a logged failure.
    async fn case_numbers(&self) -> Result<HashSet<String>>;
}

#[async_trait]
pub trait LivenessTable: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<LivenessRecord>>;

    /// Create or overwrite.
    async fn put(&self, record: &LivenessRecord) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;
}
