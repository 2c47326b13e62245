use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CaseSearchError;

/// Singleton key of the worker liveness record.
pub const WORKER_LIVENESS_KEY: &str = "worker";

/// One case being scraped. The counters live only as long as a single scrape
/// attempt and are never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseItem {
    pub case_number: String,
    pub detail_loc: String,
    pub error_count: u32,
    pub timeout_count: u32,
}

impl CaseItem {
    pub fn new(case_number: impl Into<String>, detail_loc: impl Into<String>) -> Self {
        Self {
            case_number: case_number.into(),
            detail_loc: detail_loc.into(),
            error_count: 0,
            timeout_count: 0,
        }
    }
}

/// JSON body of a scraper queue message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedCase {
    pub case_number: String,
    pub detail_loc: String,
}

impl QueuedCase {
    pub fn from_json(body: &str) -> Result<Self, CaseSearchError> {
        serde_json::from_str(body).map_err(|e| CaseSearchError::MalformedMessage(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Two string fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A case that has never been scraped, as returned by backfill queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnscrapedCase {
    pub case_number: String,
    pub detail_loc: String,
}

/// One stored version of a case detail page. `body` is gzip-compressed;
/// `content_hash` is the sha256 of the uncompressed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPage {
    pub case_number: String,
    pub body: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub detail_loc: String,
    pub content_hash: String,
}

/// Audit row describing one stored page version.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeVersion {
    pub version_id: String,
    pub case_number: String,
    pub length: i64,
    pub sha256: String,
}

/// Audit row for one successful scrape. References a `ScrapeVersion`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeEvent {
    pub case_number: String,
    pub version_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_secs: Option<f64>,
}

/// Everything the relational store writes for one stored page, as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeAudit {
    pub version: ScrapeVersion,
    pub event: ScrapeEvent,
}

/// Lease proving a worker chain was recently alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessRecord {
    pub id: String,
    pub invoked_at: DateTime<Utc>,
}

impl LivenessRecord {
    pub fn worker(invoked_at: DateTime<Utc>) -> Self {
        Self {
            id: WORKER_LIVENESS_KEY.to_string(),
            invoked_at,
        }
    }

    /// A record is expired once strictly more than `ttl` has passed.
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.invoked_at > ttl
    }
}
