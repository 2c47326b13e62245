// Test mocks for the scrape engine.
//
// One mock per trait boundary:
// - ScriptedSession (PortalSession): per-case scripted responses, shared
//   across every session a ScriptedSessionFactory hands out
// - MemoryQueue (WorkQueue): visibility-hiding queue with receipts
// - MemoryPageStore (PageStore): every version kept per case
// - MemoryCaseStore (CaseStore): case table plus audit rows, enforcing that
//   an event references an already-inserted version
// - MemoryFailureLog (FailureLog)
// - MemoryLiveness (LivenessTable)
//
// Plus `detail_page` and `test_scraper_config` for building fixtures.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use casesearch_common::{
    LivenessRecord, QueuedCase, ScrapeAudit, ScrapeEvent, ScrapeVersion, StoredPage,
    UnscrapedCase,
};

use crate::classify::Limits;
use crate::outcome::RequestError;
use crate::scraper::ScraperConfig;
use crate::traits::{
    CaseStore, FailureLog, LivenessTable, PageStore, PortalResponse, PortalSession, QueueMessage,
    SessionFactory, WorkQueue,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const TEST_DETAIL_URL: &str = "http://portal.test/inquiryByCaseNum.jis";
pub const TEST_AUTH_TARGET: &str = "http://portal.test/inquiry-index.jsp";

/// A detail page long enough to pass the sanity checks that mentions
/// `case_number`.
pub fn detail_page(case_number: &str) -> String {
    format!(
        "<html><body><h2>Case Information</h2><p>Case Number: {case_number}</p>{}</body></html>",
        "<tr><td>Docket entry</td></tr>".repeat(50)
    )
}

/// Scraper config pointed at the test portal, with no cooldown sleeps.
pub fn test_scraper_config(query_error_limit: u32, query_timeouts_limit: u32) -> ScraperConfig {
    ScraperConfig {
        detail_url: TEST_DETAIL_URL.to_string(),
        auth_target: TEST_AUTH_TARGET.to_string(),
        limits: Limits {
            query_error_limit,
            query_timeouts_limit,
        },
        log_failed_scrapes: true,
        quiet: true,
        timeout_cooldown: Duration::ZERO,
        failure_cooldown: Duration::ZERO,
    }
}

pub fn expired_session_redirect() -> PortalResponse {
    PortalResponse::new(302, "").with_header("Location", TEST_AUTH_TARGET)
}

// ---------------------------------------------------------------------------
// ScriptedSession
// ---------------------------------------------------------------------------

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Step {
    Respond(PortalResponse),
    Timeout,
    Transport(String),
}

#[derive(Default)]
struct Script {
    steps: HashMap<String, VecDeque<Step>>,
    posts: HashMap<String, usize>,
}

#[derive(Default)]
struct SessionState {
    script: Mutex<Script>,
    renewals: AtomicUsize,
    created: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Replays scripted steps per case number. Once a case's script runs out,
/// every further request gets a valid detail page for that case.
pub struct ScriptedSession {
    state: Arc<SessionState>,
}

#[async_trait]
impl PortalSession for ScriptedSession {
    async fn post(
        &mut self,
        _url: &str,
        form: &[(&str, &str)],
    ) -> std::result::Result<PortalResponse, RequestError> {
        let case_number = form
            .iter()
            .find(|(k, _)| *k == "caseId")
            .map(|(_, v)| v.to_string())
            .unwrap_or_default();

        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(current, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        let step = {
            let mut script = self.state.script.lock().unwrap();
            *script.posts.entry(case_number.clone()).or_default() += 1;
            script
                .steps
                .get_mut(&case_number)
                .and_then(|steps| steps.pop_front())
        };

        match step {
            Some(Step::Respond(response)) => Ok(response),
            Some(Step::Timeout) => Err(RequestError::Timeout),
            Some(Step::Transport(message)) => Err(RequestError::Transport(message)),
            None => Ok(PortalResponse::new(200, detail_page(&case_number))),
        }
    }

    async fn renew(&mut self) -> Result<()> {
        self.state.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out `ScriptedSession`s sharing one script. Builder pattern:
/// `.on_case()`, `.respond()`, `.timeout()`.
#[derive(Clone, Default)]
pub struct ScriptedSessionFactory {
    state: Arc<SessionState>,
}

impl ScriptedSessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `steps` to the script for `case_number`.
    pub fn on_case(self, case_number: &str, steps: impl IntoIterator<Item = Step>) -> Self {
        self.state
            .script
            .lock()
            .unwrap()
            .steps
            .entry(case_number.to_string())
            .or_default()
            .extend(steps);
        self
    }

    pub fn respond(self, case_number: &str, status: u16, text: &str) -> Self {
        self.on_case(
            case_number,
            [Step::Respond(PortalResponse::new(status, text))],
        )
    }

    pub fn timeout(self, case_number: &str) -> Self {
        self.on_case(case_number, [Step::Timeout])
    }

    /// Requests made for `case_number` across all sessions.
    pub fn posts(&self, case_number: &str) -> usize {
        self.state
            .script
            .lock()
            .unwrap()
            .posts
            .get(case_number)
            .copied()
            .unwrap_or(0)
    }

    pub fn renewals(&self) -> usize {
        self.state.renewals.load(Ordering::SeqCst)
    }

    pub fn sessions_created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    /// Highest number of requests observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }
}

impl SessionFactory for ScriptedSessionFactory {
    type Session = ScriptedSession;

    fn create(&self) -> Result<ScriptedSession> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptedSession {
            state: self.state.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryQueue
// ---------------------------------------------------------------------------

struct Envelope {
    id: u64,
    body: String,
    receipt: Option<String>,
}

#[derive(Default)]
struct QueueInner {
    next_id: u64,
    messages: Vec<Envelope>,
    deliveries: u64,
}

/// In-memory queue. Fetching hides a message until it is deleted or
/// `release_hidden` is called, which stands in for visibility lapsing.
pub struct MemoryQueue {
    inner: Mutex<QueueInner>,
    max_batch: usize,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_batch: 10,
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn with_cases<'a>(self, case_numbers: impl IntoIterator<Item = &'a str>) -> Self {
        for case_number in case_numbers {
            self.push(&QueuedCase {
                case_number: case_number.to_string(),
                detail_loc: "ODYCIVIL".to_string(),
            });
        }
        self
    }

    pub fn push(&self, case: &QueuedCase) {
        self.push_raw(&case.to_json());
    }

    pub fn push_raw(&self, body: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.messages.push(Envelope {
            id,
            body: body.to_string(),
            receipt: None,
        });
    }

    /// Messages not yet deleted, hidden or not.
    pub fn remaining(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    /// Bodies of messages not yet deleted.
    pub fn remaining_bodies(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .iter()
            .map(|m| m.body.clone())
            .collect()
    }

    /// Make every hidden message visible again.
    pub fn release_hidden(&self) {
        for message in &mut self.inner.lock().unwrap().messages {
            message.receipt = None;
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn fetch_batch(&self, max_items: usize) -> Result<Vec<QueueMessage>> {
        let mut inner = self.inner.lock().unwrap();
        let mut batch = Vec::new();
        let mut deliveries = inner.deliveries;
        for message in inner.messages.iter_mut() {
            if batch.len() >= max_items.min(self.max_batch) {
                break;
            }
            if message.receipt.is_some() {
                continue;
            }
            deliveries += 1;
            let receipt = format!("{}:{deliveries}", message.id);
            message.receipt = Some(receipt.clone());
            batch.push(QueueMessage {
                receipt,
                body: message.body.clone(),
            });
        }
        inner.deliveries = deliveries;
        Ok(batch)
    }

    async fn delete(&self, message: &QueueMessage) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.messages.len();
        inner
            .messages
            .retain(|m| m.receipt.as_deref() != Some(message.receipt.as_str()));
        if inner.messages.len() == before {
            bail!("unknown receipt {}", message.receipt);
        }
        Ok(())
    }

    async fn approximate_depth(&self) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.messages.iter().filter(|m| m.receipt.is_none()).count() as u64)
    }

    fn max_batch(&self) -> usize {
        self.max_batch
    }
}

// ---------------------------------------------------------------------------
// MemoryPageStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryPageStore {
    pages: Mutex<HashMap<String, Vec<StoredPage>>>,
    commits: AtomicUsize,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored version of a case, oldest first.
    pub fn versions(&self, case_number: &str) -> Vec<StoredPage> {
        self.pages
            .lock()
            .unwrap()
            .get(case_number)
            .cloned()
            .unwrap_or_default()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageStore for MemoryPageStore {
    async fn get(&self, case_number: &str) -> Result<Option<StoredPage>> {
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(case_number)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn put(&self, page: StoredPage) -> Result<()> {
        self.pages
            .lock()
            .unwrap()
            .entry(page.case_number.clone())
            .or_default()
            .push(page);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryCaseStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CaseRow {
    detail_loc: String,
    last_scrape: Option<DateTime<Utc>>,
    scrape_exempt: bool,
}

#[derive(Default)]
struct CaseInner {
    cases: BTreeMap<String, CaseRow>,
    versions: Vec<ScrapeVersion>,
    events: Vec<ScrapeEvent>,
}

/// In-memory case table. Builder pattern: `.with_case()`, `.with_exempt_case()`.
#[derive(Default)]
pub struct MemoryCaseStore {
    inner: Mutex<CaseInner>,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_case(self, case_number: &str, detail_loc: &str) -> Self {
        self.insert(case_number, detail_loc, false);
        self
    }

    pub fn with_exempt_case(self, case_number: &str, detail_loc: &str) -> Self {
        self.insert(case_number, detail_loc, true);
        self
    }

    fn insert(&self, case_number: &str, detail_loc: &str, scrape_exempt: bool) {
        self.inner.lock().unwrap().cases.insert(
            case_number.to_string(),
            CaseRow {
                detail_loc: detail_loc.to_string(),
                last_scrape: None,
                scrape_exempt,
            },
        );
    }

    pub fn versions(&self, case_number: &str) -> Vec<ScrapeVersion> {
        self.inner
            .lock()
            .unwrap()
            .versions
            .iter()
            .filter(|v| v.case_number == case_number)
            .cloned()
            .collect()
    }

    pub fn events(&self, case_number: &str) -> Vec<ScrapeEvent> {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|e| e.case_number == case_number)
            .cloned()
            .collect()
    }

    pub fn last_scrape(&self, case_number: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .unwrap()
            .cases
            .get(case_number)
            .and_then(|row| row.last_scrape)
    }

    fn unscraped(inner: &CaseInner, excluded: &HashSet<String>) -> Vec<UnscrapedCase> {
        inner
            .cases
            .iter()
            .filter(|(case_number, row)| {
                row.last_scrape.is_none() && !row.scrape_exempt && !excluded.contains(*case_number)
            })
            .map(|(case_number, row)| UnscrapedCase {
                case_number: case_number.clone(),
                detail_loc: row.detail_loc.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl CaseStore for MemoryCaseStore {
    async fn record_scrape(&self, audit: &ScrapeAudit) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if audit.event.version_id != audit.version.version_id {
            bail!(
                "scrape event references version {} which was not inserted",
                audit.event.version_id
            );
        }
        if inner
            .versions
            .iter()
            .any(|v| v.version_id == audit.version.version_id)
        {
            bail!("duplicate version id {}", audit.version.version_id);
        }
        inner.versions.push(audit.version.clone());
        inner.events.push(audit.event.clone());
        if let Some(row) = inner.cases.get_mut(&audit.event.case_number) {
            row.last_scrape = Some(audit.event.timestamp);
        }
        Ok(())
    }

    async fn detail_loc(&self, case_number: &str) -> Result<Option<String>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .cases
            .get(case_number)
            .map(|row| row.detail_loc.clone()))
    }

    async fn count_unscraped(&self, excluded: &HashSet<String>) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::unscraped(&inner, excluded).len() as u64)
    }

    async fn unscraped_batch(
        &self,
        after: Option<&str>,
        limit: i64,
        excluded: &HashSet<String>,
    ) -> Result<Vec<UnscrapedCase>> {
        let inner = self.inner.lock().unwrap();
        Ok(Self::unscraped(&inner, excluded)
            .into_iter()
            .filter(|case| after.map_or(true, |after| case.case_number.as_str() > after))
            .take(limit.max(0) as usize)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryFailureLog
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryFailureLog {
    entries: Mutex<HashMap<String, String>>,
    writes: AtomicUsize,
}

impl MemoryFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure(self, case_number: &str, description: &str) -> Self {
        self.entries
            .lock()
            .unwrap()
            .insert(case_number.to_string(), description.to_string());
        self
    }

    pub fn get(&self, case_number: &str) -> Option<String> {
        self.entries.lock().unwrap().get(case_number).cloned()
    }

    /// Total `record` calls, including overwrites.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FailureLog for MemoryFailureLog {
    async fn record(&self, case_number: &str, description: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.entries
            .lock()
            .unwrap()
            .insert(case_number.to_string(), description.to_string());
        Ok(())
    }

    async fn case_numbers(&self) -> Result<HashSet<String>> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// MemoryLiveness
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryLiveness {
    records: Mutex<HashMap<String, LivenessRecord>>,
}

impl MemoryLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, record: LivenessRecord) -> Self {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
        self
    }

    pub fn current(&self, id: &str) -> Option<LivenessRecord> {
        self.records.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl LivenessTable for MemoryLiveness {
    async fn get(&self, id: &str) -> Result<Option<LivenessRecord>> {
        Ok(self.current(id))
    }

    async fn put(&self, record: &LivenessRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.lock().unwrap().remove(id);
        Ok(())
    }
}
