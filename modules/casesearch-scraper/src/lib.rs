pub mod classify;
pub mod harness;
pub mod outcome;
pub mod pg;
pub mod pool;
pub mod sanity;
pub mod scraper;
pub mod session;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod traits;

pub use classify::{classify_response, Limits};
pub use harness::{DeletePermanentFailures, ErrorAction, ErrorHook, Harness, HarnessError, RunStats};
pub use outcome::{
    FailureKind, RequestError, ScrapeError, ScrapeFailure, ScrapeOutcome, TransientKind, Verdict,
};
pub use pool::{SessionGuard, SessionPool};
pub use scraper::{ScrapeOptions, Scraper, ScraperConfig};
pub use session::{HttpSession, HttpSessionFactory};
pub use store::{PageWriter, StoreResult};
pub use traits::{
    CaseStore, FailureLog, LivenessTable, PageStore, PortalResponse, PortalSession, QueueMessage,
    SessionFactory, WorkQueue,
};
