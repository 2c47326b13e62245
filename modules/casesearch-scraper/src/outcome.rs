//! Outcome taxonomy shared by the classifier, the scrape loop, and the harness.

use std::fmt;

use thiserror::Error;

/// Why a case was given up on. Every kind here is terminal for the current
/// scrape attempt and is written to the failure log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The portal said the case does not exist. Never self-heals.
    NotFound,
    TooShort,
    UnexpectedError,
    /// Got a search results listing instead of a detail page.
    SearchResultsPage,
    NoCaseNumberFound,
    /// Repeated non-200, non-500 responses.
    UnknownError,
    Error500LimitReached,
    TimeoutLimitReached,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::TooShort => "too_short",
            Self::UnexpectedError => "unexpected_error",
            Self::SearchResultsPage => "search_results_page",
            Self::NoCaseNumberFound => "no_case_number_found",
            Self::UnknownError => "unknown_error",
            Self::Error500LimitReached => "error_500_limit_reached",
            Self::TimeoutLimitReached => "timeout_limit_reached",
        }
    }

    /// Human description written to the failure log.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotFound => "Case details not found",
            Self::TooShort => "Response body too short",
            Self::UnexpectedError => "Portal reported an unexpected error",
            Self::SearchResultsPage => "Received search results page instead of case details",
            Self::NoCaseNumberFound => "Case number not found in response body",
            Self::UnknownError => "Received unexpected response",
            Self::Error500LimitReached => "Reached 500 error limit",
            Self::TimeoutLimitReached => "Reached timeout limit",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A counted failure that has not reached its limit yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientKind {
    ServerError,
    UnexpectedStatus,
    PortalTimeout,
    RequestTimeout,
}

/// What the classifier decided about one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Counter incremented, limit not reached. Request again.
    Retry(TransientKind),
    /// Renew the session and request again. Not counted.
    ExpiredSession,
    /// Passed every sanity check; persist the body.
    Store,
    /// Terminal. `detail` is what goes into the failure log.
    Fail { kind: FailureKind, detail: String },
}

/// Result of handling one response inside the scrape loop.
#[derive(Debug)]
pub enum ScrapeOutcome {
    Completed,
    ExpiredSession,
    TransientError(TransientKind),
    PermanentError(ScrapeFailure),
}

/// Terminal scrape failure. Carries the raw response body, when there was
/// one, so an operator hook can decide to store it anyway.
#[derive(Debug, Clone, Error)]
#[error("failed to scrape case {case_number}: {kind} ({detail})")]
pub struct ScrapeFailure {
    pub case_number: String,
    pub kind: FailureKind,
    pub detail: String,
    pub html: Option<String>,
}

/// Transport-level failure of a single request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    /// No response within the request timeout.
    #[error("request timed out")]
    Timeout,

    #[error("request failed: {0}")]
    Transport(String),
}

/// Everything that can end a scrape loop without completing it.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Failed(#[from] ScrapeFailure),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScrapeError {
    /// Raw body of the last response, if the failure came from a classified
    /// response.
    pub fn html(&self) -> Option<&str> {
        match self {
            Self::Failed(failure) => failure.html.as_deref(),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Failed(failure) => Some(failure.kind),
            _ => None,
        }
    }
}
