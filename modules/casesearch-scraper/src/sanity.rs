// Detail-page sanity checks. A 200 response only counts as a scrape when it
// passes all of these.

use regex::{Regex, RegexBuilder};

use crate::outcome::FailureKind;

const TERMS_MARKER: &str = "Acceptance of the following agreement is required";
const UNEXPECTED_ERROR_MARKER: &str = "An unexpected error occurred";
const SEARCH_RESULTS_MARKER: &str = "Note: Initial Sort is by Last Name.";

/// Bodies shorter than this (in characters) are never real detail pages.
pub const MIN_BODY_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanityViolation {
    /// The portal wants the terms re-accepted: the session is dead.
    ExpiredSession,
    Failed(FailureKind),
}

/// Run the checks in order; the first violation wins.
pub fn check_scrape_sanity(case_number: &str, html: &str) -> Result<(), SanityViolation> {
    if html.contains(TERMS_MARKER) {
        return Err(SanityViolation::ExpiredSession);
    }
    if html.chars().count() < MIN_BODY_CHARS {
        return Err(SanityViolation::Failed(FailureKind::TooShort));
    }
    if html.contains(UNEXPECTED_ERROR_MARKER) {
        return Err(SanityViolation::Failed(FailureKind::UnexpectedError));
    }
    if html.contains(SEARCH_RESULTS_MARKER) {
        return Err(SanityViolation::Failed(FailureKind::SearchResultsPage));
    }
    if body_mentions_case_number(case_number, html) {
        Ok(())
    } else {
        Err(SanityViolation::Failed(FailureKind::NoCaseNumberFound))
    }
}

/// The portal displays case numbers with dashes and/or spaces between their
/// parts, in either case. Any run of `-` or ` ` is allowed between
/// consecutive characters.
pub fn body_mentions_case_number(case_number: &str, html: &str) -> bool {
    match case_number_pattern(case_number) {
        Some(re) => re.is_match(html),
        None => false,
    }
}

fn case_number_pattern(case_number: &str) -> Option<Regex> {
    let parts: Vec<String> = case_number
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| regex::escape(&c.to_string()))
        .collect();
    if parts.is_empty() {
        return None;
    }
    RegexBuilder::new(&parts.join(r"[\- ]*"))
        .case_insensitive(true)
        .build()
        .ok()
}
