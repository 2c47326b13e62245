//! Response classifier.
//!
//! Maps one portal response plus the case's counters to a [`Verdict`]. Pure
//! apart from the counter mutation: failure logging and storage are done by
//! the caller.

use std::sync::LazyLock;

use regex::Regex;

use casesearch_common::CaseItem;

use crate::outcome::{FailureKind, TransientKind, Verdict};
use crate::sanity::{check_scrape_sanity, SanityViolation};
use crate::traits::PortalResponse;

/// Shown when the portal refuses to display a case at all.
static RE_RESULTS_LIMITED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<span class="error">\s*<br>CaseSearch will only display results"#).unwrap()
});

const PORTAL_TIMEOUT_MARKER: &str = "Sorry, but your query has timed out after 2 minute";

/// Retry limits for one scrape attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub query_error_limit: u32,
    pub query_timeouts_limit: u32,
}

/// Decide what to do with `response`. First matching rule wins.
pub fn classify_response(
    item: &mut CaseItem,
    response: &PortalResponse,
    limits: &Limits,
    auth_target: &str,
) -> Verdict {
    match response.status {
        200 => classify_ok(item, &response.text, limits),
        500 => {
            item.error_count += 1;
            if item.error_count >= limits.query_error_limit {
                fail(FailureKind::Error500LimitReached)
            } else {
                Verdict::Retry(TransientKind::ServerError)
            }
        }
        302 if response.header("location") == Some(auth_target) => Verdict::ExpiredSession,
        status => {
            item.error_count += 1;
            if item.error_count >= limits.query_error_limit {
                Verdict::Fail {
                    kind: FailureKind::UnknownError,
                    detail: format!(
                        "Received unexpected response: code = {status}, body = {}",
                        response.text
                    ),
                }
            } else {
                Verdict::Retry(TransientKind::UnexpectedStatus)
            }
        }
    }
}

fn classify_ok(item: &mut CaseItem, html: &str, limits: &Limits) -> Verdict {
    if RE_RESULTS_LIMITED.is_match(html) {
        // Never remediated by asking again.
        item.error_count += 1;
        return fail(FailureKind::NotFound);
    }

    if html.contains(PORTAL_TIMEOUT_MARKER) {
        item.timeout_count += 1;
        return if item.timeout_count >= limits.query_timeouts_limit {
            fail(FailureKind::TimeoutLimitReached)
        } else {
            Verdict::Retry(TransientKind::PortalTimeout)
        };
    }

    match check_scrape_sanity(&item.case_number, html) {
        Ok(()) => Verdict::Store,
        Err(SanityViolation::ExpiredSession) => Verdict::ExpiredSession,
        Err(SanityViolation::Failed(kind)) => {
            item.error_count += 1;
            fail(kind)
        }
    }
}

fn fail(kind: FailureKind) -> Verdict {
    Verdict::Fail {
        kind,
        detail: kind.description().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTH: &str = "http://portal.test/inquiry-index.jsp";

    fn limits() -> Limits {
        Limits {
            query_error_limit: 3,
            query_timeouts_limit: 2,
        }
    }

    fn detail_page(case_number: &str) -> String {
        format!(
            "<html><body><h1>Case Information</h1><p>Case Number: {case_number}</p>{}</body></html>",
            "<td>filler</td>".repeat(100)
        )
    }

    #[test]
    fn valid_detail_page_is_stored() {
        let mut item = CaseItem::new("24-C-21-001234", "loc");
        let response = PortalResponse::new(200, detail_page("24 C 21 001234"));
        assert_eq!(classify_response(&mut item, &response, &limits(), AUTH), Verdict::Store);
        assert_eq!(item.error_count, 0);
    }

    #[test]
    fn server_errors_retry_until_limit() {
        let mut item = CaseItem::new("X", "loc");
        let response = PortalResponse::new(500, "boom");
        assert_eq!(
            classify_response(&mut item, &response, &limits(), AUTH),
            Verdict::Retry(TransientKind::ServerError)
        );
        assert_eq!(
            classify_response(&mut item, &response, &limits(), AUTH),
            Verdict::Retry(TransientKind::ServerError)
        );
        match classify_response(&mut item, &response, &limits(), AUTH) {
            Verdict::Fail { kind, .. } => assert_eq!(kind, FailureKind::Error500LimitReached),
            other => panic!("expected Fail, got {other:?}"),
        }
        assert_eq!(item.error_count, 3);
    }

    #[test]
    fn redirect_to_auth_page_is_expired_session_and_not_counted() {
        let mut item = CaseItem::new("X", "loc");
        let response = PortalResponse::new(302, "").with_header("Location", AUTH);
        assert_eq!(
            classify_response(&mut item, &response, &limits(), AUTH),
            Verdict::ExpiredSession
        );
        assert_eq!(item.error_count, 0);
    }

    #[test]
    fn redirect_elsewhere_is_an_unknown_status() {
        let mut item = CaseItem::new("X", "loc");
        let response = PortalResponse::new(302, "").with_header("Location", "http://elsewhere/");
        assert_eq!(
            classify_response(&mut item, &response, &limits(), AUTH),
            Verdict::Retry(TransientKind::UnexpectedStatus)
        );
        assert_eq!(item.error_count, 1);
    }

    #[test]
    fn unknown_status_detail_includes_code_and_body() {
        let mut item = CaseItem::new("X", "loc");
        item.error_count = 2;
        let response = PortalResponse::new(403, "forbidden");
        match classify_response(&mut item, &response, &limits(), AUTH) {
            Verdict::Fail { kind, detail } => {
                assert_eq!(kind, FailureKind::UnknownError);
                assert_eq!(detail, "Received unexpected response: code = 403, body = forbidden");
            }
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn results_limited_page_fails_immediately() {
        let mut item = CaseItem::new("X", "loc");
        let body = r#"<span class="error">
            <br>CaseSearch will only display results that match"#;
        match classify_response(&mut item, &PortalResponse::new(200, body), &limits(), AUTH) {
            Verdict::Fail { kind, .. } => assert_eq!(kind, FailureKind::NotFound),
            other => panic!("expected Fail, got {other:?}"),
        }
        assert_eq!(item.error_count, 1);
    }

    #[test]
    fn portal_timeouts_count_separately() {
        let mut item = CaseItem::new("X", "loc");
        let response = PortalResponse::new(
            200,
            "Sorry, but your query has timed out after 2 minutes.",
        );
        assert_eq!(
            classify_response(&mut item, &response, &limits(), AUTH),
            Verdict::Retry(TransientKind::PortalTimeout)
        );
        match classify_response(&mut item, &response, &limits(), AUTH) {
            Verdict::Fail { kind, .. } => assert_eq!(kind, FailureKind::TimeoutLimitReached),
            other => panic!("expected Fail, got {other:?}"),
        }
        assert_eq!(item.timeout_count, 2);
        assert_eq!(item.error_count, 0);
    }

    #[test]
    fn sanity_failure_counts_an_error() {
        let mut item = CaseItem::new("X", "loc");
        let response = PortalResponse::new(200, "y".repeat(1500));
        match classify_response(&mut item, &response, &limits(), AUTH) {
            Verdict::Fail { kind, detail } => {
                assert_eq!(kind, FailureKind::NoCaseNumberFound);
                assert_eq!(detail, FailureKind::NoCaseNumberFound.description());
            }
            other => panic!("expected Fail, got {other:?}"),
        }
        assert_eq!(item.error_count, 1);
    }

    #[test]
    fn terms_page_is_expired_session() {
        let mut item = CaseItem::new("X", "loc");
        let response = PortalResponse::new(
            200,
            "Acceptance of the following agreement is required to use CaseSearch",
        );
        assert_eq!(
            classify_response(&mut item, &response, &limits(), AUTH),
            Verdict::ExpiredSession
        );
        assert_eq!(item.error_count, 0);
    }
}
