//! Per-case scrape loop against scripted portal sessions and in-memory stores.

use std::sync::Arc;

use casesearch_scraper::store::gunzip;
use casesearch_scraper::testing::{
    detail_page, expired_session_redirect, test_scraper_config, MemoryCaseStore,
    MemoryFailureLog, MemoryPageStore, ScriptedSessionFactory, Step,
};
use casesearch_common::CaseItem;
use casesearch_scraper::{
    FailureKind, RequestError, ScrapeError, ScrapeOptions, ScrapeOutcome, Scraper,
    SessionFactory, TransientKind,
};

const CASE: &str = "24-C-21-001234";

struct Rig {
    pages: Arc<MemoryPageStore>,
    cases: Arc<MemoryCaseStore>,
    failures: Arc<MemoryFailureLog>,
    scraper: Scraper,
}

fn rig(error_limit: u32, timeout_limit: u32) -> Rig {
    let pages = Arc::new(MemoryPageStore::new());
    let cases = Arc::new(MemoryCaseStore::new().with_case(CASE, "ODYCIVIL"));
    let failures = Arc::new(MemoryFailureLog::new());
    let scraper = Scraper::new(
        test_scraper_config(error_limit, timeout_limit),
        pages.clone(),
        cases.clone(),
        failures.clone(),
    );
    Rig {
        pages,
        cases,
        failures,
        scraper,
    }
}

fn options() -> ScrapeOptions {
    ScrapeOptions {
        check_before_store: true,
        log_failures: true,
    }
}

async fn scrape(rig: &Rig, factory: &ScriptedSessionFactory) -> Result<(), ScrapeError> {
    let mut session = factory.create().unwrap();
    rig.scraper
        .scrape_case(&mut session, CASE, "ODYCIVIL", options())
        .await
}

#[tokio::test]
async fn valid_page_is_stored_once_with_audit_rows() {
    let rig = rig(5, 5);
    let factory = ScriptedSessionFactory::new();

    scrape(&rig, &factory).await.unwrap();

    let versions = rig.pages.versions(CASE);
    assert_eq!(versions.len(), 1);
    assert_eq!(gunzip(&versions[0].body).unwrap(), detail_page(CASE));
    assert_eq!(rig.cases.versions(CASE).len(), 1);

    let events = rig.cases.events(CASE);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].version_id, rig.cases.versions(CASE)[0].version_id);
    assert!(events[0].duration_secs.is_some());
    assert!(rig.cases.last_scrape(CASE).is_some());
    assert_eq!(factory.posts(CASE), 1);
}

#[tokio::test]
async fn server_errors_up_to_limit_fail_and_log_once() {
    let rig = rig(5, 5);
    let mut factory = ScriptedSessionFactory::new();
    for _ in 0..5 {
        factory = factory.respond(CASE, 500, "Internal Server Error");
    }

    let err = scrape(&rig, &factory).await.unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::Error500LimitReached));
    assert_eq!(err.html(), Some("Internal Server Error"));
    assert_eq!(factory.posts(CASE), 5);
    assert_eq!(rig.failures.writes(), 1);
    assert_eq!(
        rig.failures.get(CASE).as_deref(),
        Some("Reached 500 error limit")
    );
    assert!(rig.pages.versions(CASE).is_empty());
}

#[tokio::test]
async fn server_errors_below_limit_recover_without_logging() {
    let rig = rig(5, 5);
    let mut factory = ScriptedSessionFactory::new();
    for _ in 0..4 {
        factory = factory.respond(CASE, 500, "Internal Server Error");
    }

    scrape(&rig, &factory).await.unwrap();

    assert_eq!(factory.posts(CASE), 5);
    assert_eq!(rig.failures.writes(), 0);
    assert_eq!(rig.pages.versions(CASE).len(), 1);
}

#[tokio::test]
async fn expired_session_renews_without_counting() {
    // A single counted error would fail the case.
    let rig = rig(1, 1);
    let factory = ScriptedSessionFactory::new().on_case(
        CASE,
        [
            Step::Respond(expired_session_redirect()),
            Step::Respond(expired_session_redirect()),
            Step::Respond(expired_session_redirect()),
        ],
    );

    scrape(&rig, &factory).await.unwrap();

    assert_eq!(factory.renewals(), 3);
    assert_eq!(factory.posts(CASE), 4);
    assert_eq!(rig.failures.writes(), 0);
}

#[tokio::test]
async fn terms_page_renews_session() {
    let rig = rig(1, 1);
    let factory = ScriptedSessionFactory::new().respond(
        CASE,
        200,
        "Acceptance of the following agreement is required",
    );

    scrape(&rig, &factory).await.unwrap();

    assert_eq!(factory.renewals(), 1);
    assert_eq!(rig.pages.versions(CASE).len(), 1);
}

#[tokio::test]
async fn request_timeouts_up_to_limit_fail_without_body() {
    let rig = rig(5, 3);
    let factory = ScriptedSessionFactory::new()
        .timeout(CASE)
        .timeout(CASE)
        .timeout(CASE);

    let err = scrape(&rig, &factory).await.unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::TimeoutLimitReached));
    assert!(err.html().is_none());
    assert_eq!(rig.failures.get(CASE).as_deref(), Some("Reached timeout limit"));
    assert_eq!(rig.failures.writes(), 1);
}

#[tokio::test]
async fn request_timeouts_below_limit_recover() {
    let rig = rig(5, 3);
    let factory = ScriptedSessionFactory::new().timeout(CASE).timeout(CASE);

    scrape(&rig, &factory).await.unwrap();

    assert_eq!(factory.posts(CASE), 3);
    assert_eq!(rig.failures.writes(), 0);
}

#[tokio::test]
async fn request_timeout_is_transient_until_the_limit() {
    let rig = rig(5, 2);
    let mut item = CaseItem::new(CASE, "ODYCIVIL");

    let first = rig
        .scraper
        .handle_request_timeout(&mut item, options())
        .await
        .unwrap();
    assert!(matches!(
        first,
        ScrapeOutcome::TransientError(TransientKind::RequestTimeout)
    ));
    assert_eq!(rig.failures.writes(), 0);

    let second = rig
        .scraper
        .handle_request_timeout(&mut item, options())
        .await
        .unwrap();
    let ScrapeOutcome::PermanentError(failure) = second else {
        panic!("expected permanent failure, got {second:?}");
    };
    assert_eq!(failure.kind, FailureKind::TimeoutLimitReached);
    assert!(failure.html.is_none());
    assert_eq!(item.timeout_count, 2);
    assert_eq!(item.error_count, 0);
    assert_eq!(rig.failures.writes(), 1);
}

#[tokio::test]
async fn results_limited_page_fails_on_first_response() {
    let rig = rig(5, 5);
    let body = r#"<span class="error"><br>CaseSearch will only display results for..."#;
    let factory = ScriptedSessionFactory::new().respond(CASE, 200, body);

    let err = scrape(&rig, &factory).await.unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::NotFound));
    assert_eq!(err.html(), Some(body));
    assert_eq!(factory.posts(CASE), 1);
    assert_eq!(rig.failures.get(CASE).as_deref(), Some("Case details not found"));
}

#[tokio::test]
async fn unexpected_status_detail_is_logged_verbatim() {
    let rig = rig(2, 5);
    let factory = ScriptedSessionFactory::new()
        .respond(CASE, 404, "gone")
        .respond(CASE, 404, "gone");

    let err = scrape(&rig, &factory).await.unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::UnknownError));
    assert_eq!(
        rig.failures.get(CASE).as_deref(),
        Some("Received unexpected response: code = 404, body = gone")
    );
}

#[tokio::test]
async fn failure_logging_can_be_disabled() {
    let rig = rig(1, 1);
    let factory = ScriptedSessionFactory::new().respond(CASE, 500, "boom");
    let mut session = factory.create().unwrap();

    let err = rig
        .scraper
        .scrape_case(
            &mut session,
            CASE,
            "ODYCIVIL",
            ScrapeOptions {
                check_before_store: true,
                log_failures: false,
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Some(FailureKind::Error500LimitReached));
    assert_eq!(rig.failures.writes(), 0);
}

#[tokio::test]
async fn transport_errors_propagate() {
    let rig = rig(5, 5);
    let factory = ScriptedSessionFactory::new()
        .on_case(CASE, [Step::Transport("connection reset".into())]);

    let err = scrape(&rig, &factory).await.unwrap_err();

    assert!(matches!(
        err,
        ScrapeError::Request(RequestError::Transport(_))
    ));
    assert_eq!(rig.failures.writes(), 0);
}

#[tokio::test]
async fn rescraping_identical_content_writes_nothing_new() {
    let rig = rig(5, 5);
    let factory = ScriptedSessionFactory::new();

    scrape(&rig, &factory).await.unwrap();
    scrape(&rig, &factory).await.unwrap();

    assert_eq!(rig.pages.versions(CASE).len(), 1);
    assert_eq!(rig.cases.events(CASE).len(), 1);
}

#[tokio::test]
async fn changed_content_writes_a_second_version() {
    let rig = rig(5, 5);
    let changed = format!("{}<p>New docket entry</p>", detail_page(CASE));
    let factory = ScriptedSessionFactory::new();

    scrape(&rig, &factory).await.unwrap();
    let factory = factory.respond(CASE, 200, &changed);
    scrape(&rig, &factory).await.unwrap();

    let versions = rig.cases.versions(CASE);
    assert_eq!(versions.len(), 2);
    assert_ne!(versions[0].sha256, versions[1].sha256);
    assert_eq!(gunzip(&rig.pages.versions(CASE)[1].body).unwrap(), changed);
}

#[tokio::test]
async fn specific_case_uses_stored_detail_loc() {
    let rig = rig(5, 5);
    let factory = ScriptedSessionFactory::new();

    rig.scraper
        .scrape_specific_case(&factory, CASE)
        .await
        .unwrap();

    assert_eq!(rig.pages.versions(CASE)[0].detail_loc, "ODYCIVIL");
    assert_eq!(factory.renewals(), 1);
}

#[tokio::test]
async fn specific_case_unknown_to_store_is_an_error() {
    let rig = rig(5, 5);
    let factory = ScriptedSessionFactory::new();

    let err = rig
        .scraper
        .scrape_specific_case(&factory, "99-X-00-000000")
        .await
        .unwrap_err();

    assert!(matches!(err, ScrapeError::Other(_)));
    assert!(err.to_string().contains("99-X-00-000000"));
    assert_eq!(factory.posts("99-X-00-000000"), 0);
}
