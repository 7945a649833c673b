// tests/governor_backoff.rs
use std::time::Duration;

use cryptopulse_ingest::governor::FailureVerdict;
use cryptopulse_ingest::ingest::config::RetryPolicy;
use cryptopulse_ingest::{FetchError, GovernorError, Grant, QuarantineReason, RateGovernor};

fn unavailable() -> FetchError {
    FetchError::SourceUnavailable("http 503".into())
}

fn wait_of(v: FailureVerdict) -> Duration {
    match v {
        FailureVerdict::Retry { wait } => wait,
        other => panic!("expected retry, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn waits_are_non_decreasing_up_to_the_cap() {
    let g = RateGovernor::new(RetryPolicy {
        backoff_base_ms: 1000,
        backoff_cap_secs: 30,
        jitter: 0.2,
        quarantine_after_cap_failures: 1000,
        ..RetryPolicy::default()
    });
    g.register("cg", 5, 1.0);

    let mut prev = Duration::ZERO;
    for _ in 0..15 {
        let w = wait_of(g.record_failure("cg", &FetchError::RateLimited { retry_after: None }));
        assert!(w >= prev, "{w:?} < {prev:?}");
        assert!(w <= Duration::from_secs(30));
        prev = w;
    }
    assert_eq!(prev, Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn backoff_blocks_acquire_until_it_expires() {
    let g = RateGovernor::new(RetryPolicy {
        jitter: 0.0,
        ..RetryPolicy::default()
    });
    g.register("cg", 5, 1.0);
    let w = wait_of(g.record_failure("cg", &unavailable()));
    assert_eq!(w, Duration::from_secs(1));
    assert!(matches!(g.acquire("cg"), Err(GovernorError::Throttled { .. })));
    tokio::time::advance(w).await;
    assert_eq!(g.acquire("cg"), Ok(Grant::Granted));

    g.record_success("cg");
    // Success resets the exponent.
    assert_eq!(wait_of(g.record_failure("cg", &unavailable())), Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn three_failures_at_cap_quarantine_then_probe_recovers() {
    let g = RateGovernor::new(RetryPolicy {
        backoff_base_ms: 1000,
        backoff_cap_secs: 4,
        jitter: 0.0,
        quarantine_after_cap_failures: 3,
        ..RetryPolicy::default()
    });
    g.register("cg", 5, 1.0);

    // 1s, 2s, 4s (cap #1), 4s (cap #2), then cap #3 quarantines.
    for expected in [1, 2, 4, 4] {
        assert_eq!(
            wait_of(g.record_failure("cg", &unavailable())),
            Duration::from_secs(expected)
        );
    }
    assert_eq!(
        g.record_failure("cg", &unavailable()),
        FailureVerdict::Quarantined(QuarantineReason::BackoffExhausted)
    );
    assert_eq!(
        g.acquire("cg"),
        Err(GovernorError::Quarantined {
            reason: QuarantineReason::BackoffExhausted
        })
    );

    // Probe interval defaults to the cap.
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(g.acquire("cg"), Ok(Grant::Probe));
    // Only one probe at a time.
    assert!(matches!(g.acquire("cg"), Err(GovernorError::Quarantined { .. })));

    // A failed probe re-arms the interval.
    assert!(matches!(
        g.record_failure("cg", &unavailable()),
        FailureVerdict::Quarantined(_)
    ));
    assert!(matches!(g.acquire("cg"), Err(GovernorError::Quarantined { .. })));
    tokio::time::advance(Duration::from_secs(4)).await;
    assert_eq!(g.acquire("cg"), Ok(Grant::Probe));

    g.record_success("cg");
    assert_eq!(g.quarantine_reason("cg"), None);
    assert_eq!(g.acquire("cg"), Ok(Grant::Granted));
    let h = g.snapshot();
    assert_eq!(h[0].consecutive_failures, 0);
    assert!(h[0].last_success_time.is_some());
}

#[tokio::test(start_paused = true)]
async fn storage_quarantine_survives_success_until_reset() {
    let g = RateGovernor::new(RetryPolicy::default());
    g.register("reddit", 5, 1.0);
    g.register("coingecko", 5, 1.0);

    assert!(g.quarantine("reddit", QuarantineReason::StorageFailure));
    g.record_success("reddit");
    tokio::time::advance(Duration::from_secs(3600)).await;
    assert_eq!(
        g.acquire("reddit"),
        Err(GovernorError::Quarantined {
            reason: QuarantineReason::StorageFailure
        })
    );
    assert_eq!(g.acquire("coingecko"), Ok(Grant::Granted));

    assert!(g.reset("reddit"));
    assert_eq!(g.acquire("reddit"), Ok(Grant::Granted));
    assert!(!g.quarantine("nope", QuarantineReason::Auth));
}

#[tokio::test(start_paused = true)]
async fn snapshot_reports_every_source_sorted() {
    let g = RateGovernor::new(RetryPolicy::default());
    g.register("twitter", 1, 0.1);
    g.register("coingecko", 5, 1.0);
    g.record_failure("twitter", &FetchError::AuthError("401".into()));
    g.note_cycle_failed("coingecko");

    let h = g.snapshot();
    assert_eq!(h.len(), 2);
    assert_eq!(h[0].source_id, "coingecko");
    assert_eq!(h[0].cycles_failed, 1);
    assert!(h[1].quarantined);
    assert_eq!(h[1].quarantine_reason, Some(QuarantineReason::Auth));
    assert!(h[1].last_failure_time.is_some());
}
