// tests/pipeline_lifecycle.rs
//
// Coordinator start/drain/stop on a real clock with one-second buckets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cryptopulse_ingest::ingest::config::SourceConfig;
use cryptopulse_ingest::{
    Coordinator, DurableStore, Entity, FetchError, GovernorError, Grant, Lifecycle, Observation,
    PipelineConfig, PipelineError, QuarantineReason, SourceAdapter, ValueKind,
};

/// Reports one price per lag, stamped `now - lag` seconds, on every poll.
struct Live {
    lags_secs: &'static [i64],
    calls: AtomicUsize,
}

#[async_trait]
impl SourceAdapter for Live {
    fn id(&self) -> &str {
        "live"
    }

    async fn fetch(
        &self,
        entity: &Entity,
        _since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        Ok(self
            .lags_secs
            .iter()
            .map(|lag| {
                Observation::new(
                    "live",
                    &entity.symbol,
                    now - chrono::Duration::seconds(*lag),
                    ValueKind::Price,
                    42.0,
                )
            })
            .collect())
    }
}

fn live() -> Arc<dyn SourceAdapter> {
    lagged(&[0])
}

fn lagged(lags_secs: &'static [i64]) -> Arc<dyn SourceAdapter> {
    Arc::new(Live {
        lags_secs,
        calls: AtomicUsize::new(0),
    })
}

fn config(width_secs: u64, grace_secs: u64) -> PipelineConfig {
    PipelineConfig {
        entities: vec![Entity::new("BTC")],
        bucket_width_secs: width_secs,
        grace_window_secs: Some(grace_secs),
        merge_tick_ms: 50,
        ..PipelineConfig::default()
    }
}

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn drain_persists_open_buckets_before_stopping() {
    let store = DurableStore::open_temporary().unwrap();
    let c = Coordinator::new(config(1, 0), vec![live()], store.clone());
    assert_eq!(c.lifecycle(), Lifecycle::Idle);

    c.start().unwrap();
    assert_eq!(c.lifecycle(), Lifecycle::Running);
    eventually("first observation", || c.health().open_buckets > 0 || store.stats().records > 0).await;

    let report = c.drain().await.unwrap();
    assert!(report.graceful);
    assert_eq!(report.stashed, 0);
    assert_eq!(c.lifecycle(), Lifecycle::Stopped);

    let stats = store.stats();
    assert_eq!(stats.records, 1);
    assert_eq!(stats.pending, 0);
    let page = store.read_range("BTC", None, None, None, 10).unwrap();
    assert_eq!(page.records[0].price, Some(42.0));
    assert_eq!(c.health().records_written, 1);
}

#[tokio::test]
async fn hard_stop_stashes_open_buckets_for_the_next_start() {
    let store = DurableStore::open_temporary().unwrap();
    let first = Coordinator::new(config(3600, 3600), vec![live()], store.clone());
    first.start().unwrap();
    eventually("bucket opened", || first.health().open_buckets > 0).await;

    let report = first.stop(Duration::from_millis(300)).await.unwrap();
    assert!(!report.graceful);
    assert_eq!(report.stashed, 1);
    assert_eq!(store.stats().pending, 1);
    assert_eq!(store.stats().records, 0);

    let second = Coordinator::new(config(3600, 3600), vec![live()], store.clone());
    second.start().unwrap();
    assert_eq!(store.stats().pending, 0);
    eventually("restored bucket", || second.health().open_buckets > 0).await;

    let report = second.stop(Duration::from_millis(300)).await.unwrap();
    assert!(!report.graceful);
    assert!(report.stashed >= 1);
}

#[tokio::test]
async fn lifecycle_transitions_are_enforced() {
    let c = Coordinator::new(config(1, 0), vec![live()], DurableStore::open_temporary().unwrap());

    assert!(matches!(
        c.drain().await,
        Err(PipelineError::WrongState(Lifecycle::Idle, Lifecycle::Running))
    ));

    c.start().unwrap();
    assert!(matches!(
        c.start(),
        Err(PipelineError::WrongState(Lifecycle::Running, Lifecycle::Idle))
    ));

    c.drain().await.unwrap();
    assert!(matches!(
        c.start(),
        Err(PipelineError::WrongState(Lifecycle::Stopped, Lifecycle::Idle))
    ));
    assert!(c.stop(Duration::from_secs(1)).await.is_err());
}

#[tokio::test]
async fn unconfigured_adapters_get_the_default_rate_limit() {
    let c = Coordinator::new(config(1, 0), vec![live()], DurableStore::open_temporary().unwrap());
    for _ in 0..SourceConfig::DEFAULT_BUCKET_CAPACITY {
        assert_eq!(c.governor().acquire("live"), Ok(Grant::Granted));
    }
    assert!(matches!(
        c.governor().acquire("live"),
        Err(GovernorError::Throttled { .. })
    ));
}

#[tokio::test]
async fn storage_exhaustion_quarantines_contributors_and_keeps_the_record() {
    let mut cfg = config(1, 0);
    cfg.retry.store_write_attempts = 1;
    cfg.retry.store_backoff_ms = 5;
    let store = DurableStore::open_temporary().unwrap();
    let c = Coordinator::new(cfg, vec![live()], store.clone());

    store.fail_next_writes(u32::MAX);
    c.start().unwrap();
    eventually("storage backlog", || c.health().storage_backlog > 0).await;
    assert_eq!(
        c.governor().quarantine_reason("live"),
        Some(QuarantineReason::StorageFailure)
    );
    assert_eq!(store.stats().records, 0);

    // Storage recovers; the backlog drains on the next tick.
    store.fail_next_writes(0);
    eventually("backlog drained", || c.health().storage_backlog == 0).await;
    assert_eq!(store.stats().records, 1);
    // Quarantine stays until an operator lifts it.
    assert!(c.governor().quarantine_reason("live").is_some());
    assert!(c.reset_source("live"));
    assert_eq!(c.governor().quarantine_reason("live"), None);
    assert!(!c.reset_source("ghost"));

    let report = c.drain().await.unwrap();
    assert!(report.graceful);
}

#[tokio::test]
async fn failed_write_holds_back_later_buckets_of_the_same_entity() {
    // Buckets t-1 and t both close before the second tick at +3s.
    let mut cfg = config(1, 1);
    cfg.merge_tick_ms = 3000;
    cfg.retry.store_write_attempts = 1;
    let store = DurableStore::open_temporary().unwrap();
    let c = Coordinator::new(cfg, vec![lagged(&[1, 0])], store.clone());

    store.fail_next_writes(1);
    c.start().unwrap();
    eventually("storage backlog", || c.health().storage_backlog > 0).await;
    // The older bucket failed, so the newer one waits behind it unwritten.
    assert_eq!(c.health().storage_backlog, 2);
    assert_eq!(store.stats().records, 0);

    eventually("backlog drained", || c.health().storage_backlog == 0).await;
    let page = store.read_range("BTC", None, None, None, 10).unwrap();
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[1].time_bucket, page.records[0].time_bucket + 1);
    assert_eq!(c.health().records_written, 2);

    c.drain().await.unwrap();
}
