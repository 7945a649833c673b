//! # Pipeline coordinator
//! Wires adapters, governor, scheduler loops, the merge worker and the store,
//! and owns the `idle -> running -> draining -> stopped` lifecycle.
//!
//! Data flow:
//! `SourceLoop` (one per source x entity) --bounded mpsc--> `MergeWorker`
//! (sole owner of the `AlignmentEngine`) --> `DurableStore`.
//!
//! Shutdown:
//! - `drain()` stops new fetch attempts, lets in-flight fetches deliver,
//!   waits for every open bucket to close on its own, then flushes.
//! - `stop(timeout)` drains within `timeout`; past it, loops are aborted and
//!   the merge worker stashes open-bucket observations for the next start.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use metrics::gauge;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::align::{AlignmentEngine, ClosedBucket, IngestOutcome};
use crate::governor::{QuarantineReason, RateGovernor, SourceHealth};
use crate::ingest::config::{ConfigError, PipelineConfig, SourceConfig};
use crate::ingest::providers::build_adapters;
use crate::ingest::scheduler::SourceLoop;
use crate::ingest::types::{Observation, SourceAdapter};
use crate::sentiment::{LexiconScorer, TextScorer};
use crate::store::{DurableStore, StoreError, WriteOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Idle,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline is {0:?}, expected {1:?}")]
    WrongState(Lifecycle, Lifecycle),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub queue_depth: AtomicUsize,
    pub open_buckets: AtomicUsize,
    pub storage_backlog: AtomicUsize,
    pub records_written: AtomicU64,
    pub records_unchanged: AtomicU64,
    pub conflicts: AtomicU64,
    pub late_recorded: AtomicU64,
    pub duplicates: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub lifecycle: Lifecycle,
    pub sources: Vec<SourceHealth>,
    pub queue_depth: usize,
    pub open_buckets: usize,
    pub storage_backlog: usize,
    pub records_written: u64,
    pub conflicts: u64,
    pub late_recorded: u64,
    pub duplicates: u64,
}

/// How a shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StopReport {
    pub graceful: bool,
    pub stashed: usize,
}

struct Running {
    stop: CancellationToken,
    hard_stop: CancellationToken,
    loops: Vec<JoinHandle<()>>,
    merge: JoinHandle<usize>,
}

pub struct Coordinator {
    cfg: PipelineConfig,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    governor: Arc<RateGovernor>,
    store: DurableStore,
    counters: Arc<PipelineCounters>,
    lifecycle: Mutex<Lifecycle>,
    running: Mutex<Option<Running>>,
}

impl Coordinator {
    pub fn new(cfg: PipelineConfig, adapters: Vec<Arc<dyn SourceAdapter>>, store: DurableStore) -> Self {
        let governor = RateGovernor::from_config(&cfg);
        for a in &adapters {
            if cfg.source(a.id()).is_none() {
                governor.register(
                    a.id(),
                    SourceConfig::DEFAULT_BUCKET_CAPACITY,
                    SourceConfig::DEFAULT_REFILL_PER_SEC,
                );
            }
        }
        let store = store.with_retry(&cfg.retry);
        Self {
            cfg,
            adapters,
            governor: Arc::new(governor),
            store,
            counters: Arc::new(PipelineCounters::default()),
            lifecycle: Mutex::new(Lifecycle::Idle),
            running: Mutex::new(None),
        }
    }

    /// Opens the store at `storage_path` and builds HTTP adapters for every
    /// configured source.
    pub fn from_config(cfg: PipelineConfig) -> Result<Self, PipelineError> {
        let scorer: Arc<dyn TextScorer> = Arc::new(LexiconScorer::new());
        let adapters = build_adapters(&cfg, scorer)?;
        let store = DurableStore::open(&cfg.storage_path)?;
        Ok(Self::new(cfg, adapters, store))
    }

    pub fn store(&self) -> &DurableStore {
        &self.store
    }

    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub fn knows_source(&self, source_id: &str) -> bool {
        self.adapters.iter().any(|a| a.id() == source_id)
    }

    pub fn start(&self) -> Result<(), PipelineError> {
        {
            let mut lc = self.lifecycle.lock();
            if *lc != Lifecycle::Idle {
                return Err(PipelineError::WrongState(*lc, Lifecycle::Idle));
            }
            *lc = Lifecycle::Running;
        }

        let mut engine = AlignmentEngine::from_config(&self.cfg);
        let restored = match self.store.take_pending() {
            Ok(obs) => obs,
            Err(e) => {
                *self.lifecycle.lock() = Lifecycle::Idle;
                return Err(e.into());
            }
        };
        let restored_n = restored.len();
        for o in restored {
            engine.restore(o);
        }

        let (tx, rx) = mpsc::channel::<Observation>(self.cfg.channel_capacity);
        let stop = CancellationToken::new();
        let hard_stop = CancellationToken::new();

        let lookback = ChronoDuration::from_std(self.cfg.bucket_width() + self.cfg.grace_window())
            .unwrap_or_else(|_| ChronoDuration::seconds(600));
        let since = Utc::now() - lookback;

        let mut slots: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut loops = Vec::new();
        for adapter in &self.adapters {
            let src_cfg = self.cfg.source(adapter.id());
            let permits = src_cfg
                .map(|s| s.max_concurrent_fetches)
                .unwrap_or(SourceConfig::DEFAULT_MAX_CONCURRENT_FETCHES);
            let every = src_cfg
                .map(|s| s.poll_interval())
                .unwrap_or(Duration::from_secs(SourceConfig::DEFAULT_POLL_INTERVAL_SECS));
            let sem = slots
                .entry(adapter.id().to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(permits)))
                .clone();
            for entity in &self.cfg.entities {
                let lp = SourceLoop::new(
                    adapter.clone(),
                    entity.clone(),
                    self.governor.clone(),
                    sem.clone(),
                    tx.clone(),
                    stop.clone(),
                )
                .with_poll_interval(every)
                .with_since(Some(since));
                loops.push(lp.spawn());
            }
        }
        // Only the loops hold senders; the worker sees end-of-input once they exit.
        drop(tx);

        let worker = MergeWorker {
            engine,
            rx,
            store: self.store.clone(),
            governor: self.governor.clone(),
            counters: self.counters.clone(),
            backlog: Vec::new(),
            tick: self.cfg.merge_tick(),
            hard_stop: hard_stop.clone(),
        };
        let merge = tokio::spawn(worker.run());

        tracing::info!(
            target: "pipeline",
            sources = self.adapters.len(),
            entities = self.cfg.entities.len(),
            loops = loops.len(),
            restored = restored_n,
            "pipeline started"
        );
        *self.running.lock() = Some(Running {
            stop,
            hard_stop,
            loops,
            merge,
        });
        Ok(())
    }

    /// Graceful shutdown with no deadline.
    pub async fn drain(&self) -> Result<StopReport, PipelineError> {
        self.shutdown(None).await
    }

    /// Drain bounded by `timeout`, then hard shutdown.
    pub async fn stop(&self, timeout: Duration) -> Result<StopReport, PipelineError> {
        self.shutdown(Some(timeout)).await
    }

    async fn shutdown(&self, timeout: Option<Duration>) -> Result<StopReport, PipelineError> {
        let Some(mut running) = self.running.lock().take() else {
            let lc = self.lifecycle();
            return Err(PipelineError::WrongState(lc, Lifecycle::Running));
        };
        *self.lifecycle.lock() = Lifecycle::Draining;
        tracing::info!(target: "pipeline", ?timeout, "draining pipeline");
        running.stop.cancel();

        let graceful_wait = async {
            for h in running.loops.iter_mut() {
                let _ = h.await;
            }
            (&mut running.merge).await.ok()
        };
        let finished = match timeout {
            None => Some(graceful_wait.await),
            Some(t) => tokio::time::timeout(t, graceful_wait).await.ok(),
        };

        let report = match finished {
            Some(stashed) => StopReport {
                graceful: true,
                stashed: stashed.unwrap_or(0),
            },
            None => {
                tracing::warn!(target: "pipeline", "drain timed out, forcing shutdown");
                running.hard_stop.cancel();
                for h in &running.loops {
                    h.abort();
                }
                let stashed = (&mut running.merge).await.unwrap_or(0);
                StopReport {
                    graceful: false,
                    stashed,
                }
            }
        };

        *self.lifecycle.lock() = Lifecycle::Stopped;
        tracing::info!(target: "pipeline", graceful = report.graceful, stashed = report.stashed, "pipeline stopped");
        Ok(report)
    }

    pub fn health(&self) -> HealthSnapshot {
        let c = &self.counters;
        HealthSnapshot {
            lifecycle: self.lifecycle(),
            sources: self.governor.snapshot(),
            queue_depth: c.queue_depth.load(Ordering::Relaxed),
            open_buckets: c.open_buckets.load(Ordering::Relaxed),
            storage_backlog: c.storage_backlog.load(Ordering::Relaxed),
            records_written: c.records_written.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            late_recorded: c.late_recorded.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
        }
    }

    /// Manual quarantine reset. False for unknown sources.
    pub fn reset_source(&self, source_id: &str) -> bool {
        self.governor.reset(source_id)
    }
}

/// Single consumer of the observation channel and sole writer of buckets.
struct MergeWorker {
    engine: AlignmentEngine,
    rx: mpsc::Receiver<Observation>,
    store: DurableStore,
    governor: Arc<RateGovernor>,
    counters: Arc<PipelineCounters>,
    // Closed buckets not yet persisted, sorted by (entity, bucket).
    backlog: Vec<ClosedBucket>,
    tick: Duration,
    hard_stop: CancellationToken,
}

impl MergeWorker {
    /// Returns the number of observations stashed on hard stop.
    async fn run(mut self) -> usize {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inbound_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.hard_stop.cancelled() => {
                    return self.hard_shutdown().await;
                }
                msg = self.rx.recv(), if inbound_open => match msg {
                    Some(obs) => self.accept(obs),
                    None => {
                        inbound_open = false;
                        tracing::info!(
                            target: "pipeline",
                            open_buckets = self.engine.open_buckets(),
                            "fetching stopped, waiting for open buckets to close"
                        );
                    }
                },
                _ = ticker.tick() => {
                    self.close_and_persist().await;
                    if !inbound_open && self.engine.open_buckets() == 0 && self.backlog.is_empty() {
                        if let Err(e) = self.store.flush().await {
                            tracing::error!(target: "pipeline", error = %e, "final flush failed");
                        }
                        return 0;
                    }
                }
            }
        }
    }

    fn accept(&mut self, obs: Observation) {
        let depth = self.rx.len();
        self.counters.queue_depth.store(depth, Ordering::Relaxed);
        gauge!("ingest_queue_depth").set(depth as f64);

        match self.engine.ingest(obs, Utc::now()) {
            IngestOutcome::Merged => {}
            IngestOutcome::Duplicate => {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            }
            IngestOutcome::Late(late) => match self.store.record_late(&late) {
                Ok(true) => {
                    self.counters.late_recorded.fetch_add(1, Ordering::Relaxed);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(target: "pipeline", error = %e, id = %late.observation.id(), "recording late observation failed");
                }
            },
        }
        self.counters
            .open_buckets
            .store(self.engine.open_buckets(), Ordering::Relaxed);
    }

    async fn close_and_persist(&mut self) {
        let mut due = std::mem::take(&mut self.backlog);
        due.extend(self.engine.close_due(Utc::now()));
        self.counters
            .open_buckets
            .store(self.engine.open_buckets(), Ordering::Relaxed);

        // Writes per entity stay in bucket order: once one fails, later
        // buckets of that entity wait behind it in the backlog.
        due.sort_by(|a, b| {
            (a.record.entity_symbol.as_str(), a.record.time_bucket)
                .cmp(&(b.record.entity_symbol.as_str(), b.record.time_bucket))
        });
        let mut blocked: HashSet<String> = HashSet::new();

        for closed in due {
            if blocked.contains(&closed.record.entity_symbol) {
                self.backlog.push(closed);
                continue;
            }
            match self.store.write_record(&closed.record).await {
                Ok(outcome) => {
                    let c = &self.counters;
                    match outcome {
                        WriteOutcome::Inserted => c.records_written.fetch_add(1, Ordering::Relaxed),
                        WriteOutcome::Unchanged => c.records_unchanged.fetch_add(1, Ordering::Relaxed),
                        WriteOutcome::Conflict => c.conflicts.fetch_add(1, Ordering::Relaxed),
                    };
                    tracing::debug!(
                        target: "pipeline",
                        entity = %closed.record.entity_symbol,
                        bucket = closed.record.time_bucket,
                        outcome = outcome.as_str(),
                        "record persisted"
                    );
                }
                Err(e) => {
                    self.escalate(&closed, &e);
                    blocked.insert(closed.record.entity_symbol.clone());
                    self.backlog.push(closed);
                }
            }
        }
        self.counters
            .storage_backlog
            .store(self.backlog.len(), Ordering::Relaxed);
    }

    /// Storage exhaustion halts every source that fed the failed record.
    fn escalate(&self, closed: &ClosedBucket, err: &StoreError) {
        let sources = closed.record.source_ids();
        tracing::error!(
            target: "pipeline",
            entity = %closed.record.entity_symbol,
            bucket = closed.record.time_bucket,
            error = %err,
            sources = ?sources,
            "record write exhausted, quarantining contributing sources"
        );
        for s in sources {
            self.governor.quarantine(&s, QuarantineReason::StorageFailure);
        }
    }

    /// Stashes everything not yet persisted so the next start can finish it.
    async fn hard_shutdown(mut self) -> usize {
        let now = Utc::now();
        while let Ok(obs) = self.rx.try_recv() {
            if let IngestOutcome::Late(late) = self.engine.ingest(obs, now) {
                if let Err(e) = self.store.record_late(&late) {
                    tracing::error!(target: "pipeline", error = %e, "recording late observation failed");
                }
            }
        }

        let mut stash = self.engine.drain_open();
        for closed in self.backlog.drain(..) {
            stash.extend(closed.observations);
        }
        let n = match self.store.stash_pending(&stash) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(target: "pipeline", error = %e, lost = stash.len(), "stashing open buckets failed");
                0
            }
        };
        if let Err(e) = self.store.flush().await {
            tracing::error!(target: "pipeline", error = %e, "flush on hard stop failed");
        }
        self.counters.open_buckets.store(0, Ordering::Relaxed);
        tracing::warn!(target: "pipeline", stashed = n, "hard stop, open buckets stashed");
        n
    }
}
