// src/ingest/scheduler.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::governor::{FailureVerdict, GovernorError, QuarantineReason, RateGovernor};
use crate::ingest::types::{Entity, FetchError, Observation, SourceAdapter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InFlight,
    Retrying,
    Succeeded,
    Failed,
}

/// One poll cycle of one (source, entity) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchTask {
    pub source_id: String,
    pub entity_symbol: String,
    pub scheduled_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub state: TaskState,
}

impl FetchTask {
    pub fn new(source_id: &str, entity_symbol: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            entity_symbol: entity_symbol.to_string(),
            scheduled_at: Utc::now(),
            attempt_count: 0,
            state: TaskState::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Succeeded { observations: usize },
    /// Retry budget exhausted; the next cycle is still scheduled.
    Failed,
    /// Quarantined during this cycle.
    Quarantined(QuarantineReason),
    /// Already quarantined; nothing attempted.
    Skipped(QuarantineReason),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub task: FetchTask,
    pub outcome: CycleOutcome,
}

fn error_class(e: &FetchError) -> &'static str {
    match e {
        FetchError::SourceUnavailable(_) => "unavailable",
        FetchError::AuthError(_) => "auth",
        FetchError::RateLimited { .. } => "rate_limited",
    }
}

/// Polling loop for one (source, entity) pair.
///
/// `stop` halts new attempts: waits are interrupted, an in-flight fetch runs
/// to completion and its observations are still delivered.
pub struct SourceLoop {
    adapter: Arc<dyn SourceAdapter>,
    entity: Entity,
    governor: Arc<RateGovernor>,
    slots: Arc<Semaphore>,
    tx: mpsc::Sender<Observation>,
    poll_interval: Duration,
    max_attempts: u32,
    since: Option<DateTime<Utc>>,
    stop: CancellationToken,
}

impl SourceLoop {
    pub fn new(
        adapter: Arc<dyn SourceAdapter>,
        entity: Entity,
        governor: Arc<RateGovernor>,
        slots: Arc<Semaphore>,
        tx: mpsc::Sender<Observation>,
        stop: CancellationToken,
    ) -> Self {
        let max_attempts = governor.policy().max_attempts.max(1);
        Self {
            adapter,
            entity,
            governor,
            slots,
            tx,
            poll_interval: Duration::from_secs(60),
            max_attempts,
            since: None,
            stop,
        }
    }

    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    /// Only observations newer than this are requested on the first cycle.
    pub fn with_since(mut self, since: Option<DateTime<Utc>>) -> Self {
        self.since = since;
        self
    }

    pub fn since(&self) -> Option<DateTime<Utc>> {
        self.since
    }

    fn source_id(&self) -> String {
        self.adapter.id().to_string()
    }

    /// Sleeps unless stopped first. False means stop was requested.
    async fn pause(&self, wait: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let source = self.source_id();
        let mut task = FetchTask::new(&source, &self.entity.symbol);
        let outcome = self.drive(&source, &mut task).await;
        match &outcome {
            CycleOutcome::Failed => {
                task.state = TaskState::Failed;
                self.governor.note_cycle_failed(&source);
                counter!("ingest_cycles_failed_total", "source" => source.clone()).increment(1);
                tracing::warn!(
                    target: "ingest",
                    source = %source,
                    entity = %self.entity.symbol,
                    attempts = task.attempt_count,
                    "poll cycle failed after retry budget"
                );
            }
            CycleOutcome::Quarantined(_) => task.state = TaskState::Failed,
            CycleOutcome::Succeeded { .. } => task.state = TaskState::Succeeded,
            CycleOutcome::Skipped(_) | CycleOutcome::Cancelled => {}
        }
        CycleReport { task, outcome }
    }

    async fn drive(&mut self, source: &str, task: &mut FetchTask) -> CycleOutcome {
        loop {
            if self.stop.is_cancelled() {
                return CycleOutcome::Cancelled;
            }

            let permit = tokio::select! {
                _ = self.stop.cancelled() => return CycleOutcome::Cancelled,
                p = self.slots.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => return CycleOutcome::Cancelled,
                },
            };

            match self.governor.acquire(source) {
                Err(GovernorError::Quarantined { reason }) => {
                    drop(permit);
                    if task.attempt_count == 0 {
                        tracing::debug!(target: "ingest", source, entity = %self.entity.symbol, %reason, "skipping quarantined source");
                        return CycleOutcome::Skipped(reason);
                    }
                    return CycleOutcome::Quarantined(reason);
                }
                Err(GovernorError::UnknownSource(_)) => {
                    tracing::error!(target: "ingest", source, "source not registered with governor");
                    return CycleOutcome::Failed;
                }
                Err(GovernorError::Throttled { wait }) => {
                    drop(permit);
                    task.attempt_count += 1;
                    counter!("ingest_throttled_total", "source" => source.to_string()).increment(1);
                    if task.attempt_count >= self.max_attempts {
                        return CycleOutcome::Failed;
                    }
                    task.state = TaskState::Retrying;
                    if !self.pause(wait).await {
                        return CycleOutcome::Cancelled;
                    }
                }
                Ok(_grant) => {
                    task.attempt_count += 1;
                    task.state = TaskState::InFlight;
                    counter!("ingest_fetch_total", "source" => source.to_string()).increment(1);
                    let t0 = std::time::Instant::now();
                    let res = self.adapter.fetch(&self.entity, self.since).await;
                    histogram!("ingest_fetch_ms", "source" => source.to_string())
                        .record(t0.elapsed().as_secs_f64() * 1_000.0);
                    drop(permit);

                    match res {
                        Ok(obs) => {
                            self.governor.record_success(source);
                            return self.deliver(source, obs).await;
                        }
                        Err(e) => {
                            counter!(
                                "ingest_fetch_errors_total",
                                "source" => source.to_string(),
                                "class" => error_class(&e)
                            )
                            .increment(1);
                            tracing::debug!(
                                target: "ingest",
                                source,
                                entity = %self.entity.symbol,
                                attempt = task.attempt_count,
                                error = %e,
                                "fetch failed"
                            );
                            match self.governor.record_failure(source, &e) {
                                FailureVerdict::Quarantined(reason) => {
                                    return CycleOutcome::Quarantined(reason)
                                }
                                FailureVerdict::Retry { wait } => {
                                    if task.attempt_count >= self.max_attempts {
                                        return CycleOutcome::Failed;
                                    }
                                    task.state = TaskState::Retrying;
                                    if !self.pause(wait).await {
                                        return CycleOutcome::Cancelled;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Sends in timestamp order; a full channel applies backpressure.
    async fn deliver(&mut self, source: &str, mut obs: Vec<Observation>) -> CycleOutcome {
        obs.sort_by_key(|o| o.timestamp);
        let n = obs.len();
        for o in obs {
            let ts = o.timestamp;
            if self.tx.send(o).await.is_err() {
                return CycleOutcome::Cancelled;
            }
            if self.since.map_or(true, |s| ts > s) {
                self.since = Some(ts);
            }
        }
        counter!("ingest_observations_total", "source" => source.to_string()).increment(n as u64);
        tracing::debug!(target: "ingest", source, entity = %self.entity.symbol, observations = n, "fetch delivered");
        CycleOutcome::Succeeded { observations: n }
    }

    /// Polls until `stop` fires. Every cycle, whatever its outcome, is
    /// followed by one poll interval.
    pub async fn run(mut self) {
        loop {
            let report = self.run_cycle().await;
            if report.outcome == CycleOutcome::Cancelled {
                break;
            }
            if !self.pause(self.poll_interval).await {
                break;
            }
        }
        tracing::debug!(target: "ingest", source = %self.source_id(), entity = %self.entity.symbol, "poll loop stopped");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
