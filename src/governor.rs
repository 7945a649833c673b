//! # Rate governor
//! Sole owner of per-source pacing state: a token bucket for proactive rate
//! limiting, exponential backoff after provider failures, and quarantine.
//!
//! All state lives behind one `parking_lot::Mutex` that is never held across
//! an `.await`. Monotonic time comes from `tokio::time::Instant` so paused-clock
//! tests drive it deterministically.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

use crate::ingest::config::{PipelineConfig, RetryPolicy};
use crate::ingest::types::FetchError;

// Every delay handed out is bounded by this, hints included.
const MAX_WAIT: Duration = Duration::from_secs(RetryPolicy::MAX_WAIT_SECS);

/// Why a source stopped being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineReason {
    /// Provider rejected credentials. Manual reset only.
    Auth,
    /// Repeated failures at the backoff cap. Probes allowed.
    BackoffExhausted,
    /// Records from this source could not be persisted. Manual reset only.
    StorageFailure,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineReason::Auth => "auth",
            QuarantineReason::BackoffExhausted => "backoff_exhausted",
            QuarantineReason::StorageFailure => "storage_failure",
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission to call the adapter once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    Granted,
    /// Single trial fetch for a backoff-quarantined source.
    Probe,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GovernorError {
    #[error("throttled for {wait:?}")]
    Throttled { wait: Duration },
    #[error("source quarantined ({reason})")]
    Quarantined { reason: QuarantineReason },
    #[error("unknown source '{0}'")]
    UnknownSource(String),
}

/// What the scheduler should do after a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    Retry { wait: Duration },
    Quarantined(QuarantineReason),
}

#[derive(Debug, Clone)]
struct Quarantine {
    reason: QuarantineReason,
    since: Instant,
    probe_in_flight: bool,
}

#[derive(Debug, Clone)]
struct SourceState {
    capacity: f64,
    refill_per_sec: f64,
    tokens_available: f64,
    last_refill_time: Instant,
    consecutive_failures: u32,
    backoff_until: Option<Instant>,
    last_backoff: Option<Duration>,
    failures_at_cap: u32,
    quarantine: Option<Quarantine>,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    cycles_failed: u64,
}

impl SourceState {
    fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: f64::from(capacity),
            refill_per_sec,
            tokens_available: f64::from(capacity),
            last_refill_time: Instant::now(),
            consecutive_failures: 0,
            backoff_until: None,
            last_backoff: None,
            failures_at_cap: 0,
            quarantine: None,
            last_success: None,
            last_failure: None,
            cycles_failed: 0,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_time).as_secs_f64();
        self.tokens_available =
            (self.tokens_available + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill_time = now;
    }

    fn clear_failures(&mut self) {
        self.consecutive_failures = 0;
        self.backoff_until = None;
        self.last_backoff = None;
        self.failures_at_cap = 0;
    }
}

/// Per-source view exported through health.
#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub quarantined: bool,
    pub quarantine_reason: Option<QuarantineReason>,
    pub consecutive_failures: u32,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub backoff_until: Option<DateTime<Utc>>,
    pub cycles_failed: u64,
}

pub struct RateGovernor {
    policy: RetryPolicy,
    sources: Mutex<HashMap<String, SourceState>>,
}

impl RateGovernor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sources: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        let g = Self::new(cfg.retry.clone());
        for s in &cfg.sources {
            g.register(&s.id, s.bucket_capacity, s.refill_per_sec);
        }
        g
    }

    /// Registers (or re-registers, resetting state) a source with a full bucket.
    pub fn register(&self, source_id: &str, capacity: u32, refill_per_sec: f64) {
        self.sources
            .lock()
            .insert(source_id.to_string(), SourceState::new(capacity, refill_per_sec));
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn acquire(&self, source_id: &str) -> Result<Grant, GovernorError> {
        let now = Instant::now();
        let mut guard = self.sources.lock();
        let st = guard
            .get_mut(source_id)
            .ok_or_else(|| GovernorError::UnknownSource(source_id.to_string()))?;

        if let Some(q) = st.quarantine.as_mut() {
            let probe_due = q.reason == QuarantineReason::BackoffExhausted
                && !q.probe_in_flight
                && q
                    .since
                    .checked_add(self.policy.probe_interval().min(MAX_WAIT))
                    .is_some_and(|due| now >= due);
            if !probe_due {
                return Err(GovernorError::Quarantined { reason: q.reason });
            }
            q.probe_in_flight = true;
            tracing::info!(target: "governor", source = source_id, "admitting probe fetch");
            return Ok(Grant::Probe);
        }

        if let Some(until) = st.backoff_until {
            if now < until {
                return Err(GovernorError::Throttled { wait: until - now });
            }
        }

        st.refill(now);
        if st.tokens_available >= 1.0 {
            st.tokens_available -= 1.0;
            return Ok(Grant::Granted);
        }
        let deficit = 1.0 - st.tokens_available;
        let wait = if st.refill_per_sec > 0.0 {
            Duration::from_secs_f64(deficit / st.refill_per_sec)
        } else {
            self.policy.backoff_cap()
        };
        Err(GovernorError::Throttled { wait })
    }

    /// A fetch succeeded: counters and backoff reset, a probe lifts quarantine.
    pub fn record_success(&self, source_id: &str) {
        let mut guard = self.sources.lock();
        let Some(st) = guard.get_mut(source_id) else {
            return;
        };
        st.last_success = Some(Utc::now());
        match &st.quarantine {
            // Only a probe can lift quarantine; a fetch that was already in
            // flight when storage escalation happened must not.
            Some(q) if q.probe_in_flight => {
                tracing::info!(target: "governor", source = source_id, reason = %q.reason, "quarantine lifted by successful probe");
                st.quarantine = None;
                st.clear_failures();
            }
            Some(_) => {}
            None => st.clear_failures(),
        }
    }

    pub fn record_failure(&self, source_id: &str, err: &FetchError) -> FailureVerdict {
        let now = Instant::now();
        let mut guard = self.sources.lock();
        let Some(st) = guard.get_mut(source_id) else {
            return FailureVerdict::Retry {
                wait: self.policy.backoff_cap(),
            };
        };
        st.last_failure = Some(Utc::now());
        st.consecutive_failures = st.consecutive_failures.saturating_add(1);

        if let FetchError::AuthError(msg) = err {
            tracing::warn!(target: "governor", source = source_id, error = %msg, "auth rejected");
            Self::enter_quarantine(st, source_id, QuarantineReason::Auth, now);
            return FailureVerdict::Quarantined(QuarantineReason::Auth);
        }

        // Failed probe: stay quarantined, re-arm the probe interval.
        if let Some(q) = st.quarantine.as_mut() {
            if q.probe_in_flight {
                q.since = now;
                q.probe_in_flight = false;
            }
            return FailureVerdict::Quarantined(q.reason);
        }

        let hint = match err {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        };
        let delay = self.next_delay(st.consecutive_failures, st.last_backoff, hint);
        st.last_backoff = Some(delay);
        st.backoff_until = Some(now + delay);

        if delay >= self.policy.backoff_cap().min(MAX_WAIT) {
            st.failures_at_cap += 1;
            if st.failures_at_cap >= self.policy.quarantine_after_cap_failures {
                Self::enter_quarantine(st, source_id, QuarantineReason::BackoffExhausted, now);
                return FailureVerdict::Quarantined(QuarantineReason::BackoffExhausted);
            }
        }
        tracing::debug!(
            target: "governor",
            source = source_id,
            failures = st.consecutive_failures,
            wait_ms = delay.as_millis() as u64,
            "backing off"
        );
        FailureVerdict::Retry { wait: delay }
    }

    /// `base * factor^(n-1)` with jitter, floored at the previous delay and the
    /// provider hint, capped at the policy cap (the hint may exceed it).
    fn next_delay(&self, failures: u32, prev: Option<Duration>, hint: Option<Duration>) -> Duration {
        let cap = self.policy.backoff_cap().min(MAX_WAIT).as_secs_f64();
        let exp = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw = self.policy.backoff_base().as_secs_f64() * self.policy.backoff_factor.powi(exp);
        let jitter = if self.policy.jitter > 0.0 {
            rand::rng().random_range(-self.policy.jitter..=self.policy.jitter)
        } else {
            0.0
        };
        let mut secs = (raw * (1.0 + jitter)).min(cap);
        if let Some(p) = prev {
            secs = secs.max(p.as_secs_f64().min(cap));
        }
        if !secs.is_finite() {
            secs = cap;
        }
        let delay = Duration::from_secs_f64(secs.max(0.0));
        match hint {
            Some(h) if h > delay => h.min(MAX_WAIT),
            _ => delay,
        }
    }

    /// Forces a source into quarantine (used for storage escalation).
    pub fn quarantine(&self, source_id: &str, reason: QuarantineReason) -> bool {
        let mut guard = self.sources.lock();
        match guard.get_mut(source_id) {
            Some(st) => {
                if st.quarantine.as_ref().map(|q| q.reason) != Some(reason) {
                    Self::enter_quarantine(st, source_id, reason, Instant::now());
                }
                true
            }
            None => false,
        }
    }

    fn enter_quarantine(st: &mut SourceState, source_id: &str, reason: QuarantineReason, now: Instant) {
        st.quarantine = Some(Quarantine {
            reason,
            since: now,
            probe_in_flight: false,
        });
        st.backoff_until = None;
        counter!("ingest_quarantined_total", "source" => source_id.to_string(), "reason" => reason.as_str())
            .increment(1);
        tracing::warn!(target: "governor", source = source_id, reason = %reason, "source quarantined");
    }

    /// Manual reset: clears quarantine, backoff and counters. False if unknown.
    pub fn reset(&self, source_id: &str) -> bool {
        let mut guard = self.sources.lock();
        let Some(st) = guard.get_mut(source_id) else {
            return false;
        };
        st.clear_failures();
        st.quarantine = None;
        tracing::info!(target: "governor", source = source_id, "source reset");
        true
    }

    pub fn quarantine_reason(&self, source_id: &str) -> Option<QuarantineReason> {
        self.sources
            .lock()
            .get(source_id)
            .and_then(|st| st.quarantine.as_ref().map(|q| q.reason))
    }

    pub fn note_cycle_failed(&self, source_id: &str) {
        if let Some(st) = self.sources.lock().get_mut(source_id) {
            st.cycles_failed += 1;
        }
    }

    pub fn snapshot(&self) -> Vec<SourceHealth> {
        let now = Instant::now();
        let wall = Utc::now();
        let guard = self.sources.lock();
        let mut out: Vec<SourceHealth> = guard
            .iter()
            .map(|(id, st)| SourceHealth {
                source_id: id.clone(),
                quarantined: st.quarantine.is_some(),
                quarantine_reason: st.quarantine.as_ref().map(|q| q.reason),
                consecutive_failures: st.consecutive_failures,
                last_success_time: st.last_success,
                last_failure_time: st.last_failure,
                backoff_until: st
                    .backoff_until
                    .filter(|u| *u > now)
                    .and_then(|u| chrono::Duration::from_std(u - now).ok())
                    .map(|d| wall + d),
                cycles_failed: st.cycles_failed,
            })
            .collect();
        out.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        out
    }
}
