//! # Dedup & alignment
//! Folds observations into fixed-width, per-entity time buckets and emits one
//! [`AlignedRecord`] per bucket once its grace window has elapsed.
//!
//! The engine is plain synchronous state. It is owned by exactly one merge
//! task, which makes that task the single writer for every bucket key.
//!
//! Rules:
//! - `bucket = floor(unix_ts / width)`, so buckets are aligned to the epoch.
//! - A bucket closes once `now > bucket_end + grace`.
//! - Anything arriving for a closed bucket is returned as [`LateObservation`]
//!   and never merged, so closed records stay immutable.
//! - Duplicate ids (source, entity, second, kind) are no-ops; the first
//!   delivery wins.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ingest::config::PipelineConfig;
use crate::ingest::types::{Observation, ObservationId, ValueKind};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BucketKey {
    pub entity_symbol: String,
    pub bucket: i64,
}

/// Merged, deduplicated output for one (entity, bucket).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignedRecord {
    pub entity_symbol: String,
    pub time_bucket: i64,
    pub bucket_start: DateTime<Utc>,
    pub price: Option<f64>,
    pub sentiment: Option<f64>,
    pub contributing_observation_ids: BTreeSet<ObservationId>,
}

impl AlignedRecord {
    /// Pure function of the contributing set: the same observations always
    /// produce the same record, whatever order they arrived in.
    pub fn from_observations<'a, I>(entity_symbol: &str, time_bucket: i64, width_secs: i64, obs: I) -> Self
    where
        I: IntoIterator<Item = &'a Observation>,
    {
        let mut ids = BTreeSet::new();
        let mut latest_price: Option<&Observation> = None;
        let mut sentiment_sum = 0.0;
        let mut sentiment_n = 0usize;

        for o in obs {
            ids.insert(o.id());
            match o.value_kind {
                ValueKind::Price => {
                    let newer = match latest_price {
                        None => true,
                        Some(p) => {
                            o.timestamp > p.timestamp
                                || (o.timestamp == p.timestamp && o.source_id < p.source_id)
                        }
                    };
                    if newer {
                        latest_price = Some(o);
                    }
                }
                ValueKind::SentimentScore => {
                    sentiment_sum += o.value;
                    sentiment_n += 1;
                }
            }
        }

        Self {
            entity_symbol: entity_symbol.to_string(),
            time_bucket,
            bucket_start: DateTime::from_timestamp(time_bucket.saturating_mul(width_secs), 0)
                .unwrap_or_default(),
            price: latest_price.map(|p| p.value),
            sentiment: (sentiment_n > 0).then(|| sentiment_sum / sentiment_n as f64),
            contributing_observation_ids: ids,
        }
    }

    pub fn key(&self) -> BucketKey {
        BucketKey {
            entity_symbol: self.entity_symbol.clone(),
            bucket: self.time_bucket,
        }
    }

    /// Hex SHA-256 over `entity|bucket|id,id,...` (ids in set order).
    pub fn content_hash(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.entity_symbol.as_bytes());
        h.update(b"|");
        h.update(self.time_bucket.to_string().as_bytes());
        h.update(b"|");
        for (i, id) in self.contributing_observation_ids.iter().enumerate() {
            if i > 0 {
                h.update(b",");
            }
            h.update(id.as_str().as_bytes());
        }
        h.finalize().iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Distinct sources behind this record.
    pub fn source_ids(&self) -> BTreeSet<String> {
        self.contributing_observation_ids
            .iter()
            .map(|id| id.source_id().to_string())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LateStatus {
    Late,
}

/// An observation that missed its bucket. Kept for audit, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LateObservation {
    pub observation: Observation,
    pub bucket: i64,
    pub arrived_at: DateTime<Utc>,
    pub status: LateStatus,
}

/// A bucket that just closed, with the observations behind its record.
#[derive(Debug, Clone)]
pub struct ClosedBucket {
    pub record: AlignedRecord,
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Merged,
    Duplicate,
    Late(LateObservation),
}

pub struct AlignmentEngine {
    width_secs: i64,
    grace_secs: i64,
    open: BTreeMap<BucketKey, BTreeMap<ObservationId, Observation>>,
    // Highest closed bucket per entity.
    closed_through: HashMap<String, i64>,
}

impl AlignmentEngine {
    pub fn new(width: Duration, grace: Duration) -> Self {
        Self {
            width_secs: i64::try_from(width.as_secs().max(1)).unwrap_or(i64::MAX),
            grace_secs: i64::try_from(grace.as_secs()).unwrap_or(i64::MAX),
            open: BTreeMap::new(),
            closed_through: HashMap::new(),
        }
    }

    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self::new(cfg.bucket_width(), cfg.grace_window())
    }

    pub fn bucket_of(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.width_secs)
    }

    /// Earliest instant at which `bucket` may be emitted (exclusive).
    pub fn closes_after(&self, bucket: i64) -> i64 {
        bucket
            .saturating_add(1)
            .saturating_mul(self.width_secs)
            .saturating_add(self.grace_secs)
    }

    fn is_closed(&self, key: &BucketKey, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.closes_after(key.bucket)
            || self
                .closed_through
                .get(&key.entity_symbol)
                .is_some_and(|c| key.bucket <= *c)
    }

    pub fn ingest(&mut self, obs: Observation, now: DateTime<Utc>) -> IngestOutcome {
        let key = BucketKey {
            entity_symbol: obs.entity_symbol.clone(),
            bucket: self.bucket_of(obs.timestamp),
        };
        if self.is_closed(&key, now) {
            counter!("align_late_total", "source" => obs.source_id.clone()).increment(1);
            tracing::debug!(
                target: "pipeline",
                source = %obs.source_id,
                entity = %obs.entity_symbol,
                bucket = key.bucket,
                "late observation"
            );
            return IngestOutcome::Late(LateObservation {
                bucket: key.bucket,
                observation: obs,
                arrived_at: now,
                status: LateStatus::Late,
            });
        }
        self.merge(key, obs)
    }

    /// Re-ingests observations stashed by a previous run. Lateness is not
    /// checked: these buckets were open when the process stopped.
    pub fn restore(&mut self, obs: Observation) -> IngestOutcome {
        let key = BucketKey {
            entity_symbol: obs.entity_symbol.clone(),
            bucket: self.bucket_of(obs.timestamp),
        };
        self.merge(key, obs)
    }

    fn merge(&mut self, key: BucketKey, obs: Observation) -> IngestOutcome {
        let slot = self.open.entry(key).or_default();
        let id = obs.id();
        if slot.contains_key(&id) {
            counter!("align_duplicates_total").increment(1);
            return IngestOutcome::Duplicate;
        }
        slot.insert(id, obs);
        IngestOutcome::Merged
    }

    /// Emits every bucket whose grace window has passed, ascending by
    /// (entity, bucket). Each bucket is emitted exactly once.
    pub fn close_due(&mut self, now: DateTime<Utc>) -> Vec<ClosedBucket> {
        let due: Vec<BucketKey> = self
            .open
            .keys()
            .filter(|k| now.timestamp() > self.closes_after(k.bucket))
            .cloned()
            .collect();

        let mut out = Vec::with_capacity(due.len());
        for key in due {
            let Some(obs) = self.open.remove(&key) else {
                continue;
            };
            let watermark = self.closed_through.entry(key.entity_symbol.clone()).or_insert(key.bucket);
            *watermark = (*watermark).max(key.bucket);
            let record =
                AlignedRecord::from_observations(&key.entity_symbol, key.bucket, self.width_secs, obs.values());
            out.push(ClosedBucket {
                record,
                observations: obs.into_values().collect(),
            });
        }
        if !out.is_empty() {
            counter!("align_records_emitted_total").increment(out.len() as u64);
        }
        out
    }

    pub fn open_buckets(&self) -> usize {
        self.open.len()
    }

    /// Observations still held in open buckets, without removing them.
    pub fn pending_observations(&self) -> Vec<Observation> {
        self.open.values().flat_map(|m| m.values().cloned()).collect()
    }

    /// Removes and returns every open observation (hard-stop stash).
    pub fn drain_open(&mut self) -> Vec<Observation> {
        std::mem::take(&mut self.open)
            .into_values()
            .flat_map(|m| m.into_values())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn price(src: &str, secs: i64, v: f64) -> Observation {
        Observation::new(src, "BTC", at(secs), ValueKind::Price, v)
    }

    fn sent(src: &str, secs: i64, v: f64) -> Observation {
        Observation::new(src, "BTC", at(secs), ValueKind::SentimentScore, v)
    }

    #[test]
    fn negative_timestamps_floor_correctly() {
        let e = AlignmentEngine::new(Duration::from_secs(300), Duration::from_secs(300));
        assert_eq!(e.bucket_of(at(-1)), -1);
        assert_eq!(e.bucket_of(at(0)), 0);
        assert_eq!(e.bucket_of(at(299)), 0);
    }

    #[test]
    fn record_takes_latest_price_and_mean_sentiment() {
        let obs = [
            price("a", 10, 100.0),
            price("b", 70, 101.0),
            sent("reddit", 20, 0.5),
            sent("twitter", 20, -0.1),
        ];
        let r = AlignedRecord::from_observations("BTC", 0, 300, obs.iter());
        assert_eq!(r.price, Some(101.0));
        assert!((r.sentiment.unwrap() - 0.2).abs() < 1e-9);
        assert_eq!(r.contributing_observation_ids.len(), 4);
        assert_eq!(r.bucket_start, at(0));
    }

    #[test]
    fn price_tie_breaks_on_source_id() {
        let a = [price("zeta", 10, 2.0), price("alpha", 10, 1.0)];
        let b = [price("alpha", 10, 1.0), price("zeta", 10, 2.0)];
        let ra = AlignedRecord::from_observations("BTC", 0, 300, a.iter());
        let rb = AlignedRecord::from_observations("BTC", 0, 300, b.iter());
        assert_eq!(ra.price, Some(1.0));
        assert_eq!(ra, rb);
        assert_eq!(ra.content_hash(), rb.content_hash());
    }

    #[test]
    fn closed_bucket_never_reopens() {
        let mut e = AlignmentEngine::new(Duration::from_secs(60), Duration::from_secs(0));
        assert_eq!(e.ingest(price("a", 10, 1.0), at(20)), IngestOutcome::Merged);
        assert_eq!(e.close_due(at(61)).len(), 1);
        // Watermark catches it even if the caller's clock is behind.
        assert!(matches!(
            e.ingest(price("b", 11, 1.0), at(30)),
            IngestOutcome::Late(_)
        ));
        assert_eq!(e.open_buckets(), 0);
    }

    #[test]
    fn drain_open_empties_the_engine() {
        let mut e = AlignmentEngine::new(Duration::from_secs(300), Duration::from_secs(300));
        e.ingest(price("a", 10, 1.0), at(10));
        e.ingest(sent("r", 400, 0.3), at(400));
        assert_eq!(e.pending_observations().len(), 2);
        assert_eq!(e.drain_open().len(), 2);
        assert_eq!(e.open_buckets(), 0);
    }
}
