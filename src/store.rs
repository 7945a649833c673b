//! # Durable store
//! Append-only persistence for aligned records, backed by sled.
//!
//! Trees:
//! - `records`: `entity \0 bucket` -> record. Written once, never overwritten.
//! - `late`: observation id -> late observation.
//! - `conflicts`: a different record proposed for an already-stored bucket.
//! - `pending`: open-bucket observations stashed at hard shutdown.
//!
//! Bucket numbers are stored sign-flipped big-endian so byte order matches
//! numeric order and range scans come back ascending.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::align::{AlignedRecord, LateObservation};
use crate::ingest::config::RetryPolicy;
use crate::ingest::types::Observation;

const MAX_PAGE: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("write failed after {attempts} attempts: {last}")]
    WriteExhausted { attempts: u32, last: String },
    #[error("invalid cursor '{0}'")]
    InvalidCursor(String),
}

impl StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_) | StoreError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Inserted,
    /// Identical record already stored.
    Unchanged,
    /// A different record already owns this bucket; the new one went to `conflicts`.
    Conflict,
}

impl WriteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::Inserted => "inserted",
            WriteOutcome::Unchanged => "unchanged",
            WriteOutcome::Conflict => "conflict",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    content_hash: String,
    written_at: DateTime<Utc>,
    record: AlignedRecord,
}

/// Position after the last bucket returned. Restartable across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor(i64);

impl Cursor {
    pub fn after_bucket(bucket: i64) -> Self {
        Self(bucket)
    }

    pub fn bucket(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Cursor)
            .map_err(|_| StoreError::InvalidCursor(s.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub records: Vec<AlignedRecord>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub records: usize,
    pub late: usize,
    pub conflicts: usize,
    pub pending: usize,
}

#[derive(Clone)]
pub struct DurableStore {
    db: sled::Db,
    records: sled::Tree,
    late: sled::Tree,
    conflicts: sled::Tree,
    pending: sled::Tree,
    write_attempts: u32,
    write_backoff: Duration,
    injected_faults: std::sync::Arc<AtomicU32>,
}

impl DurableStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop.
    pub fn open_temporary() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let policy = RetryPolicy::default();
        Ok(Self {
            records: db.open_tree("records")?,
            late: db.open_tree("late")?,
            conflicts: db.open_tree("conflicts")?,
            pending: db.open_tree("pending")?,
            db,
            write_attempts: policy.store_write_attempts,
            write_backoff: policy.store_backoff(),
            injected_faults: Default::default(),
        })
    }

    pub fn with_retry(mut self, policy: &RetryPolicy) -> Self {
        self.write_attempts = policy.store_write_attempts.max(1);
        self.write_backoff = policy.store_backoff();
        self
    }

    /// Makes the next `n` record write attempts fail with a transient error.
    #[doc(hidden)]
    pub fn fail_next_writes(&self, n: u32) {
        self.injected_faults.store(n, Ordering::SeqCst);
    }

    fn record_key(entity: &str, bucket: i64) -> Vec<u8> {
        let mut k = Vec::with_capacity(entity.len() + 9);
        k.extend_from_slice(entity.as_bytes());
        k.push(0);
        k.extend_from_slice(&((bucket as u64) ^ (1 << 63)).to_be_bytes());
        k
    }

    /// Persists a closed record. Transient failures are retried with
    /// exponential backoff; exhaustion is returned as `WriteExhausted`.
    pub async fn write_record(&self, rec: &AlignedRecord) -> Result<WriteOutcome, StoreError> {
        let mut attempt: u32 = 0;
        let mut wait = self.write_backoff;
        loop {
            attempt += 1;
            match self.try_write(rec) {
                Ok(outcome) => {
                    counter!("store_writes_total", "outcome" => outcome.as_str()).increment(1);
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < self.write_attempts => {
                    counter!("store_write_retries_total").increment(1);
                    tracing::warn!(
                        target: "store",
                        entity = %rec.entity_symbol,
                        bucket = rec.time_bucket,
                        attempt,
                        error = %e,
                        "record write failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    wait = wait.saturating_mul(2);
                }
                Err(e) if e.is_transient() => {
                    counter!("store_writes_total", "outcome" => "failed").increment(1);
                    return Err(StoreError::WriteExhausted {
                        attempts: attempt,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_write(&self, rec: &AlignedRecord) -> Result<WriteOutcome, StoreError> {
        let injected = self
            .injected_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected write fault".into()));
        }

        let key = Self::record_key(&rec.entity_symbol, rec.time_bucket);
        let hash = rec.content_hash();
        let value = serde_json::to_vec(&StoredRecord {
            content_hash: hash.clone(),
            written_at: Utc::now(),
            record: rec.clone(),
        })?;

        match self
            .records
            .compare_and_swap(&key, None as Option<&[u8]>, Some(value.clone()))?
        {
            Ok(()) => Ok(WriteOutcome::Inserted),
            Err(cas) => {
                let existing: Option<StoredRecord> = cas
                    .current
                    .as_deref()
                    .map(|b| serde_json::from_slice::<StoredRecord>(b))
                    .transpose()?;
                if existing.is_some_and(|s| s.content_hash == hash) {
                    return Ok(WriteOutcome::Unchanged);
                }
                let mut ckey = key;
                ckey.push(0);
                ckey.extend_from_slice(hash.as_bytes());
                self.conflicts.insert(ckey, value)?;
                tracing::warn!(
                    target: "store",
                    entity = %rec.entity_symbol,
                    bucket = rec.time_bucket,
                    "conflicting record for stored bucket kept aside"
                );
                Ok(WriteOutcome::Conflict)
            }
        }
    }

    pub fn get_record(&self, entity: &str, bucket: i64) -> Result<Option<AlignedRecord>, StoreError> {
        self.records
            .get(Self::record_key(entity, bucket))?
            .map(|v| serde_json::from_slice::<StoredRecord>(&v).map(|s| s.record))
            .transpose()
            .map_err(StoreError::from)
    }

    /// Records for `entity` with `start <= bucket_start < end`, ascending by
    /// bucket, resuming strictly after `cursor`.
    pub fn read_range(
        &self,
        entity: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> Result<RecordPage, StoreError> {
        let limit = limit.clamp(1, MAX_PAGE);
        let lower = match cursor {
            Some(c) => match c.bucket().checked_add(1) {
                Some(b) => Self::record_key(entity, b),
                None => {
                    return Ok(RecordPage {
                        records: Vec::new(),
                        next_cursor: None,
                    })
                }
            },
            None => Self::record_key(entity, i64::MIN),
        };
        let upper = Self::record_key(entity, i64::MAX);

        let mut records = Vec::with_capacity(limit);
        let mut has_more = false;
        for item in self.records.range(lower..=upper) {
            let (_k, v) = item?;
            let rec = serde_json::from_slice::<StoredRecord>(&v)?.record;
            if start.is_some_and(|s| rec.bucket_start < s) {
                continue;
            }
            if end.is_some_and(|e| rec.bucket_start >= e) {
                break;
            }
            if records.len() == limit {
                has_more = true;
                break;
            }
            records.push(rec);
        }

        let next_cursor = if has_more {
            records
                .last()
                .map(|r| Cursor::after_bucket(r.time_bucket).to_string())
        } else {
            None
        };
        Ok(RecordPage {
            records,
            next_cursor,
        })
    }

    /// Idempotent by observation id. Returns true when newly recorded.
    pub fn record_late(&self, late: &LateObservation) -> Result<bool, StoreError> {
        let key = late.observation.id();
        let value = serde_json::to_vec(late)?;
        let fresh = self
            .late
            .compare_and_swap(key.as_str(), None as Option<&[u8]>, Some(value))?
            .is_ok();
        Ok(fresh)
    }

    pub fn read_late(&self, entity: Option<&str>, limit: usize) -> Result<Vec<LateObservation>, StoreError> {
        let limit = limit.clamp(1, MAX_PAGE);
        let mut out = Vec::new();
        for item in self.late.iter() {
            let (_k, v) = item?;
            let late: LateObservation = serde_json::from_slice(&v)?;
            if entity.is_some_and(|e| late.observation.entity_symbol != e) {
                continue;
            }
            out.push(late);
            if out.len() == limit {
                break;
            }
        }
        Ok(out)
    }

    /// Persists open-bucket observations so the next start can resume them.
    pub fn stash_pending(&self, obs: &[Observation]) -> Result<usize, StoreError> {
        let mut batch = sled::Batch::default();
        for o in obs {
            batch.insert(o.id().as_str(), serde_json::to_vec(o)?);
        }
        self.pending.apply_batch(batch)?;
        self.pending.flush()?;
        Ok(obs.len())
    }

    /// Removes and returns everything stashed by [`stash_pending`](Self::stash_pending).
    pub fn take_pending(&self) -> Result<Vec<Observation>, StoreError> {
        let mut out = Vec::new();
        while let Some((_k, v)) = self.pending.pop_min()? {
            out.push(serde_json::from_slice(&v)?);
        }
        Ok(out)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            records: self.records.len(),
            late: self.late.len(),
            conflicts: self.conflicts.len(),
            pending: self.pending.len(),
        }
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.flush())
            .await
            .map_err(|e| StoreError::Unavailable(format!("flush task: {e}")))??;
        Ok(())
    }
}
