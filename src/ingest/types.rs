// src/ingest/types.rs
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What an observation measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Price,
    SentimentScore,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Price => "price",
            ValueKind::SentimentScore => "sentiment_score",
        }
    }
}

/// One canonical data point produced by a source adapter. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub source_id: String,     // e.g. "coingecko", "reddit"
    pub entity_symbol: String, // e.g. "BTC"
    pub timestamp: DateTime<Utc>,
    pub value_kind: ValueKind,
    pub value: f64,
    pub raw_payload_ref: Option<String>,
}

impl Observation {
    /// Builds an observation, truncating the timestamp to whole seconds.
    pub fn new(
        source_id: impl Into<String>,
        entity_symbol: impl Into<String>,
        timestamp: DateTime<Utc>,
        value_kind: ValueKind,
        value: f64,
    ) -> Self {
        let timestamp = DateTime::from_timestamp(timestamp.timestamp(), 0).unwrap_or(timestamp);
        Self {
            source_id: source_id.into(),
            entity_symbol: entity_symbol.into(),
            timestamp,
            value_kind,
            value,
            raw_payload_ref: None,
        }
    }

    pub fn with_payload_ref(mut self, payload_ref: impl Into<String>) -> Self {
        self.raw_payload_ref = Some(payload_ref.into());
        self
    }

    /// Dedup identity: (source_id, entity_symbol, timestamp, value_kind).
    pub fn id(&self) -> ObservationId {
        ObservationId(format!(
            "{}:{}:{}:{}",
            self.source_id,
            self.entity_symbol,
            self.timestamp.timestamp(),
            self.value_kind.as_str()
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObservationId(String);

impl ObservationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The source component of the id (source ids never contain `:`).
    pub fn source_id(&self) -> &str {
        self.0.split(':').next().unwrap_or_default()
    }
}

impl fmt::Display for ObservationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tracked asset. `aliases` feed provider ids and mention matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub symbol: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Entity {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().trim().to_ascii_uppercase(),
            aliases: Vec::new(),
        }
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases
            .into_iter()
            .map(|a| a.into().trim().to_ascii_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        self
    }

    /// Upper-case symbol, lower-case trimmed aliases.
    pub fn normalized(self) -> Self {
        let aliases = self.aliases.clone();
        Entity::new(self.symbol).with_aliases(aliases)
    }

    /// True if `text` mentions the symbol or any alias as a whole word
    /// (`$BTC`, `#bitcoin` and `Bitcoin` all count).
    pub fn mentioned_in(&self, text: &str) -> bool {
        let symbol = self.symbol.to_ascii_lowercase();
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_ascii_lowercase())
            .any(|t| t == symbol || self.aliases.iter().any(|a| *a == t))
    }
}

/// Provider-level failures, classified once at the adapter boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("authentication rejected: {0}")]
    AuthError(String),
    #[error("rate limited by provider (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
}

/// One external provider. Adapters translate protocol and schema only;
/// retries and pacing belong to the scheduler and the rate governor.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Observations for `entity` strictly newer than `since`.
    async fn fetch(
        &self,
        entity: &Entity,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn observation_truncates_to_seconds_and_builds_id() {
        let ts = Utc.timestamp_millis_opt(1_700_000_000_750).unwrap();
        let o = Observation::new("coingecko", "BTC", ts, ValueKind::Price, 1.0);
        assert_eq!(o.timestamp.timestamp_subsec_millis(), 0);
        assert_eq!(o.id().as_str(), "coingecko:BTC:1700000000:price");
        assert_eq!(o.id().source_id(), "coingecko");
    }

    #[test]
    fn mention_matching_is_word_based() {
        let e = Entity::new("btc").with_aliases(["Bitcoin"]);
        assert_eq!(e.symbol, "BTC");
        assert!(e.mentioned_in("$BTC to the moon"));
        assert!(e.mentioned_in("#bitcoin halving soon"));
        assert!(!e.mentioned_in("btcx airdrop"));
    }
}
