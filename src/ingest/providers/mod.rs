// src/ingest/providers/mod.rs
pub mod coingecko;
pub mod reddit;
pub mod twitter;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use crate::ingest::config::{AdapterKind, ConfigError, PipelineConfig, SourceConfig};
use crate::ingest::types::{FetchError, Observation, SourceAdapter, ValueKind};
use crate::sentiment::TextScorer;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Build one adapter per configured source.
pub fn build_adapters(
    cfg: &PipelineConfig,
    scorer: Arc<dyn TextScorer>,
) -> Result<Vec<Arc<dyn SourceAdapter>>, ConfigError> {
    cfg.sources
        .iter()
        .map(|s| build_adapter(s, scorer.clone()))
        .collect()
}

pub fn build_adapter(
    src: &SourceConfig,
    scorer: Arc<dyn TextScorer>,
) -> Result<Arc<dyn SourceAdapter>, ConfigError> {
    let adapter: Arc<dyn SourceAdapter> = match src.kind {
        AdapterKind::Coingecko => Arc::new(coingecko::CoinGeckoAdapter::from_config(src)?),
        AdapterKind::Reddit => Arc::new(reddit::RedditAdapter::from_config(src, scorer)?),
        AdapterKind::Twitter => Arc::new(twitter::TwitterAdapter::from_config(src, scorer)?),
    };
    Ok(adapter)
}

pub(crate) fn http_client(source_id: &str) -> Result<Client, ConfigError> {
    Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(|e| ConfigError::HttpClient {
            source_id: source_id.to_string(),
            reason: e.to_string(),
        })
}

/// Map a non-success HTTP status onto the fetch error taxonomy.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> FetchError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            FetchError::AuthError(format!("http {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => FetchError::RateLimited {
            retry_after: headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs),
        },
        _ => FetchError::SourceUnavailable(format!("http {status}")),
    }
}

/// Send a request and decode its JSON body, classifying every failure.
pub(crate) async fn get_json<T: DeserializeOwned>(
    req: RequestBuilder,
    provider: &str,
) -> Result<T, FetchError> {
    let resp = req.send().await.map_err(|e| {
        tracing::warn!(target: "ingest", error = %e, provider, "provider http error");
        FetchError::SourceUnavailable(format!("{provider}: {e}"))
    })?;
    let status = resp.status();
    if !status.is_success() {
        return Err(classify_status(status, resp.headers()));
    }
    let body = resp
        .bytes()
        .await
        .map_err(|e| FetchError::SourceUnavailable(format!("{provider} body: {e}")))?;
    decode_json(&body, provider)
}

pub(crate) fn decode_json<T: DeserializeOwned>(body: &[u8], provider: &str) -> Result<T, FetchError> {
    serde_json::from_slice(body)
        .map_err(|e| FetchError::SourceUnavailable(format!("{provider} decode: {e}")))
}

/// A social post after scoring.
#[derive(Debug, Clone)]
pub(crate) struct ScoredPost {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub score: f64,
}

/// Collapse scored posts into one sentiment observation per second (mean score),
/// so the (source, entity, timestamp, kind) dedup key stays meaningful.
pub(crate) fn aggregate_scored(
    source_id: &str,
    entity_symbol: &str,
    posts: Vec<ScoredPost>,
    since: Option<DateTime<Utc>>,
) -> Vec<Observation> {
    let mut per_second: BTreeMap<i64, (f64, Vec<String>)> = BTreeMap::new();
    for p in posts {
        if since.is_some_and(|s| p.created_at.timestamp() <= s.timestamp()) {
            continue;
        }
        let slot = per_second.entry(p.created_at.timestamp()).or_default();
        slot.0 += p.score;
        slot.1.push(p.id);
    }

    per_second
        .into_iter()
        .filter_map(|(ts, (sum, mut ids))| {
            let at = DateTime::from_timestamp(ts, 0)?;
            ids.sort();
            let mean = sum / ids.len() as f64;
            Some(
                Observation::new(source_id, entity_symbol, at, ValueKind::SentimentScore, mean)
                    .with_payload_ref(format!("{source_id}:{}", ids.join(","))),
            )
        })
        .collect()
}
