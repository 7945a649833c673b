// src/ingest/providers/twitter.rs
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;

use crate::ingest::config::{ConfigError, SourceConfig};
use crate::ingest::normalize_text;
use crate::ingest::providers::{aggregate_scored, decode_json, get_json, http_client, ScoredPost};
use crate::ingest::types::{Entity, FetchError, Observation, SourceAdapter};
use crate::sentiment::TextScorer;

const DEFAULT_BASE_URL: &str = "https://api.twitter.com";
const MAX_RESULTS: &str = "100";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    // Absent when nothing matched.
    #[serde(default)]
    data: Vec<Tweet>,
}
#[derive(Debug, Deserialize)]
struct Tweet {
    id: String,
    text: String,
    created_at: DateTime<Utc>,
}

enum Mode {
    Fixture(String),
    Http {
        client: Client,
        base_url: String,
        bearer: String,
    },
}

/// Recent-search (API v2) tweets about an asset.
pub struct TwitterAdapter {
    id: String,
    scorer: Arc<dyn TextScorer>,
    mode: Mode,
}

impl TwitterAdapter {
    pub fn from_fixture(id: impl Into<String>, body: &str, scorer: Arc<dyn TextScorer>) -> Self {
        Self {
            id: id.into(),
            scorer,
            mode: Mode::Fixture(body.to_string()),
        }
    }

    /// A bearer token is mandatory for the search endpoint.
    pub fn from_config(src: &SourceConfig, scorer: Arc<dyn TextScorer>) -> Result<Self, ConfigError> {
        let bearer = src
            .credentials
            .secret()
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingCredential {
                source_id: src.id.clone(),
                var: src
                    .credentials_env
                    .clone()
                    .unwrap_or_else(|| "credentials_env".to_string()),
            })?;
        Ok(Self {
            id: src.id.clone(),
            scorer,
            mode: Mode::Http {
                client: http_client(&src.id)?,
                base_url: src
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                bearer,
            },
        })
    }

    /// `(BTC OR #BTC OR bitcoin) -is:retweet lang:en`
    pub fn search_query(entity: &Entity) -> String {
        let mut terms = vec![entity.symbol.clone(), format!("#{}", entity.symbol)];
        terms.extend(entity.aliases.iter().cloned());
        format!("({}) -is:retweet lang:en", terms.join(" OR "))
    }
}

#[async_trait]
impl SourceAdapter for TwitterAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(
        &self,
        entity: &Entity,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, FetchError> {
        let resp: SearchResponse = match &self.mode {
            Mode::Fixture(s) => decode_json(s.as_bytes(), "twitter")?,
            Mode::Http {
                client,
                base_url,
                bearer,
            } => {
                let mut params = vec![
                    ("query", Self::search_query(entity)),
                    ("max_results", MAX_RESULTS.to_string()),
                    ("tweet.fields", "created_at".to_string()),
                ];
                if let Some(s) = since {
                    params.push(("start_time", s.to_rfc3339_opts(SecondsFormat::Secs, true)));
                }
                let req = client
                    .get(format!("{base_url}/2/tweets/search/recent"))
                    .query(&params)
                    .bearer_auth(bearer);
                get_json(req, "twitter").await?
            }
        };

        let posts = resp
            .data
            .into_iter()
            .filter_map(|t| {
                let text = normalize_text(&t.text);
                if text.is_empty() {
                    return None;
                }
                Some(ScoredPost {
                    id: t.id,
                    created_at: t.created_at,
                    score: self.scorer.score(&text),
                })
            })
            .collect();
        Ok(aggregate_scored(&self.id, &entity.symbol, posts, since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::config::AdapterKind;
    use crate::sentiment::LexiconScorer;

    #[test]
    fn query_includes_aliases() {
        let q = TwitterAdapter::search_query(&Entity::new("eth").with_aliases(["ethereum"]));
        assert_eq!(q, "(ETH OR #ETH OR ethereum) -is:retweet lang:en");
    }

    #[test]
    fn http_mode_requires_a_token() {
        let src = SourceConfig::new("twitter", AdapterKind::Twitter);
        let err = TwitterAdapter::from_config(&src, Arc::new(LexiconScorer::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingCredential { .. }));
    }

    #[tokio::test]
    async fn empty_search_yields_nothing() {
        let a = TwitterAdapter::from_fixture(
            "twitter",
            r#"{"meta":{"result_count":0}}"#,
            Arc::new(LexiconScorer::new()),
        );
        assert!(a.fetch(&Entity::new("BTC"), None).await.unwrap().is_empty());
    }
}
