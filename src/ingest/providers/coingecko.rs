// src/ingest/providers/coingecko.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;

use crate::ingest::config::{ConfigError, SourceConfig};
use crate::ingest::providers::{decode_json, get_json, http_client};
use crate::ingest::types::{Entity, FetchError, Observation, SourceAdapter, ValueKind};

const DEFAULT_BASE_URL: &str = "https://api.coingecko.com/api/v3";

/// Ticker -> CoinGecko id for the assets tracked out of the box.
const KNOWN_IDS: &[(&str, &str)] = &[
    ("BTC", "bitcoin"),
    ("ETH", "ethereum"),
    ("BNB", "binancecoin"),
    ("XRP", "ripple"),
    ("ADA", "cardano"),
    ("SOL", "solana"),
    ("DOT", "polkadot"),
    ("DOGE", "dogecoin"),
];

type SimplePrice = HashMap<String, serde_json::Map<String, serde_json::Value>>;

enum Mode {
    // Owned copy of the payload so tests don't need 'static data.
    Fixture(String),
    Http {
        client: Client,
        base_url: String,
        api_key: Option<String>,
    },
}

/// Spot price per asset from the `/simple/price` endpoint.
pub struct CoinGeckoAdapter {
    id: String,
    vs_currency: String,
    mode: Mode,
}

impl CoinGeckoAdapter {
    pub fn from_fixture(id: impl Into<String>, body: &str) -> Self {
        Self {
            id: id.into(),
            vs_currency: "usd".to_string(),
            mode: Mode::Fixture(body.to_string()),
        }
    }

    pub fn from_config(src: &SourceConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            id: src.id.clone(),
            vs_currency: src.vs_currency.to_ascii_lowercase(),
            mode: Mode::Http {
                client: http_client(&src.id)?,
                base_url: src
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                api_key: src.credentials.secret().map(str::to_string),
            },
        })
    }

    /// First alias wins, then the built-in table, then the lower-cased symbol.
    pub fn coin_id(entity: &Entity) -> String {
        if let Some(a) = entity.aliases.first() {
            return a.clone();
        }
        KNOWN_IDS
            .iter()
            .find(|(sym, _)| *sym == entity.symbol)
            .map(|(_, id)| (*id).to_string())
            .unwrap_or_else(|| entity.symbol.to_ascii_lowercase())
    }

    fn to_observations(
        &self,
        quotes: SimplePrice,
        entity: &Entity,
        since: Option<DateTime<Utc>>,
    ) -> Vec<Observation> {
        let coin = Self::coin_id(entity);
        let Some(quote) = quotes.get(&coin) else {
            tracing::debug!(target: "ingest", provider = %self.id, coin = %coin, "coin missing from response");
            return Vec::new();
        };
        let Some(price) = quote.get(&self.vs_currency).and_then(|v| v.as_f64()) else {
            return Vec::new();
        };
        let at = quote
            .get("last_updated_at")
            .and_then(|v| v.as_i64())
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or_else(Utc::now);
        if since.is_some_and(|s| at.timestamp() <= s.timestamp()) {
            return Vec::new();
        }

        vec![
            Observation::new(&self.id, &entity.symbol, at, ValueKind::Price, price).with_payload_ref(
                format!("{}:simple/price/{coin}/{}@{}", self.id, self.vs_currency, at.timestamp()),
            ),
        ]
    }
}

#[async_trait]
impl SourceAdapter for CoinGeckoAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(
        &self,
        entity: &Entity,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, FetchError> {
        let quotes: SimplePrice = match &self.mode {
            Mode::Fixture(s) => decode_json(s.as_bytes(), "coingecko")?,
            Mode::Http {
                client,
                base_url,
                api_key,
            } => {
                let coin = Self::coin_id(entity);
                let mut req = client.get(format!("{base_url}/simple/price")).query(&[
                    ("ids", coin.as_str()),
                    ("vs_currencies", self.vs_currency.as_str()),
                    ("include_last_updated_at", "true"),
                ]);
                if let Some(key) = api_key {
                    req = req.header("x-cg-demo-api-key", key);
                }
                get_json(req, "coingecko").await?
            }
        };
        Ok(self.to_observations(quotes, entity, since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_id_prefers_alias_then_table() {
        assert_eq!(
            CoinGeckoAdapter::coin_id(&Entity::new("SOL")),
            "solana".to_string()
        );
        assert_eq!(
            CoinGeckoAdapter::coin_id(&Entity::new("WBTC").with_aliases(["wrapped-bitcoin"])),
            "wrapped-bitcoin".to_string()
        );
        assert_eq!(CoinGeckoAdapter::coin_id(&Entity::new("PEPE")), "pepe".to_string());
    }

    #[tokio::test]
    async fn malformed_body_is_source_unavailable() {
        let a = CoinGeckoAdapter::from_fixture("coingecko", "<html>oops</html>");
        let err = a.fetch(&Entity::new("BTC"), None).await.unwrap_err();
        assert!(matches!(err, FetchError::SourceUnavailable(_)));
    }
}
