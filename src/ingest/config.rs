// src/ingest/config.rs
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingest::types::Entity;

pub const ENV_CONFIG_PATH: &str = "CRYPTOPULSE_CONFIG_PATH";
pub const DEFAULT_TOML_PATH: &str = "config/pipeline.toml";
pub const DEFAULT_JSON_PATH: &str = "config/pipeline.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CRYPTOPULSE_CONFIG_PATH points to non-existent path {}", .0.display())]
    MissingPath(PathBuf),
    #[error("unsupported config format: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("source '{source_id}' references env var {var}, which is not set")]
    MissingCredential { source_id: String, var: String },
    #[error("building http client for '{source_id}': {reason}")]
    HttpClient { source_id: String, reason: String },
}

fn default_bucket_width_secs() -> u64 {
    300
}
fn default_storage_path() -> PathBuf {
    PathBuf::from("data/cryptopulse.db")
}
fn default_channel_capacity() -> usize {
    1024
}
fn default_merge_tick_ms() -> u64 {
    1000
}
fn default_stop_timeout_secs() -> u64 {
    30
}
fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// Immutable pipeline configuration, consumed once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default = "default_bucket_width_secs")]
    pub bucket_width_secs: u64,
    /// Defaults to one bucket width when absent.
    #[serde(default)]
    pub grace_window_secs: Option<u64>,
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_merge_tick_ms")]
    pub merge_tick_ms: u64,
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            entities: Vec::new(),
            bucket_width_secs: default_bucket_width_secs(),
            grace_window_secs: None,
            storage_path: default_storage_path(),
            channel_capacity: default_channel_capacity(),
            merge_tick_ms: default_merge_tick_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
            http_addr: default_http_addr(),
            retry: RetryPolicy::default(),
            sources: Vec::new(),
        }
    }
}

impl PipelineConfig {
    pub fn bucket_width(&self) -> Duration {
        Duration::from_secs(self.bucket_width_secs)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs.unwrap_or(self.bucket_width_secs))
    }

    pub fn merge_tick(&self) -> Duration {
        Duration::from_millis(self.merge_tick_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Upper-case symbols, lower-case aliases, drop duplicate entities.
    pub fn normalize(&mut self) {
        let mut seen = HashSet::new();
        let entities = std::mem::take(&mut self.entities);
        for e in entities {
            let e = e.normalized();
            if !e.symbol.is_empty() && seen.insert(e.symbol.clone()) {
                self.entities.push(e);
            }
        }
        for s in &mut self.sources {
            s.id = s.id.trim().to_ascii_lowercase();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_width_secs == 0 {
            return Err(ConfigError::Invalid("bucket_width_secs must be > 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid("channel_capacity must be > 0".into()));
        }
        if !self.sources.is_empty() && self.entities.is_empty() {
            return Err(ConfigError::Invalid(
                "sources are configured but no entities are tracked".into(),
            ));
        }
        for e in &self.entities {
            if !e.symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(ConfigError::Invalid(format!(
                    "entity symbol '{}' must be alphanumeric",
                    e.symbol
                )));
            }
        }
        self.retry.validate()?;

        let mut ids = HashSet::new();
        for s in &self.sources {
            if s.id.is_empty() || s.id.contains(':') {
                return Err(ConfigError::Invalid(format!(
                    "source id '{}' must be non-empty and free of ':'",
                    s.id
                )));
            }
            if !ids.insert(s.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate source id '{}'", s.id)));
            }
            if s.poll_interval_secs == 0 {
                return Err(ConfigError::Invalid(format!(
                    "source '{}': poll_interval_secs must be > 0",
                    s.id
                )));
            }
            if s.bucket_capacity == 0 || !(s.refill_per_sec > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "source '{}': rate limit needs bucket_capacity > 0 and refill_per_sec > 0",
                    s.id
                )));
            }
            if s.max_concurrent_fetches == 0 {
                return Err(ConfigError::Invalid(format!(
                    "source '{}': max_concurrent_fetches must be > 0",
                    s.id
                )));
            }
            if s.kind == AdapterKind::Reddit && s.subreddits.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "source '{}': reddit sources need at least one subreddit",
                    s.id
                )));
            }
        }
        Ok(())
    }

    /// Resolve every `credentials_env` reference into an immutable secret.
    pub fn resolve_credentials(&mut self) -> Result<(), ConfigError> {
        for s in &mut self.sources {
            s.credentials = match &s.credentials_env {
                None => Credentials::default(),
                Some(var) => match std::env::var(var) {
                    Ok(v) if !v.trim().is_empty() => Credentials::from_secret(v.trim()),
                    _ => {
                        return Err(ConfigError::MissingCredential {
                            source_id: s.id.clone(),
                            var: var.clone(),
                        })
                    }
                },
            };
        }
        Ok(())
    }
}

/// Retry, backoff and quarantine tuning shared by all sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_factor: f64,
    pub backoff_cap_secs: u64,
    /// Relative jitter, 0.2 means ±20 %.
    pub jitter: f64,
    pub quarantine_after_cap_failures: u32,
    /// Defaults to the backoff cap when absent.
    pub probe_interval_secs: Option<u64>,
    pub store_write_attempts: u32,
    pub store_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 1000,
            backoff_factor: 2.0,
            backoff_cap_secs: 300,
            jitter: 0.2,
            quarantine_after_cap_failures: 3,
            probe_interval_secs: None,
            store_write_attempts: 3,
            store_backoff_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Upper bound for any backoff, provider hint or probe interval.
    pub const MAX_WAIT_SECS: u64 = 7 * 24 * 3600;

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.unwrap_or(self.backoff_cap_secs))
    }

    pub fn store_backoff(&self) -> Duration {
        Duration::from_millis(self.store_backoff_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
        }
        if self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid("retry.backoff_factor must be >= 1.0".into()));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid("retry.jitter must be in [0, 1)".into()));
        }
        let probe = self.probe_interval_secs.unwrap_or(self.backoff_cap_secs);
        if self.backoff_cap_secs > Self::MAX_WAIT_SECS || probe > Self::MAX_WAIT_SECS {
            return Err(ConfigError::Invalid(format!(
                "retry.backoff_cap_secs and retry.probe_interval_secs must be <= {}",
                Self::MAX_WAIT_SECS
            )));
        }
        if self.quarantine_after_cap_failures == 0 || self.store_write_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.quarantine_after_cap_failures and retry.store_write_attempts must be > 0"
                    .into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Coingecko,
    Reddit,
    Twitter,
}

fn default_poll_interval_secs() -> u64 {
    SourceConfig::DEFAULT_POLL_INTERVAL_SECS
}
fn default_bucket_capacity() -> u32 {
    SourceConfig::DEFAULT_BUCKET_CAPACITY
}
fn default_refill_per_sec() -> f64 {
    SourceConfig::DEFAULT_REFILL_PER_SEC
}
fn default_max_concurrent() -> usize {
    SourceConfig::DEFAULT_MAX_CONCURRENT_FETCHES
}
fn default_vs_currency() -> String {
    "usd".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub kind: AdapterKind,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_bucket_capacity")]
    pub bucket_capacity: u32,
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_fetches: usize,
    /// Name of the env var holding the API key / bearer token.
    #[serde(default)]
    pub credentials_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub subreddits: Vec<String>,
    /// Reddit only: also score the comment tree of matching posts.
    #[serde(default)]
    pub include_comments: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default = "default_vs_currency")]
    pub vs_currency: String,
    #[serde(skip)]
    pub credentials: Credentials,
}

impl SourceConfig {
    // Limits applied to sources without an entry of their own.
    pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
    pub const DEFAULT_BUCKET_CAPACITY: u32 = 5;
    pub const DEFAULT_REFILL_PER_SEC: f64 = 1.0;
    pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 1;

    pub fn new(id: impl Into<String>, kind: AdapterKind) -> Self {
        Self {
            id: id.into(),
            kind,
            poll_interval_secs: default_poll_interval_secs(),
            bucket_capacity: default_bucket_capacity(),
            refill_per_sec: default_refill_per_sec(),
            max_concurrent_fetches: default_max_concurrent(),
            credentials_env: None,
            base_url: None,
            subreddits: Vec::new(),
            include_comments: false,
            user_agent: None,
            vs_currency: default_vs_currency(),
            credentials: Credentials::default(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Resolved secret for one source. Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    secret: Option<String>,
}

impl Credentials {
    pub fn from_secret(secret: impl Into<String>) -> Self {
        Self {
            secret: Some(secret.into()),
        }
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.secret {
            Some(s) => write!(f, "Credentials(<redacted, len={}>)", s.len()),
            None => f.write_str("Credentials(none)"),
        }
    }
}

/// Load config from an explicit path. Supports TOML or JSON formats.
pub fn load_config_from(path: &Path) -> Result<PipelineConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut cfg = parse_config(&content, ext.as_str())?;
    cfg.normalize();
    cfg.validate()?;
    cfg.resolve_credentials()?;
    Ok(cfg)
}

/// Load config using env var + fallbacks:
/// 1) $CRYPTOPULSE_CONFIG_PATH
/// 2) config/pipeline.toml
/// 3) config/pipeline.json
/// 4) built-in defaults (no sources)
pub fn load_config_default() -> Result<PipelineConfig, ConfigError> {
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_config_from(&pb);
        }
        return Err(ConfigError::MissingPath(pb));
    }
    let toml_p = PathBuf::from(DEFAULT_TOML_PATH);
    if toml_p.exists() {
        return load_config_from(&toml_p);
    }
    let json_p = PathBuf::from(DEFAULT_JSON_PATH);
    if json_p.exists() {
        return load_config_from(&json_p);
    }
    Ok(PipelineConfig::default())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<PipelineConfig, ConfigError> {
    // Try TOML first if hinted or content doesn't look like JSON.
    let try_toml = hint_ext == "toml" || !s.trim_start().starts_with('{');
    let mut toml_err = None;
    if try_toml {
        match toml::from_str::<PipelineConfig>(s) {
            Ok(v) => return Ok(v),
            Err(e) => toml_err = Some(e.to_string()),
        }
    }
    match serde_json::from_str::<PipelineConfig>(s) {
        Ok(v) => Ok(v),
        Err(json_err) => Err(ConfigError::Parse(
            toml_err.unwrap_or_else(|| json_err.to_string()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_defaults_fill_every_tunable() {
        let s = r#"
entities = [{ symbol = "btc", aliases = ["Bitcoin"] }]

[[sources]]
id = "coingecko"
kind = "coingecko"
"#;
        let mut cfg = parse_config(s, "toml").unwrap();
        cfg.normalize();
        cfg.validate().unwrap();
        assert_eq!(cfg.entities[0].symbol, "BTC");
        assert_eq!(cfg.entities[0].aliases, vec!["bitcoin".to_string()]);
        assert_eq!(cfg.bucket_width(), Duration::from_secs(300));
        assert_eq!(cfg.grace_window(), Duration::from_secs(300));
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.probe_interval(), Duration::from_secs(300));
        let src = cfg.source("coingecko").unwrap();
        assert_eq!(src.poll_interval(), Duration::from_secs(60));
        assert_eq!(src.max_concurrent_fetches, 1);
    }

    #[test]
    fn json_is_accepted_too() {
        let s = r#"{"entities":[{"symbol":"ETH"}],"bucket_width_secs":60,"grace_window_secs":30}"#;
        let cfg = parse_config(s, "json").unwrap();
        assert_eq!(cfg.grace_window(), Duration::from_secs(30));
    }

    #[test]
    fn unknown_adapter_kind_is_rejected() {
        let s = r#"
entities = [{ symbol = "BTC" }]
[[sources]]
id = "x"
kind = "myspace"
"#;
        assert!(matches!(parse_config(s, "toml"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn validation_catches_duplicates_and_zeroes() {
        let mut cfg = PipelineConfig {
            entities: vec![Entity::new("BTC")],
            ..PipelineConfig::default()
        };
        cfg.sources = vec![
            SourceConfig::new("a", AdapterKind::Coingecko),
            SourceConfig::new("a", AdapterKind::Coingecko),
        ];
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        cfg.sources.pop();
        cfg.sources[0].refill_per_sec = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn oversized_waits_are_rejected() {
        let mut cfg = PipelineConfig {
            entities: vec![Entity::new("BTC")],
            ..PipelineConfig::default()
        };
        cfg.retry.backoff_cap_secs = u64::MAX;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        cfg.retry.backoff_cap_secs = 300;
        cfg.retry.probe_interval_secs = Some(RetryPolicy::MAX_WAIT_SECS + 1);
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        cfg.retry.probe_interval_secs = Some(RetryPolicy::MAX_WAIT_SECS);
        cfg.validate().unwrap();
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let c = Credentials::from_secret("hunter2");
        assert!(!format!("{c:?}").contains("hunter2"));
    }
}
