// src/ingest/mod.rs
pub mod config;
pub mod providers;
pub mod scheduler;
pub mod types;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;
use regex::Regex;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_fetch_total", "Adapter fetch calls.");
        describe_counter!(
            "ingest_fetch_errors_total",
            "Adapter fetch failures, by error class."
        );
        describe_counter!(
            "ingest_observations_total",
            "Observations delivered to the alignment engine."
        );
        describe_counter!(
            "ingest_cycles_failed_total",
            "Poll cycles that exhausted their retry budget."
        );
        describe_counter!(
            "ingest_throttled_total",
            "Fetch attempts deferred by the rate governor."
        );
        describe_counter!(
            "ingest_quarantined_total",
            "Sources moved into quarantine."
        );
        describe_counter!(
            "align_duplicates_total",
            "Re-delivered observations merged as no-ops."
        );
        describe_counter!(
            "align_late_total",
            "Observations that arrived after their bucket closed."
        );
        describe_counter!(
            "align_records_emitted_total",
            "Aligned records produced by bucket closure."
        );
        describe_counter!("store_writes_total", "Durable store writes, by outcome.");
        describe_counter!(
            "store_write_retries_total",
            "Transient store write failures that were retried."
        );
        describe_gauge!(
            "ingest_queue_depth",
            "Observations waiting for the merge worker."
        );
        describe_histogram!("ingest_fetch_ms", "Adapter fetch time in milliseconds.");
        describe_histogram!("ingest_parse_ms", "Social payload scoring time in milliseconds.");
    });
}

/// Normalize social text before scoring: decode entities, drop tags and links,
/// collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode (Reddit bodies arrive with &amp; etc.)
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: OnceCell<Option<Regex>> = OnceCell::new();
    if let Some(re) = RE_TAGS.get_or_init(|| Regex::new(r"(?is)</?[^>]+>").ok()) {
        out = re.replace_all(&out, "").to_string();
    }

    // 3) Drop links; they carry no sentiment
    static RE_URLS: OnceCell<Option<Regex>> = OnceCell::new();
    if let Some(re) = RE_URLS.get_or_init(|| Regex::new(r"(?i)\bhttps?://\S+").ok()) {
        out = re.replace_all(&out, " ").to_string();
    }

    // 4) Normalize curly quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 5) Collapse whitespace
    out = out.split_whitespace().collect::<Vec<_>>().join(" ");

    // 6) Length cap: 2000 chars
    if out.chars().count() > 2000 {
        out = out.chars().take(2000).collect();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_strips_markup_and_links() {
        let s = "  <p>BTC&nbsp;&amp; ETH</p> see https://example.test/x?y=1   now ";
        assert_eq!(normalize_text(s), "BTC & ETH see now");
    }

    #[test]
    fn normalize_text_caps_length() {
        let s = "x".repeat(5_000);
        assert_eq!(normalize_text(&s).chars().count(), 2000);
    }
}
