// tests/providers_fixtures.rs
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cryptopulse_ingest::ingest::providers::coingecko::CoinGeckoAdapter;
use cryptopulse_ingest::ingest::providers::reddit::RedditAdapter;
use cryptopulse_ingest::ingest::providers::twitter::TwitterAdapter;
use cryptopulse_ingest::sentiment::LexiconScorer;
use cryptopulse_ingest::{Entity, SourceAdapter, ValueKind};

const COINGECKO: &str = include_str!("fixtures/coingecko_simple_price.json");
const REDDIT: &str = include_str!("fixtures/reddit_new.json");
const TWITTER: &str = include_str!("fixtures/twitter_search.json");
const REDDIT_COMMENTS_P1: &str = include_str!("fixtures/reddit_comments_p1.json");

fn at(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

fn btc() -> Entity {
    Entity::new("btc").with_aliases(["Bitcoin"])
}

#[tokio::test]
async fn coingecko_quotes_become_price_observations() {
    let a = CoinGeckoAdapter::from_fixture("coingecko", COINGECKO);

    let out = a.fetch(&btc(), None).await.unwrap();
    assert_eq!(out.len(), 1);
    let o = &out[0];
    assert_eq!(o.source_id, "coingecko");
    assert_eq!(o.entity_symbol, "BTC");
    assert_eq!(o.value_kind, ValueKind::Price);
    assert_eq!(o.timestamp, at(1_700_000_010));
    assert!((o.value - 37012.5).abs() < 1e-9);

    // Quote not newer than `since` is dropped.
    assert!(a.fetch(&btc(), Some(at(1_700_000_010))).await.unwrap().is_empty());
    // Coin absent from the response.
    assert!(a.fetch(&Entity::new("DOGE"), None).await.unwrap().is_empty());

    // Missing last_updated_at falls back to fetch time.
    let before = Utc::now() - chrono::Duration::seconds(1);
    let sol = a.fetch(&Entity::new("SOL"), None).await.unwrap();
    assert_eq!(sol.len(), 1);
    assert!(sol[0].timestamp >= before);
}

#[tokio::test]
async fn reddit_posts_are_filtered_by_mention_and_grouped_per_second() {
    let a = RedditAdapter::from_fixture("reddit", REDDIT, Arc::new(LexiconScorer::new()));

    let out = a.fetch(&btc(), None).await.unwrap();
    assert_eq!(out.len(), 2);
    assert!(out.iter().all(|o| o.value_kind == ValueKind::SentimentScore));
    assert!(out.iter().all(|o| (-1.0..=1.0).contains(&o.value)));

    assert_eq!(out[0].timestamp, at(1_700_000_100));
    assert_eq!(out[0].raw_payload_ref.as_deref(), Some("reddit:p1,p2"));
    // Fractional created_utc is truncated to the second.
    assert_eq!(out[1].timestamp, at(1_700_000_400));
    assert!(out[1].value > 0.0);

    // The bare symbol does not match "Bitcoin".
    let bare = a.fetch(&Entity::new("BTC"), None).await.unwrap();
    assert_eq!(bare.len(), 1);
    assert_eq!(bare[0].raw_payload_ref.as_deref(), Some("reddit:p1"));

    let newer = a.fetch(&btc(), Some(at(1_700_000_100))).await.unwrap();
    assert_eq!(newer.len(), 1);
    assert_eq!(newer[0].timestamp, at(1_700_000_400));

    let eth = a.fetch(&Entity::new("ETH"), None).await.unwrap();
    assert_eq!(eth.len(), 1);
    assert!(eth[0].value > 0.0);
}

#[tokio::test]
async fn reddit_comment_trees_are_scored_when_enabled() {
    let a = RedditAdapter::from_fixture("reddit", REDDIT, Arc::new(LexiconScorer::new()))
        .with_comment_fixture("p1", REDDIT_COMMENTS_P1);

    let out = a.fetch(&btc(), None).await.unwrap();
    assert_eq!(out.len(), 3);

    // Top-level comment shares the posts' second.
    assert_eq!(out[0].timestamp, at(1_700_000_100));
    assert_eq!(out[0].raw_payload_ref.as_deref(), Some("reddit:p1,p1/c1,p2"));
    // Nested reply; deleted comments and "more" stubs are skipped.
    assert_eq!(out[1].timestamp, at(1_700_000_250));
    assert_eq!(out[1].raw_payload_ref.as_deref(), Some("reddit:p1/c2"));
    assert!(out[1].value < 0.0);
    assert_eq!(out[2].timestamp, at(1_700_000_400));

    // Comments only follow posts that matched the entity.
    let eth = a.fetch(&Entity::new("ETH"), None).await.unwrap();
    assert_eq!(eth.len(), 1);
    assert_eq!(eth[0].raw_payload_ref.as_deref(), Some("reddit:p3"));

    let newer = a.fetch(&btc(), Some(at(1_700_000_200))).await.unwrap();
    assert_eq!(newer.len(), 2);
    assert_eq!(newer[0].timestamp, at(1_700_000_250));

    let broken = RedditAdapter::from_fixture("reddit", REDDIT, Arc::new(LexiconScorer::new()))
        .with_comment_fixture("p1", "{not json");
    assert!(matches!(
        broken.fetch(&btc(), None).await,
        Err(cryptopulse_ingest::FetchError::SourceUnavailable(_))
    ));
}

#[tokio::test]
async fn twitter_search_results_are_scored() {
    let a = TwitterAdapter::from_fixture("twitter", TWITTER, Arc::new(LexiconScorer::new()));

    let out = a.fetch(&btc(), None).await.unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].timestamp, at(1_700_000_100));
    assert_eq!(
        out[0].raw_payload_ref.as_deref(),
        Some("twitter:1725000000000000001,1725000000000000002")
    );
    // One bullish and one mildly bearish tweet.
    assert!(out[0].value > 0.0 && out[0].value < 1.0);
    // "gm #BTC" carries no lexicon words.
    assert_eq!(out[1].timestamp, at(1_700_000_430));
    assert_eq!(out[1].value, 0.0);

    let newer = a.fetch(&btc(), Some(at(1_700_000_100))).await.unwrap();
    assert_eq!(newer.len(), 1);
}

#[tokio::test]
async fn malformed_bodies_are_source_unavailable() {
    let a = CoinGeckoAdapter::from_fixture("coingecko", "<html>maintenance</html>");
    let err = a.fetch(&btc(), None).await.unwrap_err();
    assert!(matches!(
        err,
        cryptopulse_ingest::FetchError::SourceUnavailable(_)
    ));
}
