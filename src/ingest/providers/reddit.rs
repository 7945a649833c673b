// src/ingest/providers/reddit.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::histogram;
use reqwest::Client;
use serde::Deserialize;

use crate::ingest::config::{ConfigError, SourceConfig};
use crate::ingest::normalize_text;
use crate::ingest::providers::{aggregate_scored, decode_json, get_json, http_client, ScoredPost};
use crate::ingest::types::{Entity, FetchError, Observation, SourceAdapter};
use crate::sentiment::TextScorer;

const DEFAULT_BASE_URL: &str = "https://www.reddit.com";
const DEFAULT_USER_AGENT: &str = "cryptopulse-ingest/0.1";
const PAGE_LIMIT: &str = "100";
// Comment trees fetched per `fetch`, newest matching posts first.
const COMMENT_POSTS_PER_FETCH: usize = 10;
const MAX_COMMENT_DEPTH: usize = 16;

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}
#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    children: Vec<Child>,
}
#[derive(Debug, Deserialize)]
struct Child {
    data: Post,
}
#[derive(Debug, Deserialize)]
struct Post {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    selftext: String,
    created_utc: f64,
}

/// One element of the `/comments/{id}.json` array.
#[derive(Debug, Deserialize)]
struct CommentListing {
    data: CommentListingData,
}
#[derive(Debug, Deserialize)]
struct CommentListingData {
    #[serde(default)]
    children: Vec<CommentChild>,
}
#[derive(Debug, Deserialize)]
struct CommentChild {
    kind: String,
    data: Comment,
}
#[derive(Debug, Deserialize)]
struct Comment {
    #[serde(default)]
    id: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    created_utc: Option<f64>,
    /// Either `""` or a nested listing.
    #[serde(default)]
    replies: serde_json::Value,
}

enum Mode {
    Fixture {
        listing: String,
        comments: HashMap<String, String>,
    },
    Http {
        client: Client,
        base_url: String,
        user_agent: String,
        bearer: Option<String>,
    },
}

/// Newest posts of a set of subreddits, scored per asset mention.
pub struct RedditAdapter {
    id: String,
    subreddits: Vec<String>,
    scorer: Arc<dyn TextScorer>,
    include_comments: bool,
    mode: Mode,
}

impl RedditAdapter {
    /// The fixture stands in for every subreddit listing.
    pub fn from_fixture(id: impl Into<String>, body: &str, scorer: Arc<dyn TextScorer>) -> Self {
        Self {
            id: id.into(),
            subreddits: vec!["fixture".to_string()],
            scorer,
            include_comments: false,
            mode: Mode::Fixture {
                listing: body.to_string(),
                comments: HashMap::new(),
            },
        }
    }

    /// Registers the comment tree served for `post_id` and turns comment
    /// scoring on. Posts without a registered tree have no comments.
    pub fn with_comment_fixture(mut self, post_id: &str, body: &str) -> Self {
        if let Mode::Fixture { comments, .. } = &mut self.mode {
            comments.insert(post_id.to_string(), body.to_string());
            self.include_comments = true;
        }
        self
    }

    pub fn from_config(src: &SourceConfig, scorer: Arc<dyn TextScorer>) -> Result<Self, ConfigError> {
        Ok(Self {
            id: src.id.clone(),
            subreddits: src.subreddits.clone(),
            scorer,
            include_comments: src.include_comments,
            mode: Mode::Http {
                client: http_client(&src.id)?,
                base_url: src
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
                user_agent: src
                    .user_agent
                    .clone()
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
                bearer: src.credentials.secret().map(str::to_string),
            },
        })
    }

    async fn listing(&self, subreddit: &str) -> Result<Listing, FetchError> {
        match &self.mode {
            Mode::Fixture { listing, .. } => decode_json(listing.as_bytes(), "reddit"),
            Mode::Http {
                client,
                base_url,
                user_agent,
                bearer,
            } => {
                let mut req = client
                    .get(format!("{base_url}/r/{subreddit}/new.json"))
                    .query(&[("limit", PAGE_LIMIT), ("raw_json", "1")])
                    .header(reqwest::header::USER_AGENT, user_agent.as_str());
                if let Some(token) = bearer {
                    req = req.bearer_auth(token);
                }
                get_json(req, "reddit").await
            }
        }
    }

    async fn comment_tree(&self, post_id: &str) -> Result<Vec<CommentListing>, FetchError> {
        match &self.mode {
            Mode::Fixture { comments, .. } => match comments.get(post_id) {
                Some(body) => decode_json(body.as_bytes(), "reddit comments"),
                None => Ok(Vec::new()),
            },
            Mode::Http {
                client,
                base_url,
                user_agent,
                bearer,
            } => {
                let mut req = client
                    .get(format!("{base_url}/comments/{post_id}.json"))
                    .query(&[("raw_json", "1")])
                    .header(reqwest::header::USER_AGENT, user_agent.as_str());
                if let Some(token) = bearer {
                    req = req.bearer_auth(token);
                }
                get_json(req, "reddit comments").await
            }
        }
    }

    /// Scores every comment under a post. The post already matched the
    /// entity, so comments are not filtered by mention again.
    fn score_comments(&self, post_id: &str, tree: Vec<CommentListing>) -> Vec<ScoredPost> {
        let mut out = Vec::new();
        // Element 0 is the post itself.
        for listing in tree.into_iter().skip(1) {
            self.walk_comments(post_id, listing.data.children, 0, &mut out);
        }
        out
    }

    fn walk_comments(&self, post_id: &str, children: Vec<CommentChild>, depth: usize, out: &mut Vec<ScoredPost>) {
        if depth >= MAX_COMMENT_DEPTH {
            return;
        }
        for child in children {
            if child.kind != "t1" {
                continue;
            }
            let c = child.data;
            let text = match c.body.trim() {
                "[deleted]" | "[removed]" => String::new(),
                body => normalize_text(body),
            };
            let created_at = c
                .created_utc
                .and_then(|t| DateTime::from_timestamp(t.floor() as i64, 0));
            match created_at {
                Some(created_at) if !text.is_empty() => out.push(ScoredPost {
                    id: format!("{post_id}/{}", c.id),
                    created_at,
                    score: self.scorer.score(&text),
                }),
                _ => {}
            }
            if c.replies.is_object() {
                match serde_json::from_value::<CommentListing>(c.replies) {
                    Ok(nested) => self.walk_comments(post_id, nested.data.children, depth + 1, out),
                    Err(e) => {
                        tracing::debug!(target: "ingest", post = post_id, error = %e, "skipping malformed replies")
                    }
                }
            }
        }
    }

    fn score_posts(&self, listing: Listing, entity: &Entity) -> Vec<ScoredPost> {
        listing
            .data
            .children
            .into_iter()
            .filter_map(|c| {
                let p = c.data;
                let text = normalize_text(&format!("{}. {}", p.title, p.selftext));
                if text.is_empty() || !entity.mentioned_in(&text) {
                    return None;
                }
                let created_at = DateTime::from_timestamp(p.created_utc.floor() as i64, 0)?;
                Some(ScoredPost {
                    id: p.id,
                    created_at,
                    score: self.scorer.score(&text),
                })
            })
            .collect()
    }
}

#[async_trait]
impl SourceAdapter for RedditAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fetch(
        &self,
        entity: &Entity,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>, FetchError> {
        let mut posts = Vec::new();
        for sub in &self.subreddits {
            let listing = self.listing(sub).await?;
            let t0 = std::time::Instant::now();
            posts.extend(self.score_posts(listing, entity));
            histogram!("ingest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);
        }
        // Cross-posts show up once per subreddit.
        posts.sort_by(|a, b| a.id.cmp(&b.id));
        posts.dedup_by(|a, b| a.id == b.id);

        if self.include_comments {
            let mut newest: Vec<(String, DateTime<Utc>)> =
                posts.iter().map(|p| (p.id.clone(), p.created_at)).collect();
            newest.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            for (post_id, _) in newest.into_iter().take(COMMENT_POSTS_PER_FETCH) {
                let tree = self.comment_tree(&post_id).await?;
                posts.extend(self.score_comments(&post_id, tree));
            }
        }
        Ok(aggregate_scored(&self.id, &entity.symbol, posts, since))
    }
}
