//! # Text scoring
//! Turns social text into a sentiment score in `[-1.0, 1.0]`.
//!
//! Scoring is a pluggable collaborator of the social adapters: anything that
//! implements [`TextScorer`] can be injected. The default [`LexiconScorer`]
//! sums word weights from an embedded lexicon, flips the sign of words that
//! follow a negator, and squashes the raw sum into the unit interval.

use once_cell::sync::Lazy;
use std::collections::HashMap;

static LEXICON: Lazy<HashMap<String, i32>> = Lazy::new(|| {
    let raw = include_str!("../sentiment_lexicon.json");
    serde_json::from_str::<HashMap<String, i32>>(raw).unwrap_or_default()
});

/// Squash constant: raw sum `s` maps to `s / sqrt(s^2 + ALPHA)`.
const ALPHA: f64 = 15.0;

pub trait TextScorer: Send + Sync {
    /// Score in `[-1.0, 1.0]`; 0.0 for neutral or empty text.
    fn score(&self, text: &str) -> f64;
}

#[derive(Debug, Clone, Default)]
pub struct LexiconScorer;

impl LexiconScorer {
    pub fn new() -> Self {
        Self
    }

    #[inline]
    fn word_score(&self, w: &str) -> i32 {
        LEXICON.get(w).copied().unwrap_or(0)
    }

    /// Returns (raw lexicon sum, token count).
    /// A negator within the previous 1..=3 tokens inverts a word's sign.
    pub fn raw_score(&self, text: &str) -> (i32, usize) {
        let tokens: Vec<String> = tokenize(text).collect();
        let mut score: i32 = 0;

        for i in 0..tokens.len() {
            let base = self.word_score(tokens[i].as_str());
            if base == 0 {
                continue;
            }
            let negated = (1..=3).any(|k| i >= k && is_negator(tokens[i - k].as_str()));
            score += if negated { -base } else { base };
        }

        (score, tokens.len())
    }
}

impl TextScorer for LexiconScorer {
    fn score(&self, text: &str) -> f64 {
        let (raw, _) = self.raw_score(text);
        if raw == 0 {
            return 0.0;
        }
        let s = f64::from(raw);
        (s / (s * s + ALPHA).sqrt()).clamp(-1.0, 1.0)
    }
}

/// Alphanumeric lower-case tokens.
fn tokenize(s: &str) -> impl Iterator<Item = String> + '_ {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Contractions arrive split ("isn't" -> "isn", "t"), so the stems are listed.
fn is_negator(tok: &str) -> bool {
    matches!(
        tok,
        "not"
            | "no"
            | "never"
            | "without"
            | "cannot"
            | "nor"
            | "isn"
            | "wasn"
            | "aren"
            | "don"
            | "doesn"
            | "didn"
            | "won"
            | "wouldn"
            | "shouldn"
            | "couldn"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexicon_is_embedded() {
        assert!(LEXICON.len() > 20);
    }

    #[test]
    fn bullish_and_bearish_text_have_opposite_signs() {
        let s = LexiconScorer::new();
        assert!(s.score("BTC breakout, very bullish rally") > 0.5);
        assert!(s.score("exchange hack, total crash, rekt") < -0.5);
        assert_eq!(s.score("the block height is 800000"), 0.0);
    }

    #[test]
    fn negation_flips_sign() {
        let s = LexiconScorer::new();
        let (pos, _) = s.raw_score("this is bullish");
        let (neg, _) = s.raw_score("this isn't bullish at all");
        assert_eq!(pos, -neg);
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let s = LexiconScorer::new();
        let text = "moon ".repeat(500);
        let v = s.score(&text);
        assert!(v > 0.99 && v <= 1.0);
    }
}
