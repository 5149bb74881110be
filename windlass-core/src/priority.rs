//! Priority scoring for eviction ordering.
//!
//! Each entry gets five sub-scores in [0, 1] (recency, frequency, importance,
//! user interaction, sentiment) combined by a weighted sum. Scores only rank
//! entries within one session; they carry no meaning across sessions and are
//! never used to reorder retained entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{Result, WindlassError};
use crate::message::{ContextMessage, MessageRole};
use crate::text;

/// Minimum characters for a word to count as a topic term
const TERM_MIN_CHARS: usize = 4;

const IMPORTANCE_MARKERS: &[&str] = &[
    "important",
    "remember",
    "decided",
    "decision",
    "prefer",
    "preference",
    "always",
    "never",
    "must",
    "deadline",
    "my name",
    "call me",
    "agreed",
    "requirement",
];

const SENTIMENT_LEXICON: &[&str] = &[
    "love",
    "hate",
    "angry",
    "upset",
    "frustrated",
    "furious",
    "happy",
    "thrilled",
    "excited",
    "worried",
    "afraid",
    "scared",
    "sad",
    "terrible",
    "awful",
    "amazing",
    "wonderful",
    "urgent",
    "thank",
    "sorry",
];

/// Weights for the five sub-scores.
///
/// They should sum to 1.0; this is not enforced, but scores are only
/// comparable when one session uses consistent weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub recency: f64,
    pub frequency: f64,
    pub importance: f64,
    pub user_interaction: f64,
    pub sentiment: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            recency: 0.30,
            frequency: 0.20,
            importance: 0.30,
            user_interaction: 0.10,
            sentiment: 0.10,
        }
    }
}

impl PriorityWeights {
    /// Sum of all weights
    pub fn total(&self) -> f64 {
        self.recency + self.frequency + self.importance + self.user_interaction + self.sentiment
    }

    /// Reject negative or non-finite weights
    pub fn validate(&self) -> Result<()> {
        let weights = [
            self.recency,
            self.frequency,
            self.importance,
            self.user_interaction,
            self.sentiment,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(WindlassError::Validation(
                "priority weights must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-factor breakdown of a priority score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityBreakdown {
    pub recency: f64,
    pub frequency: f64,
    pub importance: f64,
    pub user_interaction: f64,
    pub sentiment: f64,
}

impl PriorityBreakdown {
    /// Weighted sum of the sub-scores
    pub fn weighted(&self, weights: &PriorityWeights) -> f64 {
        self.recency * weights.recency
            + self.frequency * weights.frequency
            + self.importance * weights.importance
            + self.user_interaction * weights.user_interaction
            + self.sentiment * weights.sentiment
    }
}

/// Term document frequencies across the entries being ranked
#[derive(Debug, Clone, Default)]
pub struct TermStats {
    document_frequency: HashMap<String, usize>,
}

impl TermStats {
    /// Count, for every term, how many entries mention it
    pub fn from_messages<'a, I>(messages: I) -> Self
    where
        I: IntoIterator<Item = &'a ContextMessage>,
    {
        let mut document_frequency = HashMap::new();
        for message in messages {
            for term in Self::terms(&message.content) {
                *document_frequency.entry(term).or_insert(0) += 1;
            }
        }
        Self { document_frequency }
    }

    fn terms(content: &str) -> HashSet<String> {
        text::content_words(content, TERM_MIN_CHARS).collect()
    }

    /// Share of `content`'s terms that also appear in at least one other entry
    fn recurrence(&self, content: &str) -> f64 {
        let terms = Self::terms(content);
        if terms.is_empty() {
            return 0.0;
        }
        let recurring = terms
            .iter()
            .filter(|t| self.document_frequency.get(*t).copied().unwrap_or(0) > 1)
            .count();
        recurring as f64 / terms.len() as f64
    }
}

/// Weighted multi-factor importance scorer
#[derive(Debug, Clone)]
pub struct PriorityScorer {
    weights: PriorityWeights,
    half_life: Duration,
}

impl Default for PriorityScorer {
    fn default() -> Self {
        Self::new(PriorityWeights::default(), Duration::from_secs(24 * 3600))
    }
}

impl PriorityScorer {
    pub fn new(weights: PriorityWeights, half_life: Duration) -> Self {
        Self { weights, half_life }
    }

    /// Build from configuration
    pub fn from_config(config: &crate::config::PriorityConfig) -> Self {
        Self::new(config.weights, config.recency_half_life)
    }

    pub fn weights(&self) -> &PriorityWeights {
        &self.weights
    }

    /// Score one entry against the terms of its session
    pub fn score(&self, entry: &ContextMessage, now: DateTime<Utc>, stats: &TermStats) -> f64 {
        self.breakdown(entry, now, stats).weighted(&self.weights)
    }

    /// Compute every sub-score for one entry
    pub fn breakdown(
        &self,
        entry: &ContextMessage,
        now: DateTime<Utc>,
        stats: &TermStats,
    ) -> PriorityBreakdown {
        PriorityBreakdown {
            recency: self.recency(entry, now),
            frequency: stats.recurrence(&entry.content),
            importance: Self::importance(entry),
            user_interaction: Self::user_interaction(entry.role),
            sentiment: Self::sentiment(&entry.content),
        }
    }

    /// Indices of `entries` ordered for eviction: lowest score first, ties
    /// broken by earlier timestamp, then earlier position.
    pub fn rank_for_eviction(&self, entries: &[ContextMessage], now: DateTime<Utc>) -> Vec<usize> {
        let stats = TermStats::from_messages(entries);
        let scores: Vec<f64> = entries
            .iter()
            .map(|e| self.score(e, now, &stats))
            .collect();

        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by(|&a, &b| {
            scores[a]
                .partial_cmp(&scores[b])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(entries[a].timestamp.cmp(&entries[b].timestamp))
                .then(a.cmp(&b))
        });
        order
    }

    /// Exponential decay: 1.0 now, 0.5 after one half-life
    fn recency(&self, entry: &ContextMessage, now: DateTime<Utc>) -> f64 {
        let age_secs = now
            .signed_duration_since(entry.timestamp)
            .num_milliseconds()
            .max(0) as f64
            / 1000.0;
        let half_life = self.half_life.as_secs_f64();
        if half_life <= 0.0 {
            return if age_secs == 0.0 { 1.0 } else { 0.0 };
        }
        0.5f64.powf(age_secs / half_life).clamp(0.0, 1.0)
    }

    fn importance(entry: &ContextMessage) -> f64 {
        // Externally supplied rating wins (0-1, or 0-10 from an LLM judge)
        if let Some(rating) = entry.meta_f64("importance") {
            let normalized = if rating > 1.0 { rating / 10.0 } else { rating };
            return normalized.clamp(0.0, 1.0);
        }

        let lower = entry.content.to_lowercase();
        let hits = IMPORTANCE_MARKERS
            .iter()
            .filter(|marker| lower.contains(*marker))
            .count();

        let mut score = hits as f64 * 0.25;
        if entry.meta_bool("pinned") == Some(true) {
            score += 0.5;
        }
        if entry.is_summary() {
            score += 0.3;
        }
        score.min(1.0)
    }

    fn user_interaction(role: MessageRole) -> f64 {
        match role {
            MessageRole::User => 1.0,
            MessageRole::Assistant => 0.4,
            MessageRole::System => 0.2,
        }
    }

    fn sentiment(content: &str) -> f64 {
        let lexicon_hits = text::words(content)
            .filter(|w| SENTIMENT_LEXICON.iter().any(|s| w.starts_with(s)))
            .count();
        let exclamations = content.matches('!').count();
        let shouted = content
            .split_whitespace()
            .filter(|w| w.chars().count() >= 3 && w.chars().all(|c| c.is_uppercase()))
            .count();

        (lexicon_hits as f64 * 0.2 + exclamations as f64 * 0.1 + shouted as f64 * 0.15).min(1.0)
    }
}
