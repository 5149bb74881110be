//! Semantic clustering: group entries by theme, summarize each theme.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::summarize::extractive_summary;
use super::{
    CompressionOptions, CompressionStrategy, SegmentOutput, StrategyKind, ask_provider,
    render_transcript, summary_entry,
};
use crate::llm::{LLMProvider, extract_json};
use crate::message::ContextMessage;
use crate::text;
use crate::tokens::TokenEstimator;

const LOSS_ESTIMATE: f64 = 0.5;

/// Minimum characters for a word to name a pseudo-topic
const MIN_TOPIC_CHARS: usize = 5;

const GENERAL_TOPIC: &str = "general";

const SYSTEM_PROMPT: &str = "You group conversation content into a few labeled themes. \
Answer with a JSON array of objects with \"theme\" and \"summary\" fields.";

#[derive(Debug, Deserialize)]
struct Theme {
    theme: String,
    summary: String,
}

pub struct SemanticClusterStrategy {
    provider: Arc<dyn LLMProvider>,
}

impl SemanticClusterStrategy {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    async fn llm_themes(
        &self,
        segment: &[ContextMessage],
        target_tokens: usize,
    ) -> Option<Vec<(String, String)>> {
        let prompt = format!(
            "Group this conversation into themes, at most {} tokens in total:\n\n{}",
            target_tokens,
            render_transcript(segment)
        );
        let answer = ask_provider(
            self.provider.as_ref(),
            StrategyKind::SemanticCluster,
            SYSTEM_PROMPT,
            prompt,
            target_tokens,
        )
        .await?;

        let themes = parse_themes(&answer);
        if themes.is_empty() {
            tracing::warn!("cluster answer had no usable themes, using fallback");
            return None;
        }
        Some(themes)
    }
}

/// Read themes from a JSON array, or from `theme: summary` lines
fn parse_themes(answer: &str) -> Vec<(String, String)> {
    if let Some(value) = extract_json(answer) {
        if let Ok(themes) = serde_json::from_value::<Vec<Theme>>(value) {
            return themes
                .into_iter()
                .filter(|t| !t.theme.trim().is_empty() && !t.summary.trim().is_empty())
                .map(|t| (t.theme.trim().to_string(), t.summary.trim().to_string()))
                .collect();
        }
    }

    answer
        .lines()
        .filter_map(|line| {
            let line = line.trim().trim_start_matches(['-', '*']).trim();
            let (theme, summary) = line.split_once(':')?;
            let (theme, summary) = (theme.trim(), summary.trim());
            (!theme.is_empty() && !summary.is_empty())
                .then(|| (theme.to_string(), summary.to_string()))
        })
        .collect()
}

fn render_themes(themes: &[(String, String)]) -> String {
    themes
        .iter()
        .map(|(theme, summary)| format!("{}: {}", theme, summary))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl CompressionStrategy for SemanticClusterStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SemanticCluster
    }

    async fn compress_segment(
        &self,
        segment: &[ContextMessage],
        target_tokens: usize,
        options: &CompressionOptions,
    ) -> SegmentOutput {
        let estimator = TokenEstimator::new();

        let llm = match self.llm_themes(segment, target_tokens).await {
            Some(themes) => {
                let rendered = render_themes(&themes);
                (estimator.estimate(&rendered) <= target_tokens).then_some(themes)
            }
            None => None,
        };
        let used_fallback = llm.is_none();
        let themes = llm.unwrap_or_else(|| frequency_clusters(segment, target_tokens));

        let content = estimator.truncate_to_tokens(&render_themes(&themes), target_tokens.max(1));
        if content.is_empty() {
            return SegmentOutput {
                used_fallback,
                loss_estimate: LOSS_ESTIMATE,
                ..Default::default()
            };
        }

        let topics: Vec<serde_json::Value> =
            themes.iter().map(|(t, _)| t.clone().into()).collect();
        let entry = summary_entry(content, segment, StrategyKind::SemanticCluster, options.now)
            .with_meta("topics", topics);

        SegmentOutput {
            messages: vec![entry],
            used_fallback,
            loss_estimate: LOSS_ESTIMATE,
        }
    }
}

/// Bucket entries by their most frequent long word, then summarize each
/// bucket extractively with an equal share of the budget.
fn frequency_clusters(segment: &[ContextMessage], target_tokens: usize) -> Vec<(String, String)> {
    let mut buckets: Vec<(String, Vec<&str>)> = Vec::new();

    for message in segment {
        let topic = text::ranked_terms([message.content.as_str()], MIN_TOPIC_CHARS)
            .into_iter()
            .next()
            .map(|(word, _)| word)
            .unwrap_or_else(|| GENERAL_TOPIC.to_string());

        match buckets.iter_mut().find(|(t, _)| *t == topic) {
            Some((_, texts)) => texts.push(message.content.as_str()),
            None => buckets.push((topic, vec![message.content.as_str()])),
        }
    }

    if buckets.is_empty() {
        return Vec::new();
    }
    let per_bucket = (target_tokens / buckets.len()).max(1);
    tracing::debug!(buckets = buckets.len(), per_bucket, "clustering by term frequency");

    buckets
        .into_iter()
        .filter_map(|(topic, texts)| {
            let summary = extractive_summary(&texts, per_bucket);
            (!summary.is_empty()).then_some((topic, summary))
        })
        .collect()
}
