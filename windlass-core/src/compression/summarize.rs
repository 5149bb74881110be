//! Abstractive summary with an extractive fallback.

use async_trait::async_trait;
use std::sync::Arc;

use super::{
    CompressionOptions, CompressionStrategy, SegmentOutput, StrategyKind, ask_provider,
    render_transcript, summary_entry,
};
use crate::llm::LLMProvider;
use crate::message::ContextMessage;
use crate::text;
use crate::tokens::TokenEstimator;

const LOSS_ESTIMATE: f64 = 0.3;

/// Approximate tokens per kept sentence when sizing the extractive summary
const TOKENS_PER_SENTENCE: usize = 20;

const POSITION_WEIGHT: f64 = 0.3;
const LENGTH_WEIGHT: f64 = 0.7;

const SYSTEM_PROMPT: &str = "You compress conversation history for an AI assistant. \
Keep names, decisions, preferences, open questions and facts the assistant will need later. \
Answer with the summary only.";

/// LLM summary of the whole segment, one summary entry out
pub struct SummarizeStrategy {
    provider: Arc<dyn LLMProvider>,
}

impl SummarizeStrategy {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    async fn llm_summary(
        &self,
        segment: &[ContextMessage],
        target_tokens: usize,
    ) -> Option<String> {
        let prompt = format!(
            "Summarize the following conversation in at most {} tokens.\n\n{}",
            target_tokens,
            render_transcript(segment)
        );
        let summary = ask_provider(
            self.provider.as_ref(),
            StrategyKind::Summarize,
            SYSTEM_PROMPT,
            prompt,
            target_tokens,
        )
        .await?;

        let tokens = TokenEstimator::new().estimate(&summary);
        if tokens > target_tokens {
            tracing::warn!(
                tokens,
                target_tokens,
                "summary exceeds its budget, using extractive fallback"
            );
            return None;
        }
        Some(summary)
    }
}

#[async_trait]
impl CompressionStrategy for SummarizeStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Summarize
    }

    async fn compress_segment(
        &self,
        segment: &[ContextMessage],
        target_tokens: usize,
        options: &CompressionOptions,
    ) -> SegmentOutput {
        let (content, used_fallback) = match self.llm_summary(segment, target_tokens).await {
            Some(summary) => (summary, false),
            None => {
                tracing::debug!(entries = segment.len(), "running extractive summary");
                let texts: Vec<&str> = segment.iter().map(|m| m.content.as_str()).collect();
                (extractive_summary(&texts, target_tokens), true)
            }
        };

        let messages = if content.is_empty() {
            Vec::new()
        } else {
            vec![summary_entry(content, segment, StrategyKind::Summarize, options.now)]
        };

        SegmentOutput {
            messages,
            used_fallback,
            loss_estimate: LOSS_ESTIMATE,
        }
    }
}

/// Extractive summary of `texts` within `target_tokens`.
///
/// Sentences are scored `0.3 * position + 0.7 * length` (earlier and longer
/// score higher), the best `target_tokens / 20` are kept, and the survivors
/// are emitted in their original order while they fit the budget.
pub(crate) fn extractive_summary(texts: &[&str], target_tokens: usize) -> String {
    let estimator = TokenEstimator::new();
    let target_tokens = target_tokens.max(1);
    let sentences: Vec<String> = texts
        .iter()
        .flat_map(|t| text::split_sentences(t))
        .collect();

    if sentences.is_empty() {
        return String::new();
    }

    let count = sentences.len();
    let longest = sentences
        .iter()
        .map(|s| s.chars().count())
        .max()
        .unwrap_or(1)
        .max(1);

    let mut scored: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let position = 1.0 - i as f64 / count as f64;
            let length = s.chars().count() as f64 / longest as f64;
            (i, POSITION_WEIGHT * position + LENGTH_WEIGHT * length)
        })
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });

    let keep = (target_tokens / TOKENS_PER_SENTENCE).max(1);
    let mut chosen: Vec<usize> = scored.into_iter().take(keep).map(|(i, _)| i).collect();
    chosen.sort_unstable();

    let mut summary = String::new();
    for i in &chosen {
        let candidate = if summary.is_empty() {
            sentences[*i].clone()
        } else {
            format!("{} {}", summary, sentences[*i])
        };
        if estimator.estimate(&candidate) <= target_tokens {
            summary = candidate;
        }
    }

    if summary.is_empty() {
        // Not even one chosen sentence fits; cut the first one down
        summary = estimator.truncate_to_tokens(&sentences[chosen[0]], target_tokens);
    }
    summary
}
