//! Keyword extraction: keep only the concepts, drop the narrative.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use super::{
    CompressionOptions, CompressionStrategy, SegmentOutput, StrategyKind, ask_provider,
    render_transcript, summary_entry,
};
use crate::llm::LLMProvider;
use crate::message::ContextMessage;
use crate::text;
use crate::tokens::TokenEstimator;

const LOSS_ESTIMATE: f64 = 0.65;

/// Words of three characters or fewer are never keywords
const MIN_KEYWORD_CHARS: usize = 4;

const SYSTEM_PROMPT: &str = "You extract the key concepts, entities, decisions and facts \
from a conversation. Answer with a short bullet list and nothing else.";

pub struct KeywordExtractStrategy {
    provider: Arc<dyn LLMProvider>,
}

impl KeywordExtractStrategy {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    async fn llm_keywords(
        &self,
        segment: &[ContextMessage],
        target_tokens: usize,
    ) -> Option<String> {
        let prompt = format!(
            "List the key concepts and entities (at most {} tokens):\n\n{}",
            target_tokens,
            render_transcript(segment)
        );
        let answer = ask_provider(
            self.provider.as_ref(),
            StrategyKind::KeywordExtract,
            SYSTEM_PROMPT,
            prompt,
            target_tokens,
        )
        .await?;

        (TokenEstimator::new().estimate(&answer) <= target_tokens).then_some(answer)
    }
}

#[async_trait]
impl CompressionStrategy for KeywordExtractStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::KeywordExtract
    }

    async fn compress_segment(
        &self,
        segment: &[ContextMessage],
        target_tokens: usize,
        options: &CompressionOptions,
    ) -> SegmentOutput {
        let (content, used_fallback) = match self.llm_keywords(segment, target_tokens).await {
            Some(answer) => (answer, false),
            None => {
                let texts: Vec<&str> = segment.iter().map(|m| m.content.as_str()).collect();
                (keyword_sentences(&texts, target_tokens), true)
            }
        };

        let messages = if content.is_empty() {
            Vec::new()
        } else {
            vec![summary_entry(
                content,
                segment,
                StrategyKind::KeywordExtract,
                options.now,
            )]
        };

        SegmentOutput {
            messages,
            used_fallback,
            loss_estimate: LOSS_ESTIMATE,
        }
    }
}

/// Frequency-based fallback.
///
/// Ranks words longer than three characters by frequency, keeps the top
/// `target_tokens / 2`, then keeps sentences mentioning any of them until the
/// budget runs out. If no sentence fits, the keyword list itself is returned.
pub(crate) fn keyword_sentences(texts: &[&str], target_tokens: usize) -> String {
    let estimator = TokenEstimator::new();
    let target_tokens = target_tokens.max(1);

    let ranked = text::ranked_terms(texts.iter().copied(), MIN_KEYWORD_CHARS);
    if ranked.is_empty() {
        return String::new();
    }
    let limit = (target_tokens / 2).max(1);
    let keywords: Vec<String> = ranked.into_iter().take(limit).map(|(w, _)| w).collect();
    let keyword_set: HashSet<&str> = keywords.iter().map(String::as_str).collect();

    let mut kept = String::new();
    for sentence in texts.iter().flat_map(|t| text::split_sentences(t)) {
        let relevant = text::words(&sentence).any(|w| keyword_set.contains(w.as_str()));
        if !relevant {
            continue;
        }
        let candidate = if kept.is_empty() {
            sentence
        } else {
            format!("{} {}", kept, sentence)
        };
        if estimator.estimate(&candidate) > target_tokens {
            break;
        }
        kept = candidate;
    }

    if kept.is_empty() {
        let list = format!("Key topics: {}", keywords.join(", "));
        return estimator.truncate_to_tokens(&list, target_tokens);
    }
    kept
}
