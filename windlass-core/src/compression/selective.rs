//! Selective retention: keep a subset of messages verbatim.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{CompressionOptions, CompressionStrategy, SegmentOutput, StrategyKind, ask_provider};
use crate::llm::{LLMProvider, extract_json};
use crate::message::ContextMessage;
use crate::tokens::TokenEstimator;

const LOSS_ESTIMATE: f64 = 0.4;

/// Fallback keeps every n-th message
const FALLBACK_STRIDE: usize = 3;

const SYSTEM_PROMPT: &str = "You decide which conversation messages must be kept verbatim. \
Answer with a JSON array of message indices and nothing else.";

pub struct SelectiveStrategy {
    provider: Arc<dyn LLMProvider>,
}

impl SelectiveStrategy {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self { provider }
    }

    async fn llm_selection(&self, segment: &[ContextMessage]) -> Option<Vec<usize>> {
        let listing = segment
            .iter()
            .enumerate()
            .map(|(i, m)| format!("[{}] {}: {}", i, m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Which of these messages hold information worth keeping word for word?\n\n{}",
            listing
        );
        let answer = ask_provider(
            self.provider.as_ref(),
            StrategyKind::Selective,
            SYSTEM_PROMPT,
            prompt,
            64,
        )
        .await?;

        let indices = parse_indices(&answer, segment.len());
        if indices.is_empty() {
            tracing::warn!("selection answer named no valid indices, using fallback");
            return None;
        }
        Some(indices)
    }
}

/// Valid, de-duplicated, ascending indices from a JSON array (or an object
/// holding one)
fn parse_indices(answer: &str, len: usize) -> Vec<usize> {
    let Some(value) = extract_json(answer) else {
        return Vec::new();
    };
    let array = match &value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => match map.values().find_map(|v| v.as_array()) {
            Some(items) => items,
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    array
        .iter()
        .filter_map(|v| v.as_u64())
        .map(|i| i as usize)
        .filter(|i| *i < len)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[async_trait]
impl CompressionStrategy for SelectiveStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Selective
    }

    async fn compress_segment(
        &self,
        segment: &[ContextMessage],
        target_tokens: usize,
        _options: &CompressionOptions,
    ) -> SegmentOutput {
        let (indices, used_fallback) = match self.llm_selection(segment).await {
            Some(indices) => (indices, false),
            None => (
                (0..segment.len()).step_by(FALLBACK_STRIDE).collect(),
                true,
            ),
        };

        let estimator = TokenEstimator::new();
        let mut budget_left = target_tokens;
        let mut messages = Vec::new();
        for i in indices {
            let tokens = estimator.message_tokens(&segment[i]);
            if tokens > budget_left {
                continue;
            }
            budget_left -= tokens;

            let mut kept = segment[i].clone();
            kept.token_count = tokens;
            kept.metadata.insert("selected".to_string(), true.into());
            messages.push(kept);
        }

        SegmentOutput {
            messages,
            used_fallback,
            loss_estimate: LOSS_ESTIMATE,
        }
    }
}
