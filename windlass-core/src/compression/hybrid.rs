//! Hybrid dispatcher.
//!
//! Long segments, and segments that already fold in an earlier summary, are
//! summarized wholesale. Shorter ones keep the important early messages
//! verbatim (selective) and summarize the rest.

use async_trait::async_trait;
use std::sync::Arc;

use super::selective::SelectiveStrategy;
use super::summarize::SummarizeStrategy;
use super::{CompressionOptions, CompressionStrategy, SegmentOutput, StrategyKind};
use crate::llm::LLMProvider;
use crate::message::ContextMessage;

const LOSS_ESTIMATE: f64 = 0.3;

pub struct HybridStrategy {
    summarize: SummarizeStrategy,
    selective: SelectiveStrategy,
}

impl HybridStrategy {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            summarize: SummarizeStrategy::new(provider.clone()),
            selective: SelectiveStrategy::new(provider),
        }
    }
}

#[async_trait]
impl CompressionStrategy for HybridStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Hybrid
    }

    async fn compress_segment(
        &self,
        segment: &[ContextMessage],
        target_tokens: usize,
        options: &CompressionOptions,
    ) -> SegmentOutput {
        let hybrid = options.hybrid;
        let has_summary = segment.iter().any(ContextMessage::is_summary);

        if segment.len() > hybrid.summarize_above_entries || has_summary {
            tracing::debug!(
                entries = segment.len(),
                has_summary,
                "hybrid delegating to summarize"
            );
            let mut output = self
                .summarize
                .compress_segment(segment, target_tokens, options)
                .await;
            output.loss_estimate = LOSS_ESTIMATE;
            return output;
        }

        let share = hybrid.selective_share.clamp(0.0, 1.0);
        let split = ((segment.len() as f64) * share).round() as usize;
        let (early, late) = segment.split_at(split.min(segment.len()));
        let selective_budget = ((target_tokens as f64) * share) as usize;
        let summary_budget = target_tokens.saturating_sub(selective_budget);
        tracing::debug!(
            selective = early.len(),
            summarized = late.len(),
            "hybrid splitting segment"
        );

        let mut output = SegmentOutput {
            loss_estimate: LOSS_ESTIMATE,
            ..Default::default()
        };

        if !early.is_empty() {
            let selected = self
                .selective
                .compress_segment(early, selective_budget, options)
                .await;
            output.used_fallback |= selected.used_fallback;
            output.messages.extend(selected.messages);
        }
        if !late.is_empty() {
            let summary = self
                .summarize
                .compress_segment(late, summary_budget.max(1), options)
                .await;
            output.used_fallback |= summary.used_fallback;
            output.messages.extend(summary.messages.into_iter().map(|mut m| {
                m.metadata
                    .insert("strategy".to_string(), StrategyKind::Hybrid.as_str().into());
                m
            }));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::HybridConfig;

    #[tokio::test]
    async fn test_long_segment_is_summarized_wholesale() {
        let strategy = HybridStrategy::new(Arc::new(FailingProvider));
        let entries = conversation(30, 30);
        let options = CompressionOptions::default().with_preserve_last_n(5);

        let result = strategy.compress(&entries, 400, &options).await;
        assert!(result.success);
        assert_eq!(result.compressed_messages().len(), 1);
        assert!(result.compressed_messages()[0].is_summary());
        assert_eq!(result.preserved_count, 5);
        assert_eq!(result.strategy, StrategyKind::Hybrid);
    }

    #[tokio::test]
    async fn test_prior_summary_forces_summarize() {
        let strategy = HybridStrategy::new(Arc::new(FailingProvider));
        let mut entries = vec![ContextMessage::summary(
            "Earlier: the team picked Rust.",
            chrono::Utc::now() - chrono::Duration::hours(2),
            8,
            "summarize",
            6,
        )];
        entries.extend(conversation(6, 20));
        let options = CompressionOptions::default().with_preserve_last_n(2);

        let result = strategy.compress(&entries, 200, &options).await;
        let compressed = result.compressed_messages();
        assert_eq!(compressed.len(), 1);
        assert!(compressed[0].content.contains("the team picked Rust"));
    }

    #[tokio::test]
    async fn test_medium_segment_mixes_selection_and_summary() {
        let strategy = HybridStrategy::new(Arc::new(FailingProvider));
        let entries = conversation(12, 20);
        let options = CompressionOptions::default().with_preserve_last_n(2);

        // 10 compressible: first 6 go to selective, last 4 to summarize
        let result = strategy.compress(&entries, 10_000, &options).await;
        let compressed = result.compressed_messages();
        let selected: Vec<_> = compressed
            .iter()
            .filter(|m| m.meta_bool("selected") == Some(true))
            .collect();
        assert_eq!(selected.len(), 2); // indices 0 and 3
        let summary = compressed.last().unwrap();
        assert!(summary.is_summary());
        assert_eq!(summary.meta_f64("source_count"), Some(4.0));
        assert_eq!(summary.meta_str("strategy"), Some("hybrid"));
    }

    #[tokio::test]
    async fn test_thresholds_are_configurable() {
        let strategy = HybridStrategy::new(Arc::new(FailingProvider));
        let entries = conversation(12, 20);
        let mut options = CompressionOptions::default().with_preserve_last_n(2);
        options.hybrid = HybridConfig {
            summarize_above_entries: 5,
            selective_share: 0.6,
        };

        let result = strategy.compress(&entries, 10_000, &options).await;
        assert_eq!(result.compressed_messages().len(), 1);
        assert!(result.compressed_messages()[0].is_summary());
    }
}
