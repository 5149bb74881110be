//! Temporal bucketing: summarize by age, giving recent history more room.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::summarize::SummarizeStrategy;
use super::{CompressionOptions, CompressionStrategy, SegmentOutput, StrategyKind};
use crate::llm::LLMProvider;
use crate::message::ContextMessage;

const LOSS_ESTIMATE: f64 = 0.3;

/// Age bands, newest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalBucket {
    /// Younger than one hour
    Recent,
    /// Younger than a day
    Today,
    /// Younger than a week
    Week,
    /// A week or older
    Older,
}

impl TemporalBucket {
    /// Chronological order: oldest band first
    pub const OLDEST_FIRST: [TemporalBucket; 4] = [
        TemporalBucket::Older,
        TemporalBucket::Week,
        TemporalBucket::Today,
        TemporalBucket::Recent,
    ];

    /// Band for an entry of the given age
    pub fn for_age(age: Duration) -> Self {
        if age < Duration::hours(1) {
            TemporalBucket::Recent
        } else if age < Duration::hours(24) {
            TemporalBucket::Today
        } else if age < Duration::hours(168) {
            TemporalBucket::Week
        } else {
            TemporalBucket::Older
        }
    }

    /// Share of the target budget given to this band
    pub fn share(&self) -> f64 {
        match self {
            TemporalBucket::Recent => 0.4,
            TemporalBucket::Today => 0.3,
            TemporalBucket::Week => 0.2,
            TemporalBucket::Older => 0.1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TemporalBucket::Recent => "recent",
            TemporalBucket::Today => "today",
            TemporalBucket::Week => "week",
            TemporalBucket::Older => "older",
        }
    }

    /// Token allowance out of `target_tokens`
    pub fn allocation(&self, target_tokens: usize) -> usize {
        ((target_tokens as f64 * self.share()) as usize).max(1)
    }
}

/// Split `segment` into age bands relative to `now`, oldest band first.
/// Empty bands are left out.
pub fn bucket_by_age(
    segment: &[ContextMessage],
    now: DateTime<Utc>,
) -> Vec<(TemporalBucket, Vec<ContextMessage>)> {
    TemporalBucket::OLDEST_FIRST
        .into_iter()
        .filter_map(|bucket| {
            let members: Vec<ContextMessage> = segment
                .iter()
                .filter(|m| {
                    TemporalBucket::for_age(now.signed_duration_since(m.timestamp)) == bucket
                })
                .cloned()
                .collect();
            (!members.is_empty()).then_some((bucket, members))
        })
        .collect()
}

pub struct TemporalCompressStrategy {
    summarizer: SummarizeStrategy,
}

impl TemporalCompressStrategy {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            summarizer: SummarizeStrategy::new(provider),
        }
    }
}

#[async_trait]
impl CompressionStrategy for TemporalCompressStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::TemporalCompress
    }

    async fn compress_segment(
        &self,
        segment: &[ContextMessage],
        target_tokens: usize,
        options: &CompressionOptions,
    ) -> SegmentOutput {
        let buckets = bucket_by_age(segment, options.now);
        tracing::debug!(
            buckets = ?buckets.iter().map(|(b, m)| (b.as_str(), m.len())).collect::<Vec<_>>(),
            "temporal buckets"
        );

        let runs = buckets.iter().map(|(bucket, members)| {
            let allocation = bucket.allocation(target_tokens);
            self.summarizer.compress_segment(members, allocation, options)
        });
        let outputs = futures::future::join_all(runs).await;

        let mut messages = Vec::new();
        let mut used_fallback = false;
        for ((bucket, _), output) in buckets.iter().zip(outputs) {
            used_fallback |= output.used_fallback;
            messages.extend(output.messages.into_iter().map(|mut m| {
                m.metadata
                    .insert("strategy".to_string(), StrategyKind::TemporalCompress.as_str().into());
                m.metadata
                    .insert("period".to_string(), bucket.as_str().into());
                m
            }));
        }

        SegmentOutput {
            messages,
            used_fallback,
            loss_estimate: LOSS_ESTIMATE,
        }
    }
}
