//! Compression strategies.
//!
//! A strategy reduces the older part of a message segment to fewer tokens.
//! Every strategy is total: the primary path asks the LLM provider, and any
//! provider error or unusable answer drops to a deterministic heuristic.
//!
//! The most recent `preserve_last_n` entries of the segment are never handed
//! to a strategy's compression logic; they are appended unchanged after the
//! compressed output.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::HybridConfig;
use crate::error::{Result, WindlassError};
use crate::llm::{LLMProvider, LLMRequest};
use crate::message::ContextMessage;
use crate::tokens::TokenEstimator;

mod cluster;
mod hybrid;
mod keyword;
mod selective;
mod summarize;
mod temporal;

pub use cluster::SemanticClusterStrategy;
pub use hybrid::HybridStrategy;
pub use keyword::KeywordExtractStrategy;
pub use selective::SelectiveStrategy;
pub use summarize::SummarizeStrategy;
pub use temporal::{TemporalBucket, TemporalCompressStrategy};

/// Names of the built-in strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Summarize,
    KeywordExtract,
    SemanticCluster,
    TemporalCompress,
    Selective,
    Hybrid,
}

impl StrategyKind {
    /// Every built-in strategy
    pub const ALL: [StrategyKind; 6] = [
        StrategyKind::Summarize,
        StrategyKind::KeywordExtract,
        StrategyKind::SemanticCluster,
        StrategyKind::TemporalCompress,
        StrategyKind::Selective,
        StrategyKind::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Summarize => "summarize",
            StrategyKind::KeywordExtract => "keyword_extract",
            StrategyKind::SemanticCluster => "semantic_cluster",
            StrategyKind::TemporalCompress => "temporal_compress",
            StrategyKind::Selective => "selective",
            StrategyKind::Hybrid => "hybrid",
        }
    }

    /// A-priori expectation of compressed/original tokens, used for planning
    pub fn expected_ratio(&self) -> f64 {
        match self {
            StrategyKind::Summarize => 0.25,
            StrategyKind::KeywordExtract => 0.15,
            StrategyKind::SemanticCluster => 0.35,
            StrategyKind::TemporalCompress => 0.3,
            StrategyKind::Selective => 0.5,
            StrategyKind::Hybrid => 0.35,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = WindlassError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| WindlassError::UnknownStrategy(s.to_string()))
    }
}

/// Kind of content a window holds, used to recommend a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Conversation,
    Facts,
    Preferences,
    Other,
}

/// Pick a strategy when the caller does not pin one.
///
/// Aggressive reductions favour keyword extraction, moderate ones depend on
/// the content, and light ones use plain summarization.
pub fn get_recommended_strategy(
    content_type: ContentType,
    original_tokens: usize,
    target_tokens: usize,
) -> StrategyKind {
    if original_tokens == 0 {
        return StrategyKind::Summarize;
    }
    let ratio = target_tokens as f64 / original_tokens as f64;

    if ratio < 0.3 {
        StrategyKind::KeywordExtract
    } else if ratio < 0.6 {
        match content_type {
            ContentType::Conversation => StrategyKind::TemporalCompress,
            ContentType::Facts => StrategyKind::Summarize,
            ContentType::Preferences => StrategyKind::KeywordExtract,
            ContentType::Other => StrategyKind::SemanticCluster,
        }
    } else {
        StrategyKind::Summarize
    }
}

/// Per-call options shared by all strategies
#[derive(Debug, Clone)]
pub struct CompressionOptions {
    /// Most recent entries left untouched
    pub preserve_last_n: usize,

    /// Reference time for age-based decisions
    pub now: DateTime<Utc>,

    /// Content hint
    pub content_type: ContentType,

    /// Hybrid dispatcher thresholds
    pub hybrid: HybridConfig,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            preserve_last_n: 5,
            now: Utc::now(),
            content_type: ContentType::default(),
            hybrid: HybridConfig::default(),
        }
    }
}

impl CompressionOptions {
    pub fn with_preserve_last_n(mut self, count: usize) -> Self {
        self.preserve_last_n = count;
        self
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }
}

/// Outcome of one strategy run.
///
/// `messages` holds the compressed output followed by the preserved tail
/// (the last `preserved_count` entries). Token figures describe the
/// compressible part only.
#[derive(Debug, Clone, Serialize)]
pub struct CompressionResult {
    pub success: bool,
    pub strategy: StrategyKind,
    pub messages: Vec<ContextMessage>,
    pub preserved_count: usize,
    pub original_tokens: usize,
    pub compressed_tokens: usize,
    pub compression_ratio: f64,
    pub loss_estimate: f64,
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompressionResult {
    /// Failed run; the input comes back unchanged
    pub fn failure(
        strategy: StrategyKind,
        entries: &[ContextMessage],
        preserved_count: usize,
        error: impl Into<String>,
    ) -> Self {
        let estimator = TokenEstimator::new();
        let split = entries.len().saturating_sub(preserved_count);
        let original_tokens = estimator.estimate_messages(&entries[..split]);
        Self {
            success: false,
            strategy,
            messages: entries.to_vec(),
            preserved_count: entries.len() - split,
            original_tokens,
            compressed_tokens: original_tokens,
            compression_ratio: 1.0,
            loss_estimate: 0.0,
            used_fallback: false,
            error: Some(error.into()),
        }
    }

    /// Entries produced by compression, without the preserved tail
    pub fn compressed_messages(&self) -> &[ContextMessage] {
        let end = self.messages.len().saturating_sub(self.preserved_count);
        &self.messages[..end]
    }

    /// The preserved tail
    pub fn preserved_messages(&self) -> &[ContextMessage] {
        let start = self.messages.len().saturating_sub(self.preserved_count);
        &self.messages[start..]
    }

    /// Compressed output rendered as text
    pub fn compressed_content(&self) -> String {
        self.compressed_messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// What a strategy produced for the compressible part of a segment
#[derive(Debug, Clone, Default)]
pub struct SegmentOutput {
    pub messages: Vec<ContextMessage>,
    pub used_fallback: bool,
    pub loss_estimate: f64,
}

/// A compression algorithm.
///
/// Implementors provide [`CompressionStrategy::compress_segment`], which must
/// never fail; [`CompressionStrategy::compress`] handles the preserved tail
/// and the token accounting.
#[async_trait]
pub trait CompressionStrategy: Send + Sync {
    /// Strategy name
    fn kind(&self) -> StrategyKind;

    /// Coarse compressed/original expectation
    fn estimate_compression_ratio(&self) -> f64 {
        self.kind().expected_ratio()
    }

    /// Compress `segment` (which excludes the preserved tail) into at most
    /// roughly `target_tokens` tokens.
    async fn compress_segment(
        &self,
        segment: &[ContextMessage],
        target_tokens: usize,
        options: &CompressionOptions,
    ) -> SegmentOutput;

    /// Compress `entries`, keeping the last `options.preserve_last_n` intact
    async fn compress(
        &self,
        entries: &[ContextMessage],
        target_tokens: usize,
        options: &CompressionOptions,
    ) -> CompressionResult {
        let kind = self.kind();
        let estimator = TokenEstimator::new();
        let split = entries.len().saturating_sub(options.preserve_last_n);
        let (segment, preserved) = entries.split_at(split);
        let original_tokens = estimator.estimate_messages(segment);

        let output = if segment.is_empty() {
            SegmentOutput::default()
        } else {
            self.compress_segment(segment, target_tokens, options).await
        };

        let compressed_tokens = estimator.estimate_messages(&output.messages);
        if compressed_tokens > original_tokens {
            tracing::warn!(
                strategy = %kind,
                original_tokens,
                compressed_tokens,
                "compression produced more tokens than it was given"
            );
            return CompressionResult::failure(
                kind,
                entries,
                preserved.len(),
                format!(
                    "{} output ({} tokens) exceeds input ({} tokens)",
                    kind, compressed_tokens, original_tokens
                ),
            );
        }

        let compression_ratio = if original_tokens == 0 {
            1.0
        } else {
            compressed_tokens as f64 / original_tokens as f64
        };

        let mut messages = output.messages;
        messages.extend_from_slice(preserved);

        CompressionResult {
            success: true,
            strategy: kind,
            messages,
            preserved_count: preserved.len(),
            original_tokens,
            compressed_tokens,
            compression_ratio,
            loss_estimate: output.loss_estimate.clamp(0.0, 1.0),
            used_fallback: output.used_fallback,
            error: None,
        }
    }
}

/// Strategies keyed by name, built once per manager
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<StrategyKind, Arc<dyn CompressionStrategy>>,
}

impl StrategyRegistry {
    /// Registry of every built-in strategy sharing one provider
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SummarizeStrategy::new(provider.clone())));
        registry.register(Arc::new(KeywordExtractStrategy::new(provider.clone())));
        registry.register(Arc::new(SemanticClusterStrategy::new(provider.clone())));
        registry.register(Arc::new(TemporalCompressStrategy::new(provider.clone())));
        registry.register(Arc::new(SelectiveStrategy::new(provider.clone())));
        registry.register(Arc::new(HybridStrategy::new(provider)));
        registry
    }

    /// Registry with nothing registered
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Add or replace a strategy
    pub fn register(&mut self, strategy: Arc<dyn CompressionStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    /// Look up a strategy
    pub fn get(&self, kind: StrategyKind) -> Result<Arc<dyn CompressionStrategy>> {
        self.strategies
            .get(&kind)
            .cloned()
            .ok_or_else(|| WindlassError::UnknownStrategy(kind.to_string()))
    }

    /// Look up a strategy by name
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn CompressionStrategy>> {
        self.get(name.parse()?)
    }

    /// Registered strategy names in declaration order
    pub fn kinds(&self) -> Vec<StrategyKind> {
        StrategyKind::ALL
            .into_iter()
            .filter(|k| self.strategies.contains_key(k))
            .collect()
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategyRegistry")
            .field("strategies", &self.kinds())
            .finish()
    }
}

/// Render entries as a `role: content` transcript for prompts
pub(crate) fn render_transcript(segment: &[ContextMessage]) -> String {
    segment
        .iter()
        .map(|m| {
            if m.is_summary() {
                format!("earlier summary: {}", m.content)
            } else {
                format!("{}: {}", m.role, m.content)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Ask the provider and return its trimmed answer.
///
/// Errors and empty answers are logged and come back as `None`; callers
/// switch to their fallback.
pub(crate) async fn ask_provider(
    provider: &dyn LLMProvider,
    strategy: StrategyKind,
    system: &str,
    prompt: String,
    max_tokens: usize,
) -> Option<String> {
    let request = LLMRequest::with_system_prompt(system, prompt)
        .temperature(0.3)
        .max_tokens(max_tokens.max(16));

    match provider.complete(&request).await {
        Ok(response) => {
            if let Some(usage) = response.usage {
                tracing::debug!(
                    strategy = %strategy,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "provider usage"
                );
            }
            let content = response.content.trim();
            if content.is_empty() {
                tracing::warn!(
                    strategy = %strategy,
                    "provider returned an empty answer, using fallback"
                );
                None
            } else {
                Some(content.to_string())
            }
        }
        Err(e) => {
            tracing::warn!(
                strategy = %strategy,
                error = %e,
                "provider call failed, using fallback"
            );
            None
        }
    }
}

/// Timestamp for a summary of `segment`: its newest entry
pub(crate) fn summary_timestamp(
    segment: &[ContextMessage],
    fallback: DateTime<Utc>,
) -> DateTime<Utc> {
    segment
        .iter()
        .map(|m| m.timestamp)
        .max()
        .unwrap_or(fallback)
}

/// Build a summary entry with its token count filled in
pub(crate) fn summary_entry(
    content: String,
    segment: &[ContextMessage],
    strategy: StrategyKind,
    now: DateTime<Utc>,
) -> ContextMessage {
    let tokens = TokenEstimator::new().estimate(&content);
    ContextMessage::summary(
        content,
        summary_timestamp(segment, now),
        tokens,
        strategy.as_str(),
        segment.len(),
    )
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::llm::{LLMResponse, TokenUsage};

    #[test]
    fn test_strategy_kind_parsing() {
        assert_eq!(
            "keyword_extract".parse::<StrategyKind>().unwrap(),
            StrategyKind::KeywordExtract
        );
        assert_eq!(
            "Temporal-Compress".parse::<StrategyKind>().unwrap(),
            StrategyKind::TemporalCompress
        );
        let err = "zip".parse::<StrategyKind>().unwrap_err();
        assert!(matches!(err, WindlassError::UnknownStrategy(name) if name == "zip"));
    }

    #[test]
    fn test_recommendation_table() {
        use ContentType::*;
        assert_eq!(
            get_recommended_strategy(Conversation, 1000, 200),
            StrategyKind::KeywordExtract
        );
        assert_eq!(
            get_recommended_strategy(Conversation, 1000, 500),
            StrategyKind::TemporalCompress
        );
        assert_eq!(get_recommended_strategy(Facts, 1000, 500), StrategyKind::Summarize);
        assert_eq!(
            get_recommended_strategy(Preferences, 1000, 500),
            StrategyKind::KeywordExtract
        );
        assert_eq!(
            get_recommended_strategy(Other, 1000, 500),
            StrategyKind::SemanticCluster
        );
        assert_eq!(
            get_recommended_strategy(Other, 1000, 800),
            StrategyKind::Summarize
        );
    }

    #[test]
    fn test_registry_has_every_strategy() {
        let registry = StrategyRegistry::new(Arc::new(FailingProvider));
        assert_eq!(registry.kinds(), StrategyKind::ALL.to_vec());
        assert!(registry.resolve("hybrid").is_ok());
        assert!(matches!(
            registry.resolve("gzip"),
            Err(WindlassError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_empty_registry_rejects_lookup() {
        let registry = StrategyRegistry::empty();
        assert!(matches!(
            registry.get(StrategyKind::Summarize),
            Err(WindlassError::UnknownStrategy(_))
        ));
    }

    #[tokio::test]
    async fn test_every_strategy_is_total_with_failing_provider() {
        let registry = StrategyRegistry::new(Arc::new(FailingProvider));
        let entries = conversation(12, 40);
        let options = CompressionOptions::default().with_preserve_last_n(3);

        for kind in StrategyKind::ALL {
            let strategy = registry.get(kind).unwrap();
            let result = strategy.compress(&entries, 120, &options).await;
            assert!(result.success, "{} failed: {:?}", kind, result.error);
            assert!(result.used_fallback, "{} did not report fallback", kind);
            assert!(result.compressed_tokens <= result.original_tokens);
            assert!((0.0..=1.0).contains(&result.compression_ratio));
            assert_eq!(result.preserved_messages(), &entries[9..]);
        }
    }

    #[tokio::test]
    async fn test_short_segment_is_passthrough() {
        let strategy = SummarizeStrategy::new(Arc::new(FailingProvider));
        let entries = conversation(2, 20);
        let options = CompressionOptions::default().with_preserve_last_n(5);
        let result = strategy.compress(&entries, 100, &options).await;
        assert!(result.success);
        assert_eq!(result.messages, entries);
        assert_eq!(result.original_tokens, 0);
        assert_eq!(result.compression_ratio, 1.0);
    }

    #[tokio::test]
    async fn test_oversized_output_is_reported_as_failure() {
        struct Inflating;

        #[async_trait]
        impl CompressionStrategy for Inflating {
            fn kind(&self) -> StrategyKind {
                StrategyKind::Summarize
            }

            async fn compress_segment(
                &self,
                segment: &[ContextMessage],
                _target_tokens: usize,
                _options: &CompressionOptions,
            ) -> SegmentOutput {
                let mut messages = segment.to_vec();
                messages.extend_from_slice(segment);
                SegmentOutput {
                    messages,
                    ..Default::default()
                }
            }
        }

        let entries = conversation(6, 20);
        let options = CompressionOptions::default().with_preserve_last_n(2);
        let result = Inflating.compress(&entries, 50, &options).await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(result.messages, entries);
    }

    #[test]
    fn test_compressed_content_excludes_tail() {
        let summary = ContextMessage::summary("the gist", Utc::now(), 2, "summarize", 3);
        let tail = ContextMessage::user("latest");
        let result = CompressionResult {
            success: true,
            strategy: StrategyKind::Summarize,
            messages: vec![summary, tail],
            preserved_count: 1,
            original_tokens: 30,
            compressed_tokens: 2,
            compression_ratio: 2.0 / 30.0,
            loss_estimate: 0.3,
            used_fallback: false,
            error: None,
        };
        assert_eq!(result.compressed_content(), "the gist");
        assert_eq!(result.preserved_messages()[0].content, "latest");
    }

    /// Answers with fixed content and reports token usage
    struct MeteredProvider(&'static str);

    #[async_trait]
    impl LLMProvider for MeteredProvider {
        async fn complete(&self, _request: &LLMRequest) -> Result<LLMResponse> {
            Ok(LLMResponse {
                content: self.0.to_string(),
                usage: Some(TokenUsage {
                    prompt_tokens: 120,
                    completion_tokens: 8,
                    total_tokens: 128,
                }),
            })
        }
    }

    #[tokio::test]
    async fn test_ask_provider_trims_metered_answer() {
        let answer = ask_provider(
            &MeteredProvider("  the gist \n"),
            StrategyKind::Summarize,
            "system",
            "prompt".to_string(),
            50,
        )
        .await;
        assert_eq!(answer.as_deref(), Some("the gist"));

        let blank = ask_provider(
            &MeteredProvider(" \n "),
            StrategyKind::Summarize,
            "system",
            "prompt".to_string(),
            50,
        )
        .await;
        assert!(blank.is_none());
    }
}
