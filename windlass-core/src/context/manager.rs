//! Context window manager
//!
//! Owns the three layers of one session and drives the
//! `Idle -> Ingesting -> Compressing -> Evicting -> Idle` cycle: new messages
//! land in the immediate layer, the compressible part of that layer is folded
//! into the summarized layer once the window passes its ceiling, and
//! low-priority entries are evicted when compression alone is not enough.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::compression::{
    CompressionOptions, CompressionResult, StrategyKind, StrategyRegistry,
    get_recommended_strategy,
};
use crate::config::{WindlassConfig, WindowConfig};
use crate::error::{Result, WindlassError};
use crate::layers::{LayerKind, LayerUsage, LayeredContext, TokenBudget};
use crate::llm::{LLMProvider, StubLLMProvider};
use crate::message::{ContextMessage, MessageRole, Metadata};
use crate::priority::{PriorityScorer, TermStats};
use crate::session::{Clock, PersistenceEventSender, Persister, SystemClock};
use crate::storage::{ContextStorage, SessionState};
use crate::tokens::TokenEstimator;

/// Smallest budget handed to a strategy, so that a window whose fixed layers
/// already fill the target still gets a usable summary
const MIN_STRATEGY_TARGET: usize = 32;

/// Where a session is in its ingest/compress cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowState {
    Idle,
    Ingesting,
    Compressing,
    Evicting,
}

impl fmt::Display for WindowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WindowState::Idle => "idle",
            WindowState::Ingesting => "ingesting",
            WindowState::Compressing => "compressing",
            WindowState::Evicting => "evicting",
        };
        f.write_str(name)
    }
}

/// Read-only view of the window's size
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextAnalysis {
    pub total_tokens: usize,
    pub message_count: usize,
    pub average_tokens_per_message: f64,

    /// total / max, as a percentage
    pub context_utilization: f64,

    pub compression_needed: bool,

    /// Fraction of the current size compression should keep (1.0 when no
    /// compression is needed)
    pub suggested_compression_ratio: f64,

    pub layers: Vec<LayerUsage>,
}

/// Why a compression request did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    /// The window is within its ceiling
    NotNeeded,

    /// Compression is switched off in configuration
    Disabled,

    /// Too few immediate messages to be worth compressing
    TooFewMessages { available: usize, required: usize },
}

/// Outcome of one compression pass, including the eviction that followed
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressionReport {
    /// Strategy outcome; `None` when the pass was skipped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<CompressionResult>,

    /// Entries removed by eviction after compression
    pub evicted: Vec<ContextMessage>,

    pub tokens_before: usize,
    pub tokens_after: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
}

impl CompressionReport {
    fn skipped(reason: SkipReason, tokens: usize) -> Self {
        Self {
            result: None,
            evicted: Vec::new(),
            tokens_before: tokens,
            tokens_after: tokens,
            skipped: Some(reason),
        }
    }

    /// Whether the strategy ran and its output was applied
    pub fn applied(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.success)
    }
}

/// Tiered context window for one session
pub struct ContextWindowManager {
    session_id: String,
    config: WindlassConfig,
    layers: LayeredContext,
    budget: TokenBudget,
    estimator: TokenEstimator,
    scorer: PriorityScorer,
    strategies: StrategyRegistry,
    storage: Option<ContextStorage>,
    persister: Option<Persister>,
    clock: Arc<dyn Clock>,
    state: WindowState,
    dirty: bool,
    compression_version: u32,
    last_compressed: Option<DateTime<Utc>>,
}

impl fmt::Debug for ContextWindowManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextWindowManager")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("total_tokens", &self.layers.total_tokens())
            .field("messages", &self.layers.message_count())
            .field("dirty", &self.dirty)
            .field("compression_version", &self.compression_version)
            .finish()
    }
}

impl ContextWindowManager {
    /// Start building a manager for `session_id`
    pub fn builder(session_id: impl Into<String>) -> ContextWindowManagerBuilder {
        ContextWindowManagerBuilder::new(session_id)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &WindlassConfig {
        &self.config
    }

    pub fn window(&self) -> &WindowConfig {
        &self.config.window
    }

    pub fn layers(&self) -> &LayeredContext {
        &self.layers
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    pub fn state(&self) -> WindowState {
        self.state
    }

    /// Whether there are changes not yet written by an explicit save
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_storage(&self) -> bool {
        self.storage.is_some()
    }

    pub fn compression_version(&self) -> u32 {
        self.compression_version
    }

    pub fn last_compressed(&self) -> Option<DateTime<Utc>> {
        self.last_compressed
    }

    pub fn total_tokens(&self) -> usize {
        self.layers.total_tokens()
    }

    // ------------------------------------------------------------------
    // Ingest
    // ------------------------------------------------------------------

    /// Append a message to the immediate layer, compressing afterwards when
    /// the window is over its ceiling and auto-compression is on
    pub async fn add_message(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> Option<CompressionReport> {
        let mut message = ContextMessage::at(role, content, self.clock.now());
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }
        self.push_message(message).await
    }

    /// Append a prepared message (its id, timestamp and metadata are kept)
    pub async fn push_message(&mut self, mut message: ContextMessage) -> Option<CompressionReport> {
        self.set_state(WindowState::Ingesting);

        message.token_count = self.estimator.message_tokens(&message);
        let now = self.clock.now();
        tracing::debug!(
            session_id = %self.session_id,
            role = %message.role,
            tokens = message.token_count,
            "message added"
        );
        self.layers.immediate_mut().push(message, now);
        self.dirty = true;
        self.auto_persist();

        self.set_state(WindowState::Idle);

        let window = &self.config.window;
        if window.auto_compress && window.compression_enabled && self.should_compress() {
            Some(self.compress().await)
        } else {
            None
        }
    }

    /// Add an entry to the persistent layer; returns its id
    pub fn add_persistent(
        &mut self,
        role: MessageRole,
        content: impl Into<String>,
        metadata: Option<Metadata>,
    ) -> String {
        let now = self.clock.now();
        let mut message = ContextMessage::at(role, content, now);
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }
        message.token_count = self.estimator.message_tokens(&message);
        let id = message.id.clone();

        self.layers.layer_mut(LayerKind::Persistent).push(message, now);
        self.dirty = true;
        self.auto_persist();
        id
    }

    /// Remove an entry from the persistent layer
    pub fn remove_persistent(&mut self, id: &str) -> Option<ContextMessage> {
        let now = self.clock.now();
        let removed = self
            .layers
            .layer_mut(LayerKind::Persistent)
            .remove_by_id(id, now)?;
        self.dirty = true;
        self.auto_persist();
        Some(removed)
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Every entry: persistent, then summarized, then immediate
    pub fn get_messages(&self) -> Vec<ContextMessage> {
        self.layers.messages()
    }

    /// The last `count` entries of [`Self::get_messages`]
    pub fn get_recent_messages(&self, count: usize) -> Vec<ContextMessage> {
        let messages = self.layers.messages();
        let start = messages.len().saturating_sub(count);
        messages[start..].to_vec()
    }

    /// Every entry authored by `role`, in context order
    pub fn get_messages_by_role(&self, role: MessageRole) -> Vec<ContextMessage> {
        self.layers
            .tagged_entries()
            .filter(|(_, m)| m.role == role)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// The window is over its hard ceiling
    pub fn should_compress(&self) -> bool {
        self.layers.total_tokens() > self.config.window.max_context_tokens
    }

    /// Size report; does not touch state
    pub fn analyze_context(&self) -> ContextAnalysis {
        let total_tokens = self.layers.total_tokens();
        let message_count = self.layers.message_count();
        let window = &self.config.window;
        let compression_needed = self.should_compress();

        let suggested_compression_ratio = if compression_needed && total_tokens > 0 {
            (window.target_tokens() as f64 / total_tokens as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };

        ContextAnalysis {
            total_tokens,
            message_count,
            average_tokens_per_message: if message_count == 0 {
                0.0
            } else {
                total_tokens as f64 / message_count as f64
            },
            context_utilization: total_tokens as f64 / window.max_context_tokens as f64 * 100.0,
            compression_needed,
            suggested_compression_ratio,
            layers: self.layers.usage(&self.budget),
        }
    }

    /// Render the window as text for a prompt.
    ///
    /// Persistent entries come first by descending priority, then summaries
    /// newest first, then the most recent immediate messages in order. Lines
    /// that would push the text past `max_tokens` (default: the window
    /// ceiling) are left out.
    pub fn get_formatted_context(&self, max_tokens: Option<usize>) -> String {
        let limit = max_tokens.unwrap_or(self.config.window.max_context_tokens);
        let now = self.clock.now();

        let persistent = self.layers.persistent().entries();
        let stats = TermStats::from_messages(persistent);
        let mut ranked: Vec<(f64, &ContextMessage)> = persistent
            .iter()
            .map(|m| (self.scorer.score(m, now, &stats), m))
            .collect();
        ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut summaries: Vec<&ContextMessage> =
            self.layers.summarized().entries().iter().collect();
        summaries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let immediate = self.layers.immediate().entries();
        let recent_start = immediate
            .len()
            .saturating_sub(self.config.window.formatted_recent_limit);

        let sections: [(&str, Vec<&ContextMessage>); 3] = [
            ("Persistent context", ranked.into_iter().map(|(_, m)| m).collect()),
            ("Earlier conversation", summaries),
            ("Recent messages", immediate[recent_start..].iter().collect()),
        ];

        let mut out = String::new();
        for (title, entries) in sections {
            let mut opened = false;
            for entry in entries {
                let mark = out.len();
                if !opened {
                    if !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(&format!("## {}\n", title));
                }
                out.push_str(&format!("{}: {}\n", entry.role, entry.content));

                // Headers and separators count against the limit too
                if self.estimator.estimate(&out) > limit {
                    out.truncate(mark);
                    continue;
                }
                opened = true;
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // Compression and eviction
    // ------------------------------------------------------------------

    /// Compress only if the window is over its ceiling
    pub async fn compress(&mut self) -> CompressionReport {
        if !self.should_compress() {
            return CompressionReport::skipped(SkipReason::NotNeeded, self.layers.total_tokens());
        }
        self.compress_context(None).await
    }

    /// Compress the immediate layer now, with `strategy` or the configured or
    /// recommended one.
    ///
    /// Summaries from earlier passes are compressed together with the older
    /// immediate messages, so the summarized layer holds one rolling summary
    /// set instead of a growing stack.
    ///
    /// Never fails: a strategy failure leaves every layer untouched and is
    /// reported through the result.
    pub async fn compress_context(&mut self, strategy: Option<StrategyKind>) -> CompressionReport {
        let tokens_before = self.layers.total_tokens();
        let window = self.config.window.clone();

        if !window.compression_enabled {
            tracing::debug!(session_id = %self.session_id, "compression disabled; skipping");
            return CompressionReport::skipped(SkipReason::Disabled, tokens_before);
        }

        // At least one message has to sit outside the preserved tail
        let available = self.layers.immediate().len();
        let required = window
            .min_messages_to_compress
            .max(window.preserve_last_n + 1);
        if available < required {
            tracing::debug!(
                session_id = %self.session_id,
                available,
                required,
                "too few messages to compress"
            );
            return CompressionReport::skipped(
                SkipReason::TooFewMessages {
                    available,
                    required,
                },
                tokens_before,
            );
        }

        self.set_state(WindowState::Compressing);

        // Earlier summaries are folded into the new one rather than stacked
        let (prior_summaries, kept_summarized): (Vec<ContextMessage>, Vec<ContextMessage>) = self
            .layers
            .summarized()
            .entries()
            .iter()
            .cloned()
            .partition(|m| m.is_summary());
        let immediate = self.layers.immediate().entries();
        let split = immediate.len().saturating_sub(window.preserve_last_n);
        let entries: Vec<ContextMessage> = prior_summaries
            .iter()
            .chain(immediate.iter())
            .cloned()
            .collect();

        let compressible_tokens = self.estimator.estimate_messages(&prior_summaries)
            + self.estimator.estimate_messages(&immediate[..split]);
        let preserved_tokens = self.estimator.estimate_messages(&immediate[split..]);
        let fixed_tokens = self.layers.persistent().token_count()
            + self.estimator.estimate_messages(&kept_summarized)
            + preserved_tokens;

        let target_total = window.target_tokens();
        let strategy_target = target_total
            .saturating_sub(fixed_tokens)
            .max(MIN_STRATEGY_TARGET)
            .min(compressible_tokens.max(1));

        let kind = strategy.or(window.default_strategy).unwrap_or_else(|| {
            get_recommended_strategy(window.content_type, compressible_tokens, strategy_target)
        });
        tracing::debug!(
            session_id = %self.session_id,
            strategy = %kind,
            compressible_tokens,
            strategy_target,
            "strategy selected"
        );

        let now = self.clock.now();
        let options = CompressionOptions {
            preserve_last_n: window.preserve_last_n,
            now,
            content_type: window.content_type,
            hybrid: self.config.hybrid,
        };

        let result = match self.strategies.get(kind) {
            Ok(compressor) => compressor.compress(&entries, strategy_target, &options).await,
            Err(e) => {
                CompressionResult::failure(kind, &entries, window.preserve_last_n, e.to_string())
            }
        };

        if !result.success {
            tracing::warn!(
                session_id = %self.session_id,
                strategy = %kind,
                error = result.error.as_deref().unwrap_or("unknown"),
                "compression failed; window left unchanged"
            );
            self.set_state(WindowState::Idle);
            return CompressionReport {
                result: Some(result),
                evicted: Vec::new(),
                tokens_before,
                tokens_after: tokens_before,
                skipped: None,
            };
        }

        let mut summarized = kept_summarized;
        summarized.extend(result.compressed_messages().iter().cloned());
        summarized.sort_by_key(|m| m.timestamp);
        self.layers.summarized_mut().replace(summarized, now);
        self.layers
            .immediate_mut()
            .replace(result.preserved_messages().to_vec(), now);
        self.compression_version += 1;
        self.last_compressed = Some(now);
        self.dirty = true;

        tracing::info!(
            session_id = %self.session_id,
            strategy = %kind,
            original_tokens = result.original_tokens,
            compressed_tokens = result.compressed_tokens,
            ratio = result.compression_ratio,
            fallback = result.used_fallback,
            "context compressed"
        );

        let evicted = if self.layers.total_tokens() > target_total {
            self.evict_to(target_total)
        } else {
            Vec::new()
        };

        self.set_state(WindowState::Idle);
        self.auto_persist();

        CompressionReport {
            result: Some(result),
            evicted,
            tokens_before,
            tokens_after: self.layers.total_tokens(),
            skipped: None,
        }
    }

    /// Compress with a strategy given by name
    pub async fn compress_context_named(&mut self, name: &str) -> Result<CompressionReport> {
        let kind: StrategyKind = name.parse()?;
        Ok(self.compress_context(Some(kind)).await)
    }

    /// Evict low-priority entries until the window is within its target.
    /// Returns the removed entries.
    pub fn evict(&mut self) -> Vec<ContextMessage> {
        let target = self.config.window.target_tokens();
        if self.layers.total_tokens() <= target {
            return Vec::new();
        }
        let evicted = self.evict_to(target);
        self.set_state(WindowState::Idle);
        if !evicted.is_empty() {
            self.auto_persist();
        }
        evicted
    }

    /// Remove the lowest-priority entry until `target` is met. The immediate
    /// layer goes first (never its preserved tail), then the summarized layer.
    /// The persistent layer is never touched.
    fn evict_to(&mut self, target: usize) -> Vec<ContextMessage> {
        self.set_state(WindowState::Evicting);
        let now = self.clock.now();
        let preserve = self.config.window.preserve_last_n;
        let mut evicted = Vec::new();

        while self.layers.total_tokens() > target {
            let immediate = self.layers.immediate().entries();
            let evictable = immediate.len().saturating_sub(preserve);

            let (kind, candidates) = if evictable > 0 {
                (LayerKind::Immediate, &immediate[..evictable])
            } else if !self.layers.summarized().is_empty() {
                (LayerKind::Summarized, self.layers.summarized().entries())
            } else {
                break;
            };

            let Some(index) = self.scorer.rank_for_eviction(candidates, now).first().copied()
            else {
                break;
            };
            let Some(entry) = self.layers.layer_mut(kind).remove(index, now) else {
                break;
            };

            tracing::debug!(
                session_id = %self.session_id,
                layer = %kind,
                entry_id = %entry.id,
                tokens = entry.token_count,
                "entry evicted"
            );
            evicted.push(entry);
        }

        if !evicted.is_empty() {
            self.dirty = true;
            tracing::info!(
                session_id = %self.session_id,
                evicted = evicted.len(),
                total_tokens = self.layers.total_tokens(),
                target,
                "eviction finished"
            );
        }
        evicted
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Plaintext state as handed to storage
    pub fn session_state(&self) -> SessionState {
        SessionState {
            session_id: self.session_id.clone(),
            entries: self
                .layers
                .tagged_entries()
                .map(|(kind, m)| (kind, m.clone()))
                .collect(),
            compression_version: self.compression_version,
            last_compressed: self.last_compressed,
        }
    }

    /// Write the current state and wait for the write to finish
    pub async fn save_to_storage(&mut self) -> Result<()> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            WindlassError::Configuration(format!(
                "session {} has no storage configured",
                self.session_id
            ))
        })?;
        storage.save(&self.session_state()).await?;
        self.dirty = false;
        tracing::debug!(session_id = %self.session_id, "session saved");
        Ok(())
    }

    /// Replace in-memory state with the stored snapshot. Returns `false`, with
    /// state untouched, when nothing is stored.
    pub async fn reload_from_storage(&mut self) -> Result<bool> {
        let storage = self.storage.as_ref().ok_or_else(|| {
            WindlassError::Configuration(format!(
                "session {} has no storage configured",
                self.session_id
            ))
        })?;
        let Some(state) = storage.load(&self.session_id).await? else {
            return Ok(false);
        };
        self.restore(state);
        self.dirty = false;
        Ok(true)
    }

    /// Drop every entry in every layer
    pub fn clear(&mut self) {
        self.layers.clear(self.clock.now());
        self.dirty = true;
        self.auto_persist();
    }

    /// Stop the background writer after it has written the latest state
    pub async fn close(mut self) {
        if let Some(persister) = self.persister.take() {
            persister.shutdown().await;
        }
    }

    pub(crate) fn replace_layers(&mut self, layers: LayeredContext) {
        self.layers = layers;
        self.dirty = true;
        self.auto_persist();
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn restore(&mut self, state: SessionState) {
        self.layers = LayeredContext::from_entries(state.entries, self.clock.now());
        self.compression_version = state.compression_version;
        self.last_compressed = state.last_compressed;
    }

    fn auto_persist(&self) {
        if let Some(persister) = &self.persister {
            persister.submit(self.session_state());
        }
    }

    fn set_state(&mut self, next: WindowState) {
        if self.state != next {
            tracing::debug!(
                session_id = %self.session_id,
                from = %self.state,
                to = %next,
                "window state"
            );
            self.state = next;
        }
    }
}

/// Builder for [`ContextWindowManager`]
pub struct ContextWindowManagerBuilder {
    session_id: String,
    config: WindlassConfig,
    llm: Option<Arc<dyn LLMProvider>>,
    strategies: Option<StrategyRegistry>,
    storage: Option<ContextStorage>,
    clock: Option<Arc<dyn Clock>>,
    event_sender: Option<PersistenceEventSender>,
}

impl ContextWindowManagerBuilder {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            config: WindlassConfig::default(),
            llm: None,
            strategies: None,
            storage: None,
            clock: None,
            event_sender: None,
        }
    }

    /// Set the full configuration
    pub fn config(mut self, config: WindlassConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace only the window settings
    pub fn window(mut self, window: WindowConfig) -> Self {
        self.config.window = window;
        self
    }

    /// Provider used by every built-in strategy (default: stub, which makes
    /// every strategy take its deterministic path)
    pub fn llm(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.llm = Some(provider);
        self
    }

    /// Use a prepared strategy registry instead of the built-ins
    pub fn strategies(mut self, registry: StrategyRegistry) -> Self {
        self.strategies = Some(registry);
        self
    }

    /// Storage adapter for snapshots
    pub fn storage(mut self, storage: ContextStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Time source (default: system clock)
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Channel receiving background persistence outcomes
    pub fn event_sender(mut self, sender: PersistenceEventSender) -> Self {
        self.event_sender = Some(sender);
        self
    }

    /// Validate the configuration, load any stored snapshot and start the
    /// background writer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a stored snapshot
    /// exists but cannot be read.
    pub async fn build(self) -> Result<ContextWindowManager> {
        self.config.validate()?;
        if self.session_id.is_empty() {
            return Err(WindlassError::Validation(
                "session id must not be empty".to_string(),
            ));
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let strategies = match self.strategies {
            Some(registry) => registry,
            None => StrategyRegistry::new(
                self.llm.unwrap_or_else(|| Arc::new(StubLLMProvider)),
            ),
        };

        let mut manager = ContextWindowManager {
            budget: TokenBudget::from_shares(
                self.config.window.max_context_tokens,
                &self.config.budget,
            ),
            scorer: PriorityScorer::from_config(&self.config.priority),
            layers: LayeredContext::new(clock.now()),
            session_id: self.session_id,
            config: self.config,
            estimator: TokenEstimator::new(),
            strategies,
            storage: self.storage,
            persister: None,
            clock,
            state: WindowState::Idle,
            dirty: false,
            compression_version: 0,
            last_compressed: None,
        };

        if let Some(storage) = manager.storage.clone() {
            if let Some(state) = storage.load(&manager.session_id).await? {
                tracing::debug!(
                    session_id = %manager.session_id,
                    entries = state.entries.len(),
                    "session restored from storage"
                );
                manager.restore(state);
            }
            if manager.config.window.auto_persist {
                manager.persister = Some(Persister::spawn(storage, self.event_sender));
            }
        }

        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::test_support::{FailingProvider, MockLLMProvider};
    use crate::session::{ManualClock, PersistenceEvent, persistence_channel};
    use crate::storage::{ContextSnapshot, InMemorySnapshotStore, SnapshotStore};
    use async_trait::async_trait;

    /// Roughly `tokens` tokens of distinct prose
    fn text(tokens: usize, seed: usize) -> String {
        let mut s = String::new();
        let mut i = 0;
        while s.len() < tokens * 4 {
            s.push_str(&format!("topic{} detail{} ", seed, i));
            i += 1;
        }
        s.truncate(tokens * 4);
        s.trim_end().to_string()
    }

    fn window(max: usize) -> WindowConfig {
        WindowConfig::new()
            .with_max_tokens(max)
            .with_preserve_last_n(3)
            .with_auto_compress(false)
            .with_auto_persist(false)
    }

    async fn manager(max: usize) -> ContextWindowManager {
        ContextWindowManager::builder("test")
            .window(window(max))
            .build()
            .await
            .unwrap()
    }

    fn assert_layer_sums(manager: &ContextWindowManager) {
        for kind in LayerKind::CONTEXT_ORDER {
            let layer = manager.layers().layer(kind);
            let sum: usize = layer.entries().iter().map(|e| e.token_count).sum();
            assert_eq!(layer.token_count(), sum, "layer {} drifted", kind);
        }
    }

    #[tokio::test]
    async fn test_add_message_estimates_tokens() {
        let mut m = manager(1000).await;
        let report = m.add_message(MessageRole::User, "abcdefgh", None).await;
        assert!(report.is_none());

        let messages = m.get_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].token_count, 2);
        assert_eq!(m.total_tokens(), 2);
        assert!(m.is_dirty());
        assert_eq!(m.state(), WindowState::Idle);
    }

    #[tokio::test]
    async fn test_should_compress_is_strictly_above_ceiling() {
        let mut m = manager(10).await;
        m.add_message(MessageRole::User, "a".repeat(40), None).await;
        assert_eq!(m.total_tokens(), 10);
        assert!(!m.should_compress());

        m.add_message(MessageRole::User, "b", None).await;
        assert!(m.should_compress());
    }

    #[tokio::test]
    async fn test_compress_is_noop_under_ceiling() {
        let mut m = manager(1000).await;
        for i in 0..8 {
            m.add_message(MessageRole::User, text(10, i), None).await;
        }
        let before = m.get_messages();

        let report = m.compress().await;
        assert_eq!(report.skipped, Some(SkipReason::NotNeeded));
        assert_eq!(m.get_messages(), before);
        assert_eq!(m.compression_version(), 0);
    }

    #[tokio::test]
    async fn test_compress_moves_output_to_summarized_and_keeps_tail() {
        let mut m = manager(200).await;
        for i in 0..10 {
            m.add_message(MessageRole::User, text(25, i), None).await;
        }
        let tail: Vec<String> = m.layers().immediate().entries()[7..]
            .iter()
            .map(|e| e.id.clone())
            .collect();

        let report = m.compress_context(Some(StrategyKind::Summarize)).await;
        assert!(report.applied());

        let immediate: Vec<String> = m
            .layers()
            .immediate()
            .entries()
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(immediate, tail);
        assert!(!m.layers().summarized().is_empty());
        assert!(m.layers().summarized().entries()[0].is_summary());
        assert!(m.total_tokens() <= m.window().target_tokens());
        assert_eq!(m.compression_version(), 1);
        assert!(m.last_compressed().is_some());
        assert_layer_sums(&m);
    }

    #[tokio::test]
    async fn test_too_few_messages_skips() {
        let mut m = manager(10).await;
        for i in 0..3 {
            m.add_message(MessageRole::User, text(20, i), None).await;
        }
        let report = m.compress().await;
        assert_eq!(
            report.skipped,
            Some(SkipReason::TooFewMessages {
                available: 3,
                required: 5
            })
        );
    }

    #[tokio::test]
    async fn test_nothing_outside_preserved_tail_skips() {
        // Defaults: preserve 5, minimum 5
        let mut m = ContextWindowManager::builder("s")
            .window(
                WindowConfig::new()
                    .with_max_tokens(10)
                    .with_auto_compress(false)
                    .with_auto_persist(false),
            )
            .build()
            .await
            .unwrap();
        for i in 0..5 {
            m.add_message(MessageRole::User, text(20, i), None).await;
        }
        let before = m.get_messages();

        let report = m.compress_context(Some(StrategyKind::Summarize)).await;
        assert_eq!(
            report.skipped,
            Some(SkipReason::TooFewMessages {
                available: 5,
                required: 6
            })
        );
        assert_eq!(m.get_messages(), before);
        assert!(m.layers().summarized().is_empty());
        assert_eq!(m.compression_version(), 0);
    }

    #[tokio::test]
    async fn test_prior_summary_is_folded_into_new_one() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut m = ContextWindowManager::builder("s")
            .window(window(200))
            .clock(clock.clone())
            .build()
            .await
            .unwrap();

        let old = ContextMessage::summary(text(30, 99), clock.now(), 30, "summarize", 6);
        let old_id = old.id.clone();
        let mut layers = m.layers().clone();
        layers.summarized_mut().extend(vec![old], clock.now());
        m.replace_layers(layers);

        clock.advance(chrono::Duration::minutes(1));
        for i in 0..10 {
            m.add_message(MessageRole::User, text(25, i), None).await;
        }

        let report = m.compress_context(Some(StrategyKind::Summarize)).await;
        assert!(report.applied());

        let summarized = m.layers().summarized().entries();
        assert_eq!(summarized.iter().filter(|e| e.is_summary()).count(), 1);
        assert!(summarized.iter().all(|e| e.id != old_id));
        assert_layer_sums(&m);
    }

    #[tokio::test]
    async fn test_repeated_auto_compression_keeps_one_summary() {
        let mut m = ContextWindowManager::builder("s")
            .window(
                window(300)
                    .with_auto_compress(true)
                    .with_default_strategy(StrategyKind::Summarize),
            )
            .build()
            .await
            .unwrap();

        for i in 0..60 {
            m.add_message(MessageRole::User, text(25, i), None).await;
            let summaries = m
                .layers()
                .summarized()
                .entries()
                .iter()
                .filter(|e| e.is_summary())
                .count();
            assert!(summaries <= 1, "{} summaries after message {}", summaries, i);
            assert_layer_sums(&m);
        }
        assert!(m.compression_version() > 1);
    }

    #[tokio::test]
    async fn test_disabled_compression_skips() {
        let mut m = ContextWindowManager::builder("s")
            .window(window(10).with_compression(false))
            .build()
            .await
            .unwrap();
        for i in 0..6 {
            m.add_message(MessageRole::User, text(20, i), None).await;
        }
        assert_eq!(m.compress().await.skipped, Some(SkipReason::Disabled));
    }

    #[tokio::test]
    async fn test_auto_compress_on_add() {
        let mut m = ContextWindowManager::builder("s")
            .window(window(300).with_auto_compress(true))
            .build()
            .await
            .unwrap();

        let mut reports = Vec::new();
        for i in 0..20 {
            if let Some(report) = m.add_message(MessageRole::User, text(25, i), None).await {
                reports.push(report);
            }
        }
        assert!(!reports.is_empty());
        assert!(m.total_tokens() <= 300);
        assert_layer_sums(&m);
    }

    #[tokio::test]
    async fn test_eviction_spares_persistent_and_tail() {
        let mut m = manager(100).await;
        let pinned = m.add_persistent(MessageRole::System, text(40, 99), None);
        for i in 0..6 {
            m.add_message(MessageRole::Assistant, text(20, i), None).await;
        }
        let tail: Vec<String> = m.layers().immediate().entries()[3..]
            .iter()
            .map(|e| e.id.clone())
            .collect();

        let evicted = m.evict();
        assert!(!evicted.is_empty());
        assert!(evicted.iter().all(|e| e.id != pinned && !tail.contains(&e.id)));
        assert_eq!(m.layers().persistent().len(), 1);
        assert_eq!(m.layers().immediate().len(), 3);
        assert_layer_sums(&m);
    }

    #[tokio::test]
    async fn test_eviction_prefers_low_priority() {
        let mut m = manager(50).await;
        m.add_message(MessageRole::System, "status ok. nothing to report here at all.", None)
            .await;
        let mut meta = Metadata::new();
        meta.insert("importance".to_string(), serde_json::json!(1.0));
        m.add_message(
            MessageRole::User,
            "Remember my name is Ada and I prefer metric units!",
            Some(meta),
        )
        .await;
        for i in 0..3 {
            m.add_message(MessageRole::User, text(8, i), None).await;
        }

        let evicted = m.evict();
        assert_eq!(evicted.len(), 1);
        assert!(evicted[0].content.starts_with("status ok"));
    }

    #[tokio::test]
    async fn test_failed_strategy_leaves_state_intact() {
        struct Inflating;

        #[async_trait]
        impl crate::compression::CompressionStrategy for Inflating {
            fn kind(&self) -> StrategyKind {
                StrategyKind::Summarize
            }

            async fn compress_segment(
                &self,
                segment: &[ContextMessage],
                _target_tokens: usize,
                _options: &CompressionOptions,
            ) -> crate::compression::SegmentOutput {
                let mut messages = segment.to_vec();
                messages.extend(segment.iter().cloned());
                crate::compression::SegmentOutput {
                    messages,
                    ..Default::default()
                }
            }
        }

        let mut registry = StrategyRegistry::empty();
        registry.register(Arc::new(Inflating));
        let mut m = ContextWindowManager::builder("s")
            .window(window(50))
            .strategies(registry)
            .build()
            .await
            .unwrap();
        for i in 0..6 {
            m.add_message(MessageRole::User, text(20, i), None).await;
        }
        let before = m.get_messages();

        let report = m.compress_context(Some(StrategyKind::Summarize)).await;
        let result = report.result.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(m.get_messages(), before);
        assert_eq!(m.compression_version(), 0);

        // Not registered: reported, not raised
        let report = m.compress_context(Some(StrategyKind::Hybrid)).await;
        assert!(!report.applied());
        assert_eq!(m.get_messages(), before);
    }

    #[tokio::test]
    async fn test_named_dispatch() {
        let mut m = manager(50).await;
        for i in 0..6 {
            m.add_message(MessageRole::User, text(20, i), None).await;
        }
        assert!(matches!(
            m.compress_context_named("zip").await,
            Err(WindlassError::UnknownStrategy(_))
        ));
        let report = m.compress_context_named("keyword-extract").await.unwrap();
        assert!(report.applied());
    }

    #[tokio::test]
    async fn test_llm_output_is_used() {
        let provider = Arc::new(MockLLMProvider::new(&["Short recap of the chat."]));
        let mut m = ContextWindowManager::builder("s")
            .window(window(100))
            .llm(provider.clone())
            .build()
            .await
            .unwrap();
        for i in 0..8 {
            m.add_message(MessageRole::User, text(20, i), None).await;
        }

        let report = m.compress_context(Some(StrategyKind::Summarize)).await;
        let result = report.result.unwrap();
        assert!(result.success);
        assert!(!result.used_fallback);
        assert_eq!(result.compressed_content(), "Short recap of the chat.");
    }

    #[tokio::test]
    async fn test_failing_provider_falls_back() {
        let mut m = ContextWindowManager::builder("s")
            .window(window(100))
            .llm(Arc::new(FailingProvider))
            .build()
            .await
            .unwrap();
        for i in 0..8 {
            m.add_message(MessageRole::User, text(20, i), None).await;
        }
        let report = m.compress_context(Some(StrategyKind::SemanticCluster)).await;
        let result = report.result.unwrap();
        assert!(result.success);
        assert!(result.used_fallback);
    }

    #[tokio::test]
    async fn test_analyze_is_pure() {
        let mut m = manager(100).await;
        for i in 0..5 {
            m.add_message(MessageRole::User, text(30, i), None).await;
        }
        let before = m.get_messages();
        let analysis = m.analyze_context();

        assert_eq!(analysis.total_tokens, 150);
        assert_eq!(analysis.message_count, 5);
        assert_eq!(analysis.average_tokens_per_message, 30.0);
        assert_eq!(analysis.context_utilization, 150.0);
        assert!(analysis.compression_needed);
        assert!((analysis.suggested_compression_ratio - 80.0 / 150.0).abs() < 1e-9);
        assert_eq!(analysis.layers.len(), 3);
        assert_eq!(m.get_messages(), before);
    }

    #[tokio::test]
    async fn test_reads() {
        let mut m = manager(1000).await;
        m.add_persistent(MessageRole::System, "be brief", None);
        m.add_message(MessageRole::User, "one", None).await;
        m.add_message(MessageRole::Assistant, "two", None).await;
        m.add_message(MessageRole::User, "three", None).await;

        let all: Vec<String> = m.get_messages().into_iter().map(|e| e.content).collect();
        assert_eq!(all, vec!["be brief", "one", "two", "three"]);

        let recent: Vec<String> = m.get_recent_messages(2).into_iter().map(|e| e.content).collect();
        assert_eq!(recent, vec!["two", "three"]);
        assert_eq!(m.get_recent_messages(10).len(), 4);

        let users: Vec<String> = m
            .get_messages_by_role(MessageRole::User)
            .into_iter()
            .map(|e| e.content)
            .collect();
        assert_eq!(users, vec!["one", "three"]);
    }

    #[tokio::test]
    async fn test_persistent_is_explicit_only() {
        let mut m = manager(1000).await;
        let id = m.add_persistent(MessageRole::System, "User is vegetarian", None);
        assert_eq!(m.layers().persistent().len(), 1);

        assert!(m.remove_persistent("nope").is_none());
        let removed = m.remove_persistent(&id).unwrap();
        assert_eq!(removed.content, "User is vegetarian");
        assert!(m.layers().persistent().is_empty());
        assert_eq!(m.layers().persistent().token_count(), 0);
    }

    #[tokio::test]
    async fn test_formatted_context_order() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut m = ContextWindowManager::builder("s")
            .window(window(1000))
            .clock(clock.clone())
            .build()
            .await
            .unwrap();

        m.add_persistent(MessageRole::System, "minor note", None);
        let mut meta = Metadata::new();
        meta.insert("importance".to_string(), serde_json::json!(1.0));
        m.add_persistent(MessageRole::User, "critical fact", Some(meta));

        let old = ContextMessage::summary("old summary", clock.now(), 3, "summarize", 4);
        clock.advance(chrono::Duration::minutes(5));
        let new = ContextMessage::summary("new summary", clock.now(), 3, "summarize", 4);
        let mut layers = m.layers().clone();
        layers.summarized_mut().extend(vec![old, new], clock.now());
        m.replace_layers(layers);

        for i in 0..12 {
            m.add_message(MessageRole::User, format!("msg{}", i), None).await;
        }

        let text = m.get_formatted_context(None);
        let pos = |needle: &str| text.find(needle).unwrap();
        assert!(pos("critical fact") < pos("minor note"));
        assert!(pos("minor note") < pos("new summary"));
        assert!(pos("new summary") < pos("old summary"));
        assert!(pos("old summary") < pos("msg2"));
        assert!(!text.contains("msg1\n"));
        assert!(pos("msg2") < pos("msg11"));

        let short = m.get_formatted_context(Some(12));
        assert!(TokenEstimator::new().estimate(&short) <= 12);
        assert!(short.contains("critical fact"));
        assert!(!short.contains("minor note"));

        // Nothing fits, not even a header
        assert_eq!(m.get_formatted_context(Some(5)), "");
    }

    #[tokio::test]
    async fn test_formatted_context_counts_headers() {
        let mut m = manager(1000).await;
        m.add_persistent(MessageRole::System, "fact", None);
        for i in 0..3 {
            m.add_message(MessageRole::User, format!("hi{}", i), None).await;
        }

        let estimator = TokenEstimator::new();
        for limit in [6, 10, 14, 20, 40] {
            let text = m.get_formatted_context(Some(limit));
            assert!(
                estimator.estimate(&text) <= limit,
                "limit {} exceeded: {:?}",
                limit,
                text
            );
        }
        let full = m.get_formatted_context(Some(40));
        assert!(full.contains("## Persistent context\nsystem: fact\n\n## Recent messages\n"));
        assert!(full.ends_with("user: hi2\n"));
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let storage = ContextStorage::new(store.clone());

        let mut m = ContextWindowManager::builder("s1")
            .window(window(1000))
            .storage(storage.clone())
            .build()
            .await
            .unwrap();
        m.add_persistent(MessageRole::System, "keep", None);
        m.add_message(MessageRole::User, "hello", None).await;
        m.save_to_storage().await.unwrap();
        assert!(!m.is_dirty());

        m.clear();
        assert_eq!(m.total_tokens(), 0);
        assert!(m.reload_from_storage().await.unwrap());
        assert_eq!(m.get_messages().len(), 2);

        let restored = ContextWindowManager::builder("s1")
            .window(window(1000))
            .storage(storage)
            .build()
            .await
            .unwrap();
        assert_eq!(restored.get_messages(), m.get_messages());
        assert_eq!(restored.layers().persistent().len(), 1);
    }

    #[tokio::test]
    async fn test_save_without_storage_is_error() {
        let mut m = manager(100).await;
        assert!(matches!(
            m.save_to_storage().await,
            Err(WindlassError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_persist_failure_is_not_fatal() {
        struct BrokenStore;

        #[async_trait]
        impl SnapshotStore for BrokenStore {
            async fn load(&self, _key: &str) -> Result<Option<ContextSnapshot>> {
                Ok(None)
            }

            async fn save(&self, _key: &str, _snapshot: &ContextSnapshot) -> Result<()> {
                Err(WindlassError::Storage("unavailable".to_string()))
            }

            async fn delete(&self, _key: &str) -> Result<bool> {
                Ok(false)
            }
        }

        let (tx, mut rx) = persistence_channel(8);
        let mut m = ContextWindowManager::builder("s")
            .window(window(1000).with_auto_persist(true))
            .storage(ContextStorage::new(Arc::new(BrokenStore)))
            .event_sender(tx)
            .build()
            .await
            .unwrap();

        m.add_message(MessageRole::User, "hello", None).await;
        assert_eq!(m.get_messages().len(), 1);
        m.close().await;

        assert!(matches!(
            rx.recv().await,
            Some(PersistenceEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_auto_persist_writes_latest_state() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let mut m = ContextWindowManager::builder("s")
            .window(window(1000).with_auto_persist(true))
            .storage(ContextStorage::new(store.clone()))
            .build()
            .await
            .unwrap();
        for i in 0..4 {
            m.add_message(MessageRole::User, format!("m{}", i), None).await;
        }
        m.close().await;

        let snapshot = store.load("s").await.unwrap().unwrap();
        assert_eq!(snapshot.entries.len(), 4);
    }

    #[tokio::test]
    async fn test_restored_session_keeps_auto_persisting() {
        let store = Arc::new(InMemorySnapshotStore::new());
        let storage = ContextStorage::new(store.clone());

        let mut first = ContextWindowManager::builder("s")
            .window(window(1000))
            .storage(storage.clone())
            .build()
            .await
            .unwrap();
        first.add_message(MessageRole::User, "before restart", None).await;
        first.save_to_storage().await.unwrap();
        drop(first);

        let mut second = ContextWindowManager::builder("s")
            .window(window(1000).with_auto_persist(true))
            .storage(storage)
            .build()
            .await
            .unwrap();
        assert_eq!(second.get_messages().len(), 1);
        second.add_message(MessageRole::User, "after restart", None).await;
        second.close().await;

        let snapshot = store.load("s").await.unwrap().unwrap();
        assert_eq!(snapshot.entries.len(), 2);
    }
}
