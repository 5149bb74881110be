//! Configuration types for windlass

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::compression::{ContentType, StrategyKind};
use crate::error::{Result, WindlassError};
use crate::priority::PriorityWeights;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WindlassConfig {
    /// Context window behaviour
    pub window: WindowConfig,

    /// Per-layer share of the token budget
    pub budget: BudgetShares,

    /// Eviction priority scoring
    pub priority: PriorityConfig,

    /// Hybrid strategy thresholds
    pub hybrid: HybridConfig,

    /// In-process session cache
    pub sessions: SessionConfig,

    /// Snapshot persistence
    pub storage: StorageConfig,

    /// LLM provider configuration (optional; without one every strategy runs
    /// its deterministic fallback)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LLMProviderConfig>,
}

/// Configuration for context window behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Hard ceiling on total context tokens
    pub max_context_tokens: usize,

    /// Number of most recent messages never touched by compression
    pub preserve_last_n: usize,

    /// Minimum number of immediate messages before compression runs
    pub min_messages_to_compress: usize,

    /// Whether compression is allowed at all
    pub compression_enabled: bool,

    /// Compress automatically when a new message pushes the window over budget
    pub auto_compress: bool,

    /// Persist in the background after every mutation
    pub auto_persist: bool,

    /// Fraction of `max_context_tokens` to compress down to
    pub target_ratio: f64,

    /// Strategy to use when the caller does not pin one (None = recommend)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_strategy: Option<StrategyKind>,

    /// Kind of content held in this window, used for strategy recommendation
    pub content_type: ContentType,

    /// Number of immediate messages included in formatted context
    pub formatted_recent_limit: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 8192,
            preserve_last_n: 5,
            min_messages_to_compress: 5,
            compression_enabled: true,
            auto_compress: true,
            auto_persist: true,
            target_ratio: 0.8,
            default_strategy: None,
            content_type: ContentType::Conversation,
            formatted_recent_limit: 10,
        }
    }
}

impl WindowConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hard token ceiling
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_context_tokens = max_tokens.max(1);
        self
    }

    /// Set how many recent messages survive compression untouched
    pub fn with_preserve_last_n(mut self, count: usize) -> Self {
        self.preserve_last_n = count;
        self
    }

    /// Set the minimum message count for compression
    pub fn with_min_messages(mut self, count: usize) -> Self {
        self.min_messages_to_compress = count;
        self
    }

    /// Enable or disable compression
    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression_enabled = enabled;
        self
    }

    /// Enable or disable compression on `add_message`
    pub fn with_auto_compress(mut self, enabled: bool) -> Self {
        self.auto_compress = enabled;
        self
    }

    /// Enable or disable background persistence
    pub fn with_auto_persist(mut self, enabled: bool) -> Self {
        self.auto_persist = enabled;
        self
    }

    /// Set the post-compression target as a fraction of the ceiling
    pub fn with_target_ratio(mut self, ratio: f64) -> Self {
        self.target_ratio = ratio.clamp(0.1, 1.0);
        self
    }

    /// Pin a default strategy
    pub fn with_default_strategy(mut self, strategy: StrategyKind) -> Self {
        self.default_strategy = Some(strategy);
        self
    }

    /// Set the content type used for strategy recommendation
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    /// Token count compression aims for
    pub fn target_tokens(&self) -> usize {
        ((self.max_context_tokens as f64) * self.target_ratio) as usize
    }
}

/// Fractions of the total budget given to each layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetShares {
    pub immediate: f64,
    pub summarized: f64,
    pub persistent: f64,
}

impl Default for BudgetShares {
    fn default() -> Self {
        Self {
            immediate: 0.40,
            summarized: 0.35,
            persistent: 0.25,
        }
    }
}

impl BudgetShares {
    /// Reject negative shares and shares that over-commit the budget
    pub fn validate(&self) -> Result<()> {
        let shares = [self.immediate, self.summarized, self.persistent];
        if shares.iter().any(|s| !s.is_finite() || *s < 0.0) {
            return Err(WindlassError::Validation(
                "budget shares must be non-negative".to_string(),
            ));
        }
        let sum: f64 = shares.iter().sum();
        if sum > 1.0 + f64::EPSILON {
            return Err(WindlassError::Validation(format!(
                "budget shares sum to {:.2}, which exceeds the total",
                sum
            )));
        }
        Ok(())
    }
}

/// Priority scoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Sub-score weights
    pub weights: PriorityWeights,

    /// Age at which the recency sub-score halves
    #[serde(with = "humantime_serde")]
    pub recency_half_life: Duration,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        Self {
            weights: PriorityWeights::default(),
            recency_half_life: Duration::from_secs(24 * 3600),
        }
    }
}

/// Thresholds for the hybrid dispatcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    /// Segments longer than this are summarized wholesale
    pub summarize_above_entries: usize,

    /// Leading share of the segment handled by selective retention
    pub selective_share: f64,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            summarize_above_entries: 20,
            selective_share: 0.6,
        }
    }
}

/// Session cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Sessions untouched for this long are dropped from memory
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// How often the background sweeper runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Capacity of the persistence event channel
    pub persistence_event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            persistence_event_buffer: 32,
        }
    }
}

/// Snapshot storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Where snapshots live
    pub backend: StorageBackend,
}

/// Snapshot storage backend
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// Process-local, lost on exit
    #[default]
    Memory,

    /// One JSON file per session
    File {
        /// Directory holding snapshot files
        dir: PathBuf,
    },
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMProviderConfig {
    /// Provider type
    pub provider: LLMProviderKind,

    /// Model name
    pub model: String,

    /// Base URL (for custom endpoints)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// LLM provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LLMProviderKind {
    /// Deterministic fallbacks only
    Stub,
    Ollama,
}

impl WindlassConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (windlass.toml)
    /// 3. File named by WINDLASS_CONFIG_PATH, if set
    /// 4. Environment variable overrides (WINDLASS_WINDOW__MAX_CONTEXT_TOKENS, ...)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(WindlassConfig::default()))
            .merge(Toml::file("windlass.toml"));

        if let Ok(path) = std::env::var("WINDLASS_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: WindlassConfig = figment
            .merge(Env::prefixed("WINDLASS_").split("__"))
            .extract()
            .map_err(|e| {
                WindlassError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: WindlassConfig = Figment::from(Serialized::defaults(WindlassConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()
            .map_err(|e| {
                WindlassError::Configuration(format!(
                    "Failed to load configuration file {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.window.max_context_tokens == 0 {
            return Err(WindlassError::Validation(
                "window.max_context_tokens must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.window.target_ratio) || self.window.target_ratio == 0.0 {
            return Err(WindlassError::Validation(format!(
                "window.target_ratio must be in (0, 1], got {}",
                self.window.target_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.hybrid.selective_share) {
            return Err(WindlassError::Validation(format!(
                "hybrid.selective_share must be in [0, 1], got {}",
                self.hybrid.selective_share
            )));
        }
        self.budget.validate()?;
        self.priority.weights.validate()?;
        Ok(())
    }
}
