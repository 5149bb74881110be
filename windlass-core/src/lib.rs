//! # Windlass - tiered context windows for LLM agents
//!
//! Windlass keeps a conversation inside a fixed token budget without losing
//! what matters:
//! - Three layers per session: immediate turns, compressed summaries and
//!   caller-managed persistent facts
//! - Six compression strategies (summarize, keyword extraction, semantic
//!   clustering, temporal buckets, selective retention, hybrid), each with a
//!   deterministic fallback when the LLM is unavailable
//! - Priority-scored eviction when compression alone is not enough
//! - Snapshot persistence with optional field encryption, written in the
//!   background
//! - A registry of live sessions with idle cleanup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use windlass_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut window = ContextWindowManager::builder("session-1")
//!         .window(WindowConfig::new().with_max_tokens(2048))
//!         .build()
//!         .await?;
//!
//!     window.add_message(MessageRole::User, "My name is Ada.", None).await;
//!     let analysis = window.analyze_context();
//!     println!("{} tokens in use", analysis.total_tokens);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `llm-ollama`: Ollama chat provider (via `reqwest`)

pub mod compression;
pub mod config;
pub mod context;
pub mod error;
pub mod layers;
pub mod llm;
pub mod message;
pub mod priority;
pub mod session;
pub mod storage;
pub mod text;
pub mod tokens;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::compression::{
        CompressionOptions, CompressionResult, CompressionStrategy, ContentType, StrategyKind,
        StrategyRegistry, get_recommended_strategy,
    };
    pub use crate::config::{
        BudgetShares, HybridConfig, LLMProviderConfig, LLMProviderKind, PriorityConfig,
        SessionConfig, StorageBackend, StorageConfig, WindlassConfig, WindowConfig,
    };
    pub use crate::context::{
        CompressionReport, ContextAnalysis, ContextExport, ContextWindowManager, SkipReason,
        WindowState,
    };
    pub use crate::error::{Result, WindlassError};
    pub use crate::layers::{LayerKind, LayeredContext, TokenBudget};
    pub use crate::llm::{
        LLMProvider, LLMProviderFactory, LLMRequest, LLMResponse, StubLLMProvider,
    };
    pub use crate::message::{ContextMessage, MessageRole, Metadata};
    pub use crate::priority::{PriorityScorer, PriorityWeights};
    pub use crate::session::{
        Clock, ManualClock, PersistenceEvent, SessionRegistry, SystemClock, persistence_channel,
    };
    pub use crate::storage::{
        ContextStorage, FieldCipher, FileSnapshotStore, InMemorySnapshotStore, PlaintextCipher,
        SnapshotStore, store_from_config,
    };
    pub use crate::tokens::TokenEstimator;
}
