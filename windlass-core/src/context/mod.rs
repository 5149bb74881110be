//! Context window manager
//!
//! Tiered context window for one session: new messages land in the immediate
//! layer, older turns are compressed into the summarized layer when the window
//! passes its ceiling, and the persistent layer holds facts only the caller
//! changes.
//!
//! # Example
//!
//! ```rust,ignore
//! use windlass_core::context::ContextWindowManager;
//! use windlass_core::config::WindowConfig;
//!
//! let mut window = ContextWindowManager::builder("user-42")
//!     .window(WindowConfig::new().with_max_tokens(4096))
//!     .llm(provider)
//!     .storage(storage)
//!     .build()
//!     .await?;
//!
//! if let Some(report) = window.add_message(MessageRole::User, "hello", None).await {
//!     println!("compressed: {} -> {} tokens", report.tokens_before, report.tokens_after);
//! }
//!
//! let prompt_context = window.get_formatted_context(Some(2048));
//! ```

mod export;
mod manager;

pub use export::{ContextExport, EXPORT_VERSION, ExportMetadata, ExportedMessage};
pub use manager::{
    CompressionReport, ContextAnalysis, ContextWindowManager, ContextWindowManagerBuilder,
    SkipReason, WindowState,
};
