//! Context messages: the entries held in every context layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Open key-value metadata attached to a message
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Metadata key marking the kind of entry (`"summary"` for compressed output)
pub const META_TYPE: &str = "type";

/// Value of [`META_TYPE`] for summary entries
pub const SUMMARY_TYPE: &str = "summary";

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageRole {
    type Err = crate::error::WindlassError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(MessageRole::System),
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            other => Err(crate::error::WindlassError::Validation(format!(
                "unknown message role: {}",
                other
            ))),
        }
    }
}

/// A single entry in the context window.
///
/// Token counts are filled in by the window manager when a message is added
/// without one. Once an entry has been folded into a summary it is never
/// modified again; the summary is a new entry tagged `type = "summary"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMessage {
    /// Unique identifier (uuid v4)
    pub id: String,

    /// Author of the message
    pub role: MessageRole,

    /// Message text
    pub content: String,

    /// When the message was created
    pub timestamp: DateTime<Utc>,

    /// Estimated token cost (0 means "not yet estimated")
    #[serde(default)]
    pub token_count: usize,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: Metadata,
}

impl ContextMessage {
    /// Create a message stamped with the current time
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self::at(role, content, Utc::now())
    }

    /// Create a message with an explicit timestamp
    pub fn at(role: MessageRole, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            timestamp,
            token_count: 0,
            metadata: Metadata::new(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    /// Create a summary entry produced by a compression strategy
    pub fn summary(
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
        token_count: usize,
        strategy: &str,
        source_count: usize,
    ) -> Self {
        let mut message = Self::at(MessageRole::System, content, timestamp);
        message.token_count = token_count;
        message
            .metadata
            .insert(META_TYPE.to_string(), SUMMARY_TYPE.into());
        message
            .metadata
            .insert("strategy".to_string(), strategy.into());
        message
            .metadata
            .insert("source_count".to_string(), source_count.into());
        message
    }

    /// Attach metadata, replacing any existing map
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Set a single metadata field
    pub fn with_meta(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Set a known token count
    pub fn with_token_count(mut self, tokens: usize) -> Self {
        self.token_count = tokens;
        self
    }

    /// Whether this entry is the output of an earlier compression
    pub fn is_summary(&self) -> bool {
        self.meta_str(META_TYPE) == Some(SUMMARY_TYPE)
    }

    /// Read a string metadata field
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Read a numeric metadata field
    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.metadata.get(key).and_then(|v| v.as_f64())
    }

    /// Read a boolean metadata field
    pub fn meta_bool(&self, key: &str) -> Option<bool> {
        self.metadata.get(key).and_then(|v| v.as_bool())
    }
}
