//! Snapshot persistence.
//!
//! The window manager works on plaintext in memory. [`ContextStorage`] turns
//! a session's layered state into a [`ContextSnapshot`] (applying the field
//! cipher) and hands it to a [`SnapshotStore`]. A missing snapshot is not an
//! error; the session simply starts empty.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;
use crate::layers::LayerKind;
use crate::message::{ContextMessage, MessageRole};

mod adapter;
mod cipher;
mod file;
mod memory;

pub use adapter::ContextStorage;
pub use cipher::{FieldCipher, PlaintextCipher};
pub use file::FileSnapshotStore;
pub use memory::InMemorySnapshotStore;

/// Plaintext state of one session, as the manager sees it
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: String,

    /// Every entry tagged with its layer, in context order
    pub entries: Vec<(LayerKind, ContextMessage)>,

    /// Number of compressions applied so far
    pub compression_version: u32,

    pub last_compressed: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Sum of every entry's token count
    pub fn tokens_used(&self) -> usize {
        self.entries.iter().map(|(_, e)| e.token_count).sum()
    }
}

/// One stored entry. `content` and `metadata` may be ciphertext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub layer: LayerKind,
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub token_count: usize,
    /// An object in plaintext snapshots, a ciphertext string in encrypted ones
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Serialized form of a session written to a store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub session_id: String,
    pub entries: Vec<SnapshotEntry>,
    pub tokens_used: usize,
    pub compression_version: u32,
    #[serde(default)]
    pub last_compressed: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
    /// Whether `content` and `metadata` fields are encrypted
    #[serde(default)]
    pub encrypted: bool,
}

/// Key-value store of session snapshots
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the snapshot for `key`, if one exists
    async fn load(&self, key: &str) -> Result<Option<ContextSnapshot>>;

    /// Write (or overwrite) the snapshot for `key`
    async fn save(&self, key: &str, snapshot: &ContextSnapshot) -> Result<()>;

    /// Remove the snapshot for `key`, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Build the store named by configuration
pub fn store_from_config(config: &StorageConfig) -> Arc<dyn SnapshotStore> {
    match &config.backend {
        StorageBackend::Memory => Arc::new(InMemorySnapshotStore::new()),
        StorageBackend::File { dir } => Arc::new(FileSnapshotStore::new(dir.clone())),
    }
}
