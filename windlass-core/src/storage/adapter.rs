//! Bridge between in-memory session state and a snapshot store

use chrono::Utc;
use std::sync::Arc;

use super::{
    ContextSnapshot, FieldCipher, PlaintextCipher, SessionState, SnapshotEntry, SnapshotStore,
};
use crate::error::{Result, WindlassError};
use crate::layers::LayerKind;
use crate::message::{ContextMessage, Metadata};

/// Serializes session state to snapshots, applying the field cipher to every
/// entry's content and metadata
#[derive(Clone)]
pub struct ContextStorage {
    store: Arc<dyn SnapshotStore>,
    cipher: Arc<dyn FieldCipher>,
}

impl ContextStorage {
    /// Storage without encryption
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            cipher: Arc::new(PlaintextCipher),
        }
    }

    /// Use `cipher` for content and metadata
    pub fn with_cipher(mut self, cipher: Arc<dyn FieldCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Persist `state` under its session id
    pub async fn save(&self, state: &SessionState) -> Result<()> {
        let snapshot = self.seal(state)?;
        self.store.save(&state.session_id, &snapshot).await
    }

    /// Load the state for `session_id`; `None` when nothing was stored
    pub async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        match self.store.load(session_id).await? {
            Some(snapshot) => self.open(snapshot).map(Some),
            None => Ok(None),
        }
    }

    /// Remove the stored state for `session_id`
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        self.store.delete(session_id).await
    }

    /// Build the stored form of `state`
    pub fn seal(&self, state: &SessionState) -> Result<ContextSnapshot> {
        let encrypted = !self.cipher.is_plaintext();

        let entries = state
            .entries
            .iter()
            .map(|(layer, message)| -> Result<SnapshotEntry> {
                let (content, metadata) = if encrypted {
                    let metadata = serde_json::to_string(&message.metadata)?;
                    (
                        self.cipher.encrypt(&message.content)?,
                        serde_json::Value::String(self.cipher.encrypt(&metadata)?),
                    )
                } else {
                    (
                        message.content.clone(),
                        serde_json::Value::Object(message.metadata.clone()),
                    )
                };

                Ok(SnapshotEntry {
                    layer: *layer,
                    id: message.id.clone(),
                    role: message.role,
                    content,
                    timestamp: message.timestamp,
                    token_count: message.token_count,
                    metadata,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ContextSnapshot {
            session_id: state.session_id.clone(),
            entries,
            tokens_used: state.tokens_used(),
            compression_version: state.compression_version,
            last_compressed: state.last_compressed,
            saved_at: Utc::now(),
            encrypted,
        })
    }

    /// Recover plaintext state from a stored snapshot
    pub fn open(&self, snapshot: ContextSnapshot) -> Result<SessionState> {
        if snapshot.encrypted && self.cipher.is_plaintext() {
            return Err(WindlassError::Encryption(format!(
                "snapshot for {} is encrypted but no cipher is configured",
                snapshot.session_id
            )));
        }

        let entries = snapshot
            .entries
            .into_iter()
            .map(|entry| -> Result<(LayerKind, ContextMessage)> {
                let (content, metadata) = if snapshot.encrypted {
                    let content = self.cipher.decrypt(&entry.content)?;
                    let metadata = match entry.metadata {
                        serde_json::Value::String(sealed) => {
                            serde_json::from_str(&self.cipher.decrypt(&sealed)?)?
                        }
                        _ => {
                            return Err(WindlassError::Encryption(format!(
                                "entry {} has unencrypted metadata in an encrypted snapshot",
                                entry.id
                            )));
                        }
                    };
                    (content, metadata)
                } else {
                    let metadata = match entry.metadata {
                        serde_json::Value::Object(map) => map,
                        _ => Metadata::new(),
                    };
                    (entry.content, metadata)
                };

                let message = ContextMessage {
                    id: entry.id,
                    role: entry.role,
                    content,
                    timestamp: entry.timestamp,
                    token_count: entry.token_count,
                    metadata,
                };
                Ok((entry.layer, message))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SessionState {
            session_id: snapshot.session_id,
            entries,
            compression_version: snapshot.compression_version,
            last_compressed: snapshot.last_compressed,
        })
    }
}
