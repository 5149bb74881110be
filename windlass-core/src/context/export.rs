//! Portable JSON form of a context window

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ContextWindowManager;
use crate::error::{Result, WindlassError};
use crate::layers::{LayerKind, LayeredContext};
use crate::message::{ContextMessage, MessageRole, Metadata};

/// Export format version
pub const EXPORT_VERSION: &str = "1.0";

/// Exported window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextExport {
    pub version: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub messages: Vec<ExportedMessage>,
    pub metadata: ExportMetadata,
}

/// One exported entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    pub layer: LayerKind,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMetadata {
    pub total_messages: usize,
    pub total_tokens: usize,
    pub compression_version: u32,
}

impl ContextWindowManager {
    /// Every entry with its layer, in context order
    pub fn export_context(&self) -> ContextExport {
        let messages: Vec<ExportedMessage> = self
            .layers()
            .tagged_entries()
            .map(|(layer, m)| ExportedMessage {
                id: m.id.clone(),
                role: m.role,
                content: m.content.clone(),
                timestamp: m.timestamp,
                token_count: m.token_count,
                layer,
                metadata: m.metadata.clone(),
            })
            .collect();

        ContextExport {
            version: EXPORT_VERSION.to_string(),
            timestamp: self.now(),
            session_id: self.session_id().to_string(),
            metadata: ExportMetadata {
                total_messages: messages.len(),
                total_tokens: self.total_tokens(),
                compression_version: self.compression_version(),
            },
            messages,
        }
    }

    /// Replace every layer with the entries of an exported window.
    ///
    /// Missing fields take defaults (`role` user, empty `content`, `timestamp`
    /// now, `layer` immediate, token count estimated). Nothing changes unless
    /// the whole payload is valid.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `messages` is not an array, an entry is
    /// not an object, or a present field has the wrong form.
    pub fn import_context(&mut self, payload: &Value) -> Result<()> {
        let items = payload
            .get("messages")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                WindlassError::Validation("import payload: messages must be an array".to_string())
            })?;

        let now = self.now();
        let entries = items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_entry(i, item, now))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            session_id = %self.session_id(),
            entries = entries.len(),
            "context imported"
        );
        self.replace_layers(LayeredContext::from_entries(entries, now));
        Ok(())
    }
}

fn parse_entry(
    index: usize,
    item: &Value,
    now: DateTime<Utc>,
) -> Result<(LayerKind, ContextMessage)> {
    let invalid = |what: &str| {
        WindlassError::Validation(format!("import payload: message {}: {}", index, what))
    };
    let object = item.as_object().ok_or_else(|| invalid("not an object"))?;

    let text = |key: &str| string_field(object, key).map_err(|e| invalid(&e));

    let role = match text("role")? {
        Some(role) => role
            .parse::<MessageRole>()
            .map_err(|_| invalid(&format!("unknown role {}", role)))?,
        None => MessageRole::User,
    };
    let layer = match text("layer")? {
        Some(layer) => layer
            .parse::<LayerKind>()
            .map_err(|_| invalid(&format!("unknown layer {}", layer)))?,
        None => LayerKind::Immediate,
    };
    let timestamp = match text("timestamp")? {
        Some(ts) => DateTime::parse_from_rfc3339(ts)
            .map_err(|e| invalid(&format!("bad timestamp: {}", e)))?
            .with_timezone(&Utc),
        None => now,
    };
    let content = text("content")?.unwrap_or_default().to_string();

    let mut message = ContextMessage::at(role, content, timestamp);
    if let Some(id) = text("id")? {
        message.id = id.to_string();
    }
    // 0 is re-estimated when the entry enters its layer
    message.token_count = object
        .get("tokenCount")
        .or_else(|| object.get("tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;
    match object.get("metadata") {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => message.metadata = map.clone(),
        Some(_) => return Err(invalid("metadata must be an object")),
    }

    Ok((layer, message))
}

fn string_field<'a>(
    object: &'a Metadata,
    key: &str,
) -> std::result::Result<Option<&'a str>, String> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(format!("{} must be a string", key)),
    }
}
