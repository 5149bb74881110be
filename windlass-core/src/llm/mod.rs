//! LLM provider boundary.
//!
//! Every compression strategy calls out through [`LLMProvider`] for its
//! primary path. Providers are treated as unreliable: every call site has a
//! deterministic fallback, so a provider error never reaches the caller of the
//! window manager.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WindlassError};
use crate::message::MessageRole;

pub mod factory;
pub mod json;
pub mod providers;

pub use factory::LLMProviderFactory;
pub use json::{extract_json, strip_code_fences};

/// A message sent to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Request to an LLM provider
#[derive(Debug, Clone)]
pub struct LLMRequest {
    /// Messages in the conversation
    pub messages: Vec<ChatMessage>,

    /// Temperature for generation (0.0-2.0)
    pub temperature: Option<f32>,

    /// Maximum tokens to generate
    pub max_tokens: Option<usize>,
}

impl LLMRequest {
    /// Create a simple request from a single prompt
    pub fn from_prompt(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::new(MessageRole::User, prompt)],
            temperature: None,
            max_tokens: None,
        }
    }

    /// Create a request with a system prompt
    pub fn with_system_prompt(
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            messages: vec![
                ChatMessage::new(MessageRole::System, system_prompt),
                ChatMessage::new(MessageRole::User, user_prompt),
            ],
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    pub fn max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = Some(tokens);
        self
    }
}

/// Response from an LLM provider
#[derive(Debug, Clone)]
pub struct LLMResponse {
    /// Generated content
    pub content: String,

    /// Token usage information
    pub usage: Option<TokenUsage>,
}

/// Token usage information
#[derive(Debug, Clone, Copy)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Model information
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub provider: String,
    pub model_name: String,
}

/// Trait for LLM provider implementations
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Run a chat completion
    async fn complete(&self, request: &LLMRequest) -> Result<LLMResponse>;

    /// Get model information
    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "unknown".to_string(),
            model_name: "unknown".to_string(),
        }
    }
}

/// Provider that always fails.
///
/// With it installed every strategy runs its deterministic fallback, which
/// makes compression fully reproducible.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubLLMProvider;

#[async_trait]
impl LLMProvider for StubLLMProvider {
    async fn complete(&self, _request: &LLMRequest) -> Result<LLMResponse> {
        Err(WindlassError::Provider(
            "LLM provider not configured".to_string(),
        ))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "stub".to_string(),
            model_name: "none".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct EchoProvider {
        seen: Mutex<Vec<LLMRequest>>,
    }

    #[async_trait]
    impl LLMProvider for EchoProvider {
        async fn complete(&self, request: &LLMRequest) -> Result<LLMResponse> {
            self.seen.lock().unwrap().push(request.clone());
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(LLMResponse {
                content: last,
                usage: None,
            })
        }
    }

    #[test]
    fn test_temperature_clamping() {
        let request = LLMRequest::from_prompt("x").temperature(5.0);
        assert_eq!(request.temperature, Some(2.0));

        let request = LLMRequest::from_prompt("x").temperature(-1.0);
        assert_eq!(request.temperature, Some(0.0));
    }

    #[tokio::test]
    async fn test_stub_provider_fails() {
        let result = StubLLMProvider
            .complete(&LLMRequest::from_prompt("test"))
            .await;
        assert!(matches!(result, Err(WindlassError::Provider(_))));
        assert_eq!(StubLLMProvider.model_info().provider, "stub");
    }

    #[tokio::test]
    async fn test_request_with_system_prompt() {
        let provider = EchoProvider {
            seen: Mutex::new(Vec::new()),
        };
        let request = LLMRequest::with_system_prompt("be brief", "hello").max_tokens(42);

        let response = provider.complete(&request).await.unwrap();
        assert_eq!(response.content, "hello");

        let seen = provider.seen.lock().unwrap();
        assert_eq!(seen[0].messages.len(), 2);
        assert_eq!(seen[0].messages[0].role, MessageRole::System);
        assert_eq!(seen[0].messages[1].role, MessageRole::User);
        assert_eq!(seen[0].max_tokens, Some(42));
        assert_eq!(seen[0].temperature, None);
    }
}
