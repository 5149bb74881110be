//! Factory for creating LLM providers from configuration

use std::sync::Arc;

use crate::config::{LLMProviderConfig, LLMProviderKind};
use crate::error::Result;
use crate::llm::{LLMProvider, StubLLMProvider};

#[cfg(feature = "llm-ollama")]
use crate::llm::providers::ollama::OllamaProvider;

/// Factory for creating LLM providers
pub struct LLMProviderFactory;

impl LLMProviderFactory {
    /// Create an LLM provider from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the provider's feature is not compiled in.
    pub fn create(config: &LLMProviderConfig) -> Result<Arc<dyn LLMProvider>> {
        match config.provider {
            LLMProviderKind::Stub => Ok(Arc::new(StubLLMProvider)),

            #[cfg(feature = "llm-ollama")]
            LLMProviderKind::Ollama => {
                let model = (!config.model.is_empty()).then(|| config.model.clone());
                let provider = match &config.base_url {
                    Some(url) => OllamaProvider::new(
                        model.unwrap_or_else(|| "qwen3:14b".to_string()),
                        Some(url.clone()),
                    ),
                    None => OllamaProvider::from_env(model),
                };
                Ok(Arc::new(provider))
            }

            #[cfg(not(feature = "llm-ollama"))]
            LLMProviderKind::Ollama => Err(crate::error::WindlassError::Configuration(
                "Ollama provider requires 'llm-ollama' feature".to_string(),
            )),
        }
    }

    /// Create a provider from optional configuration, falling back to the stub
    pub fn create_or_stub(config: Option<&LLMProviderConfig>) -> Result<Arc<dyn LLMProvider>> {
        match config {
            Some(config) => Self::create(config),
            None => Ok(Arc::new(StubLLMProvider)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_from_config() {
        let config = LLMProviderConfig {
            provider: LLMProviderKind::Stub,
            model: String::new(),
            base_url: None,
        };
        let provider = LLMProviderFactory::create(&config).unwrap();
        assert_eq!(provider.model_info().provider, "stub");
    }

    #[test]
    fn test_missing_config_uses_stub() {
        let provider = LLMProviderFactory::create_or_stub(None).unwrap();
        assert_eq!(provider.model_info().provider, "stub");
    }

    #[cfg(not(feature = "llm-ollama"))]
    #[test]
    fn test_ollama_requires_feature() {
        let config = LLMProviderConfig {
            provider: LLMProviderKind::Ollama,
            model: "llama3.2".to_string(),
            base_url: None,
        };
        assert!(LLMProviderFactory::create(&config).is_err());
    }

    #[cfg(feature = "llm-ollama")]
    #[test]
    fn test_ollama_from_config() {
        let config = LLMProviderConfig {
            provider: LLMProviderKind::Ollama,
            model: "llama3.2".to_string(),
            base_url: Some("http://ollama.local:11434".to_string()),
        };
        let provider = LLMProviderFactory::create(&config).unwrap();
        assert_eq!(provider.model_info().model_name, "llama3.2");
    }
}
