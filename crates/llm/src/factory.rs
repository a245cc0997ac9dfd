//! Backend selection from settings

use std::sync::Arc;

use medirag_config::constants::endpoints;
use medirag_config::{LlmProviderKind, LlmSettings};
use medirag_core::LanguageModel;

use crate::backend::{OllamaBackend, OllamaConfig, OpenAIBackend, OpenAIConfig};
use crate::LlmError;

/// Build the configured generation backend
pub fn create_language_model(settings: &LlmSettings) -> Result<Arc<dyn LanguageModel>, LlmError> {
    match settings.provider {
        LlmProviderKind::OpenAI => {
            let config = OpenAIConfig {
                endpoint: settings
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| endpoints::OPENAI_DEFAULT.to_string()),
                api_key: settings.api_key.clone().unwrap_or_default(),
                model: settings.model.clone(),
                max_tokens: settings.max_tokens,
                temperature: settings.temperature,
                timeout: settings.timeout(),
                max_retries: settings.max_retries,
                ..Default::default()
            };
            Ok(Arc::new(OpenAIBackend::new(config)?))
        }
        LlmProviderKind::Ollama => {
            let config = OllamaConfig {
                endpoint: settings
                    .endpoint
                    .clone()
                    .unwrap_or_else(|| endpoints::OLLAMA_DEFAULT.to_string()),
                model: settings.model.clone(),
                max_tokens: settings.max_tokens,
                temperature: settings.temperature,
                timeout: settings.timeout(),
                max_retries: settings.max_retries,
                ..Default::default()
            };
            Ok(Arc::new(OllamaBackend::new(config)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_requires_key_for_remote() {
        let settings = LlmSettings::default();
        let result = create_language_model(&settings);
        assert!(matches!(result, Err(LlmError::Configuration(_))));
    }

    #[test]
    fn test_openai_with_key() {
        let settings = LlmSettings {
            api_key: Some("sk-test".to_string()),
            ..Default::default()
        };
        let model = create_language_model(&settings).unwrap();
        assert_eq!(model.model_name(), "gpt-4o-mini");
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let settings = LlmSettings {
            provider: LlmProviderKind::Ollama,
            model: "llama3".to_string(),
            ..Default::default()
        };
        let model = create_language_model(&settings).unwrap();
        assert_eq!(model.model_name(), "llama3");
    }
}
