//! Narrative synthesis
//!
//! Turns the final ranked candidates into a grounded explanation using the
//! configured language model. Prior session turns are included when given.

use std::sync::Arc;
use std::time::Duration;

use medirag_config::{LlmSettings, MemorySettings};
use medirag_core::{ConversationTurn, Error, LanguageModel, Result, ScoredCandidate};
use medirag_llm::PromptBuilder;

/// Synthesis configuration
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    /// Characters of each prior response included in the prompt
    pub preview_chars: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self::from_settings(&LlmSettings::default(), &MemorySettings::default())
    }
}

impl SynthesisConfig {
    pub fn from_settings(llm: &LlmSettings, memory: &MemorySettings) -> Self {
        Self {
            max_tokens: llm.max_tokens,
            temperature: llm.temperature,
            timeout: llm.timeout(),
            preview_chars: memory.response_preview_chars,
        }
    }
}

/// Grounded narrative generator
pub struct ResponseSynthesizer {
    llm: Option<Arc<dyn LanguageModel>>,
    config: SynthesisConfig,
}

impl ResponseSynthesizer {
    pub fn new(config: SynthesisConfig, llm: Arc<dyn LanguageModel>) -> Self {
        Self {
            llm: Some(llm),
            config,
        }
    }

    /// Synthesizer with no model; requests skip narration
    pub fn disabled() -> Self {
        Self {
            llm: None,
            config: SynthesisConfig::default(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.llm.is_some()
    }

    /// Generate the narrative for `query`
    ///
    /// With no candidates the model is told nothing was found rather than
    /// being asked to recommend.
    pub async fn synthesize(
        &self,
        query: &str,
        drugs: &[ScoredCandidate],
        diseases: &[ScoredCandidate],
        history: &[ConversationTurn],
    ) -> Result<String> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| Error::Configuration("No language model configured".to_string()))?;

        let request = PromptBuilder::new(!diseases.is_empty())
            .with_history(history, self.config.preview_chars)
            .with_max_tokens(self.config.max_tokens)
            .with_temperature(self.config.temperature)
            .build(query, drugs, diseases);

        let response = tokio::time::timeout(self.config.timeout, llm.generate(request))
            .await
            .map_err(|_| Error::timeout("generation", self.config.timeout))??;

        let text = response.text.trim();
        if text.is_empty() {
            return Err(Error::provider(llm.model_name(), "Empty completion"));
        }

        tracing::debug!(
            model = llm.model_name(),
            chars = text.chars().count(),
            history_turns = history.len(),
            "Narrative generated"
        );
        Ok(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use medirag_core::{Document, DocumentKind, GenerateRequest, GenerateResponse, MatchChannel};
    use std::sync::Mutex;

    struct EchoModel {
        reply: String,
        delay: Duration,
        seen: Mutex<Option<GenerateRequest>>,
    }

    #[async_trait]
    impl LanguageModel for EchoModel {
        async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
            tokio::time::sleep(self.delay).await;
            *self.seen.lock().unwrap() = Some(request);
            Ok(GenerateResponse::new(self.reply.clone()))
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    fn model(reply: &str, delay: Duration) -> Arc<EchoModel> {
        Arc::new(EchoModel {
            reply: reply.to_string(),
            delay,
            seen: Mutex::new(None),
        })
    }

    fn candidate() -> ScoredCandidate {
        ScoredCandidate {
            document: Arc::new(Document::new("D1", DocumentKind::Drug, "타이레놀정")),
            dense_score: Some(1.0),
            sparse_score: None,
            fused_score: 0.7,
            rerank_score: None,
            channel: MatchChannel::Dense,
        }
    }

    #[tokio::test]
    async fn test_synthesize_trims_reply() {
        let llm = model("  답변입니다 \n", Duration::ZERO);
        let synth = ResponseSynthesizer::new(SynthesisConfig::default(), llm.clone());

        let text = synth.synthesize("두통", &[candidate()], &[], &[]).await.unwrap();
        assert_eq!(text, "답변입니다");

        let seen = llm.seen.lock().unwrap().clone().unwrap();
        assert!(seen.messages[1].content.contains("타이레놀정"));
        assert_eq!(seen.max_tokens, Some(2500));
    }

    #[tokio::test]
    async fn test_synthesize_includes_history() {
        let llm = model("ok", Duration::ZERO);
        let synth = ResponseSynthesizer::new(SynthesisConfig::default(), llm.clone());
        let history = vec![ConversationTurn::new("감기", "휴식하세요")];

        synth.synthesize("열", &[candidate()], &[], &history).await.unwrap();

        let seen = llm.seen.lock().unwrap().clone().unwrap();
        assert!(seen.messages[1].content.contains("사용자 질문 1: 감기"));
    }

    #[tokio::test]
    async fn test_synthesize_timeout() {
        let llm = model("late", Duration::from_secs(5));
        let config = SynthesisConfig {
            timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let synth = ResponseSynthesizer::new(config, llm);

        let err = synth.synthesize("두통", &[candidate()], &[], &[]).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_empty_reply_is_provider_error() {
        let synth = ResponseSynthesizer::new(SynthesisConfig::default(), model("   ", Duration::ZERO));
        let err = synth.synthesize("두통", &[], &[], &[]).await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
    }

    #[tokio::test]
    async fn test_disabled_synthesizer() {
        let synth = ResponseSynthesizer::disabled();
        assert!(!synth.is_available());
        assert!(synth.synthesize("두통", &[], &[], &[]).await.is_err());
    }
}
