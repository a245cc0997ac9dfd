//! Language model trait

use async_trait::async_trait;

use crate::{GenerateRequest, GenerateResponse, Result};

/// Generative model used to narrate recommendations
///
/// # Example
///
/// ```ignore
/// let llm: Arc<dyn LanguageModel> = Arc::new(OpenAIBackend::new(config)?);
/// let request = GenerateRequest::new(SYSTEM_PROMPT).with_user_message(prompt);
/// let response = llm.generate(request).await?;
/// println!("{}", response.text);
/// ```
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Generate a completion
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse>;

    /// Get model name for logging
    fn model_name(&self) -> &str;
}
