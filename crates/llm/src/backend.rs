//! LLM Backend implementations
//!
//! Both backends implement [`LanguageModel`] and share the same retry policy:
//! network errors, timeouts and 5xx responses are retried with exponential
//! backoff, 4xx responses fail immediately.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use medirag_config::constants::{endpoints, llm, timeouts};
use medirag_core::{
    FinishReason, GenerateRequest, GenerateResponse, LanguageModel, Message, Result, TokenUsage,
};

use crate::LlmError;

/// Initial retry backoff, doubled per attempt
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `max_retries` extra attempts are used up
async fn with_retry<T, F, Fut>(
    model: &str,
    max_retries: u32,
    initial_backoff: Duration,
    mut op: F,
) -> std::result::Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, LlmError>>,
{
    let mut last_error = None;
    let mut backoff = initial_backoff;

    for attempt in 0..=max_retries {
        if attempt > 0 {
            tracing::warn!(
                model,
                attempt,
                max_retries,
                backoff_ms = backoff.as_millis() as u64,
                "LLM request failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_retryable(&e) => last_error = Some(e),
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or_else(|| LlmError::Network("Max retries exceeded".to_string())))
}

fn is_retryable(error: &LlmError) -> bool {
    matches!(error, LlmError::Network(_) | LlmError::Timeout(_))
}

fn send_error(err: reqwest::Error, timeout: Duration) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(timeout.as_millis() as u64)
    } else {
        LlmError::from(err)
    }
}

/// Map a non-success status: 5xx is retryable, 4xx is not
fn status_error(status: reqwest::StatusCode, body: String) -> LlmError {
    if status.is_server_error() {
        LlmError::Network(format!("Server error {}: {}", status, body))
    } else {
        LlmError::Api(format!("HTTP {}: {}", status, body))
    }
}

// =============================================================================
// OpenAI-compatible backend
// =============================================================================

/// Configuration for OpenAI-compatible backends
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    /// API endpoint (OpenAI: https://api.openai.com/v1)
    pub endpoint: String,
    /// API key
    pub api_key: String,
    pub model: String,
    /// Used when the request does not set one
    pub max_tokens: u32,
    /// Used when the request does not set one
    pub temperature: f32,
    /// Request timeout
    pub timeout: Duration,
    /// Maximum retry attempts for transient failures
    pub max_retries: u32,
    /// Initial backoff duration (doubles each retry)
    pub initial_backoff: Duration,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            endpoint: endpoints::OPENAI_DEFAULT.to_string(),
            api_key: String::new(),
            model: llm::MODEL.to_string(),
            max_tokens: llm::MAX_TOKENS,
            temperature: llm::TEMPERATURE,
            timeout: Duration::from_millis(timeouts::LLM_MS),
            max_retries: llm::MAX_RETRIES,
            initial_backoff: INITIAL_BACKOFF,
        }
    }
}

/// OpenAI chat completions backend
pub struct OpenAIBackend {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAIBackend {
    pub fn new(config: OpenAIConfig) -> std::result::Result<Self, LlmError> {
        if config.api_key.is_empty() && !config.endpoint.contains("localhost") {
            return Err(LlmError::Configuration(
                "API key is required for remote endpoints".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'))
    }

    fn build_headers(&self) -> reqwest::header::HeaderMap {
        use reqwest::header::HeaderValue;

        let mut headers = reqwest::header::HeaderMap::new();

        if !self.config.api_key.is_empty() {
            let auth_value = format!("Bearer {}", self.config.api_key);
            if let Ok(val) = HeaderValue::from_str(&auth_value) {
                headers.insert(reqwest::header::AUTHORIZATION, val);
            }
        }

        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        headers
    }

    async fn execute_request(
        &self,
        request: &OpenAIChatRequest,
    ) -> std::result::Result<OpenAIChatResponse, LlmError> {
        let response = self
            .client
            .post(self.chat_url())
            .headers(self.build_headers())
            .json(request)
            .send()
            .await
            .map_err(|e| send_error(e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LanguageModel for OpenAIBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let start = Instant::now();

        let body = OpenAIChatRequest {
            model: self.config.model.clone(),
            messages: request.messages.iter().map(ChatMessage::from).collect(),
            max_tokens: Some(request.max_tokens.unwrap_or(self.config.max_tokens)),
            temperature: Some(request.temperature.unwrap_or(self.config.temperature)),
            stream: false,
        };

        let body = &body;
        let response = with_retry(
            &self.config.model,
            self.config.max_retries,
            self.config.initial_backoff,
            move || self.execute_request(body),
        )
        .await?;

        let usage = response.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::InvalidResponse("No choices in response".to_string()))?;

        tracing::debug!(
            model = %self.config.model,
            elapsed_ms = start.elapsed().as_millis() as u64,
            completion_tokens = usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            "Generation complete"
        );

        Ok(GenerateResponse {
            text: choice.message.content,
            finish_reason: match choice.finish_reason.as_deref() {
                Some("length") => FinishReason::Length,
                _ => FinishReason::Stop,
            },
            usage,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

impl From<&Message> for ChatMessage {
    fn from(msg: &Message) -> Self {
        Self {
            role: msg.role.as_str().to_string(),
            content: msg.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

// =============================================================================
// Ollama backend
// =============================================================================

/// Ollama configuration
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    /// Keep model loaded in memory between calls ("5m", "-1", "0")
    pub keep_alive: String,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: endpoints::OLLAMA_DEFAULT.to_string(),
            model: "qwen2.5:7b".to_string(),
            max_tokens: llm::MAX_TOKENS,
            temperature: llm::TEMPERATURE,
            timeout: Duration::from_millis(timeouts::LLM_MS),
            max_retries: llm::MAX_RETRIES,
            initial_backoff: INITIAL_BACKOFF,
            keep_alive: "5m".to_string(),
        }
    }
}

/// Ollama `/api/chat` backend
pub struct OllamaBackend {
    client: Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> std::result::Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn execute_request(
        &self,
        request: &OllamaChatRequest,
    ) -> std::result::Result<OllamaChatResponse, LlmError> {
        let response = self
            .client
            .post(self.api_url("/chat"))
            .json(request)
            .send()
            .await
            .map_err(|e| send_error(e, self.config.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl LanguageModel for OllamaBackend {
    async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
        let body = OllamaChatRequest {
            model: self.config.model.clone(),
            messages: request.messages.iter().map(ChatMessage::from).collect(),
            stream: false,
            options: OllamaOptions {
                temperature: Some(request.temperature.unwrap_or(self.config.temperature)),
                num_predict: Some(request.max_tokens.unwrap_or(self.config.max_tokens) as i32),
            },
            keep_alive: Some(self.config.keep_alive.clone()),
        };

        let body = &body;
        let response = with_retry(
            &self.config.model,
            self.config.max_retries,
            self.config.initial_backoff,
            move || self.execute_request(body),
        )
        .await?;

        let usage = match (response.prompt_eval_count, response.eval_count) {
            (None, None) => None,
            (prompt, completion) => {
                let prompt = prompt.unwrap_or(0);
                let completion = completion.unwrap_or(0);
                Some(TokenUsage {
                    prompt_tokens: prompt,
                    completion_tokens: completion,
                    total_tokens: prompt + completion,
                })
            },
        };

        Ok(GenerateResponse {
            text: response.message.content,
            finish_reason: match response.done_reason.as_deref() {
                Some("length") => FinishReason::Length,
                _ if response.done => FinishReason::Stop,
                _ => FinishReason::Length,
            },
            usage,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive: Option<String>,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn openai_config(endpoint: String) -> OpenAIConfig {
        OpenAIConfig {
            endpoint,
            api_key: "sk-test".to_string(),
            initial_backoff: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn completion(text: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{
                "message": {"role": "assistant", "content": text},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        })
    }

    fn request() -> GenerateRequest {
        GenerateRequest::new("system").with_user_message("두통에 좋은 약?")
    }

    #[test]
    fn test_openai_requires_key_for_remote() {
        let result = OpenAIBackend::new(OpenAIConfig::default());
        assert!(matches!(result, Err(LlmError::Configuration(_))));

        let local = OpenAIBackend::new(OpenAIConfig {
            endpoint: "http://localhost:8000/v1".to_string(),
            ..Default::default()
        });
        assert!(local.is_ok());
    }

    #[tokio::test]
    async fn test_openai_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({
                "model": "gpt-4o-mini",
                "max_tokens": 2500
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("타이레놀을 권합니다")))
            .mount(&server)
            .await;

        let backend = OpenAIBackend::new(openai_config(server.uri())).unwrap();
        let response = backend.generate(request()).await.unwrap();

        assert_eq!(response.text, "타이레놀을 권합니다");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(15));
    }

    #[tokio::test]
    async fn test_openai_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
            .mount(&server)
            .await;

        let backend = OpenAIBackend::new(openai_config(server.uri())).unwrap();
        assert_eq!(backend.generate(request()).await.unwrap().text, "ok");
    }

    #[tokio::test]
    async fn test_openai_client_error_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .expect(1)
            .mount(&server)
            .await;

        let backend = OpenAIBackend::new(openai_config(server.uri())).unwrap();
        let err = backend.generate(request()).await.unwrap_err();
        assert!(matches!(err, medirag_core::Error::Provider { .. }));
    }

    #[tokio::test]
    async fn test_openai_exhausted_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let backend = OpenAIBackend::new(openai_config(server.uri())).unwrap();
        assert!(backend.generate(request()).await.is_err());
    }

    #[tokio::test]
    async fn test_ollama_generate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "휴식을 취하세요"},
                "done": true,
                "done_reason": "stop",
                "prompt_eval_count": 20,
                "eval_count": 7
            })))
            .mount(&server)
            .await;

        let backend = OllamaBackend::new(OllamaConfig {
            endpoint: server.uri(),
            ..Default::default()
        })
        .unwrap();

        let response = backend.generate(request()).await.unwrap();
        assert_eq!(response.text, "휴식을 취하세요");
        assert_eq!(response.usage.map(|u| u.total_tokens), Some(27));
    }
}
