//! OpenAI-compatible provider implementation
//!
//! Implements [`LLMProvider`] against the `/chat/completions` endpoint.
//! Works with OpenAI itself and with compatible local servers
//! (LM Studio, vLLM, llama.cpp).
//!
//! ```no_run
//! use tickerflow_llm::{CompletionRequest, LLMProvider};
//! use tickerflow_llm::providers::{OpenAIConfig, OpenAIProvider};
//!
//! # async fn example() -> tickerflow_llm::Result<()> {
//! let config = OpenAIConfig::new("not-needed").with_api_base("http://localhost:1234/v1");
//! let provider = OpenAIProvider::with_config(config)?;
//!
//! let request = CompletionRequest::builder("local-model")
//!     .user("Summarize AAPL")
//!     .max_tokens(256)
//!     .build();
//!
//! let response = provider.complete(request).await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

use crate::{
    CompletionRequest, CompletionResponse, LLMError, LLMProvider, Message, Result, Role,
    StopReason, TokenUsage,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const LOCAL_API_KEY: &str = "not-needed";

/// Configuration for OpenAI provider
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    /// API key for authentication
    pub api_key: String,

    /// Base URL for the API (default: "https://api.openai.com/v1")
    pub api_base: String,

    /// Request timeout in seconds (default: 120)
    pub timeout_secs: u64,
}

impl OpenAIConfig {
    /// Create a new config with the given API key and default settings
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Create config from environment variables
    ///
    /// Reads `OPENAI_API_BASE` and `OPENAI_API_KEY`. The key is only required
    /// for the hosted API; local servers get a placeholder.
    pub fn from_env() -> Result<Self> {
        let api_base = std::env::var("OPENAI_API_BASE").ok();
        let api_key = match (std::env::var("OPENAI_API_KEY"), &api_base) {
            (Ok(key), _) => key,
            (Err(_), Some(_)) => LOCAL_API_KEY.to_string(),
            (Err(_), None) => {
                return Err(LLMError::ConfigurationError(
                    "OPENAI_API_KEY environment variable not set".to_string(),
                ));
            }
        };

        Ok(Self {
            api_key,
            api_base: api_base.unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string()),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        })
    }

    /// Set custom API base URL
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Set request timeout in seconds
    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self::new(String::new())
    }
}

/// OpenAI-compatible provider
pub struct OpenAIProvider {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAIProvider {
    /// Create a new provider with custom configuration
    pub fn with_config(config: OpenAIConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    /// Create a provider from environment variables
    pub fn from_env() -> Result<Self> {
        Self::with_config(OpenAIConfig::from_env()?)
    }

    /// Get the current configuration
    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    #[instrument(skip(self, request), fields(model = %request.model, api_base = %self.config.api_base))]
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let openai_request = OpenAIRequest {
            model: request.model.clone(),
            messages: build_openai_messages(request.system, &request.messages),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(self.config.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&openai_request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(status_error(status, body, request.model));
        }

        let openai_response: OpenAIResponse = response
            .json()
            .await
            .map_err(|e| LLMError::UnexpectedResponse(format!("Failed to parse response: {e}")))?;

        let choice = openai_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LLMError::UnexpectedResponse("No choices in response".to_string()))?;

        let usage = openai_response.usage.unwrap_or_default();
        debug!(
            finish_reason = choice.finish_reason.as_deref().unwrap_or("none"),
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            "Completion received"
        );

        let text = choice
            .message
            .content
            .ok_or_else(|| LLMError::UnexpectedResponse("Empty message content".to_string()))?;

        Ok(CompletionResponse {
            message: Message::assistant(text),
            stop_reason: map_stop_reason(choice.finish_reason.as_deref()),
            usage: TokenUsage::new(usage.prompt_tokens, usage.completion_tokens),
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: usize,
    completion_tokens: usize,
}

// ============================================================================
// Conversion functions
// ============================================================================

/// System prompt goes first in the messages array
fn build_openai_messages(system: Option<String>, messages: &[Message]) -> Vec<OpenAIMessage> {
    let mut result = Vec::with_capacity(messages.len() + 1);

    if let Some(sys) = system {
        result.push(OpenAIMessage {
            role: Role::System.as_str(),
            content: sys,
        });
    }

    result.extend(messages.iter().map(|msg| OpenAIMessage {
        role: msg.role.as_str(),
        content: msg.content.clone(),
    }));

    result
}

fn status_error(status: StatusCode, body: String, model: String) -> LLMError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LLMError::AuthenticationFailed,
        StatusCode::TOO_MANY_REQUESTS => LLMError::RateLimitExceeded(body),
        StatusCode::BAD_REQUEST => LLMError::InvalidRequest(body),
        StatusCode::NOT_FOUND => LLMError::ModelNotFound(model),
        _ => LLMError::RequestFailed(format!("HTTP {status}: {body}")),
    }
}

fn map_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("length") => StopReason::MaxTokens,
        Some("content_filter") => StopReason::ContentFilter,
        _ => StopReason::EndTurn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_first() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let converted = build_openai_messages(Some("be brief".to_string()), &messages);

        assert_eq!(converted.len(), 3);
        assert_eq!(converted[0].role, "system");
        assert_eq!(converted[0].content, "be brief");
        assert_eq!(converted[2].role, "assistant");
    }

    #[test]
    fn test_map_stop_reason() {
        assert_eq!(map_stop_reason(Some("stop")), StopReason::EndTurn);
        assert_eq!(map_stop_reason(Some("length")), StopReason::MaxTokens);
        assert_eq!(map_stop_reason(None), StopReason::EndTurn);
        assert_eq!(map_stop_reason(Some("content_filter")), StopReason::ContentFilter);
        assert_eq!(map_stop_reason(Some("tool_calls")), StopReason::EndTurn);
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, String::new(), "m".into()),
            LLMError::AuthenticationFailed
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND, String::new(), "gpt-x".into()),
            LLMError::ModelNotFound(model) if model == "gpt-x"
        ));
        let err = status_error(StatusCode::BAD_GATEWAY, "upstream".into(), "m".into());
        assert_eq!(err.to_string(), "API request failed: HTTP 502 Bad Gateway: upstream");
        assert!(!err.is_malformed_response());
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let config = OpenAIConfig::new("k").with_api_base("http://localhost:1234/v1/");
        assert_eq!(config.endpoint(), "http://localhost:1234/v1/chat/completions");
    }

    #[test]
    fn test_response_parsing() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "ok"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        }"#;
        let parsed: OpenAIResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.choices.len(), 1);
        assert_eq!(parsed.usage.unwrap().prompt_tokens, 12);
    }
}
