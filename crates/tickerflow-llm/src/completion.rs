//! Completion request and response types
//!
//! Every pipeline call is a single, non-streaming completion: an optional
//! system prompt, the conversation so far, and sampling settings.

use crate::{Message, Role};
use serde::{Deserialize, Serialize};

/// Output budget used when the caller sets none
pub const DEFAULT_MAX_TOKENS: usize = 1024;

/// One generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Provider-specific model identifier
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Conversation, oldest first
    pub messages: Vec<Message>,

    pub max_tokens: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl CompletionRequest {
    pub fn builder(model: impl Into<String>) -> CompletionRequestBuilder {
        CompletionRequestBuilder {
            request: Self {
                model: model.into(),
                system: None,
                messages: Vec::new(),
                max_tokens: DEFAULT_MAX_TOKENS,
                temperature: None,
            },
        }
    }

    /// Text of the most recent user message
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == Role::User)
            .map(Message::text)
    }
}

/// Fluent builder for [`CompletionRequest`]
#[derive(Debug, Clone)]
pub struct CompletionRequestBuilder {
    request: CompletionRequest,
}

impl CompletionRequestBuilder {
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.request.system = Some(system.into());
        self
    }

    /// Append prior conversation turns
    pub fn messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.request.messages.extend(messages);
        self
    }

    /// Append one user message
    pub fn user(mut self, text: impl Into<String>) -> Self {
        self.request.messages.push(Message::user(text));
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.request.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.request.temperature = Some(temperature);
        self
    }

    pub fn build(self) -> CompletionRequest {
        self.request
    }
}

/// Reply to a [`CompletionRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub message: Message,
    pub stop_reason: StopReason,
    pub usage: TokenUsage,
}

impl CompletionResponse {
    /// Text of the assistant message
    pub fn text(&self) -> &str {
        self.message.text()
    }

    /// Whether generation stopped on the token budget
    ///
    /// A truncated reply to a structured prompt usually holds cut-off JSON.
    pub fn is_truncated(&self) -> bool {
        self.stop_reason == StopReason::MaxTokens
    }
}

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of the reply or a stop sequence
    EndTurn,
    MaxTokens,
    /// Output withheld by the provider
    ContentFilter,
}

/// Token counts reported for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }
}
