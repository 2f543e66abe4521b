//! AI-generation boundary for tickerflow
//!
//! This crate provides provider-agnostic abstractions for the remote
//! generation calls the pipeline stages make. It includes:
//!
//! - Message types for conversation history
//! - Completion request/response types with token usage
//! - Provider trait for LLM implementations
//! - An OpenAI-compatible provider (behind the `openai` feature)

pub mod completion;
pub mod error;
pub mod messages;
pub mod provider;

// Re-export main types
pub use completion::{CompletionRequest, CompletionResponse, StopReason, TokenUsage};
pub use error::{LLMError, Result};
pub use messages::{Message, Role};
pub use provider::LLMProvider;

// Provider implementations (feature-gated)
#[cfg(feature = "openai")]
pub mod providers;
