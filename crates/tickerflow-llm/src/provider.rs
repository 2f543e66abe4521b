//! LLM provider trait definition

use crate::{CompletionRequest, CompletionResponse, Result};
use async_trait::async_trait;

/// Trait for LLM providers
///
/// Implementations of this trait provide access to different generation
/// services. Stage adapters hold them as `Arc<dyn LLMProvider>`.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Generate a completion from the LLM
    ///
    /// # Arguments
    ///
    /// * `request` - The completion request with messages and parameters
    ///
    /// # Returns
    ///
    /// The completion response with the assistant's message and token usage
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;

    /// Get the provider name (e.g., "openai")
    fn name(&self) -> &str;
}
