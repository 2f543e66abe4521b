//! Error types for pipeline operations

use serde::Serialize;
use thiserror::Error;
use tickerflow_llm::LLMError;
use tickerflow_utils::EnvError;

/// Input rejected before any stage runs
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Blank ticker
    #[error("Subject must not be empty")]
    EmptySubject,

    /// Ticker with characters or length outside the accepted shape
    #[error("Invalid subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: String },

    /// Blank chat prompt
    #[error("Prompt must not be empty")]
    EmptyPrompt,
}

/// Failure of a single stage call
///
/// Carried inside a [`StageOutcome`](crate::StageOutcome); never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum StageError {
    /// Network or backend failure inside the stage
    #[error("Remote call failed: {0}")]
    Remote(String),

    /// The call succeeded but returned a structurally invalid payload
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
}

impl StageError {
    /// Build a malformed-response error
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    /// Build a remote-call error
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    /// Underlying message without the category prefix
    pub fn message(&self) -> &str {
        match self {
            Self::Remote(msg) | Self::MalformedResponse(msg) => msg,
        }
    }
}

impl From<LLMError> for StageError {
    fn from(err: LLMError) -> Self {
        if err.is_malformed_response() {
            Self::MalformedResponse(err.to_string())
        } else {
            Self::Remote(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedResponse(err.to_string())
    }
}

/// Errors surfaced by the session-facing surface
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected input
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unparseable environment override
    #[error(transparent)]
    Env(#[from] EnvError),

    /// A chat turn is already waiting for its reply
    #[error("A chat reply is still pending")]
    ChatBusy,

    /// Prompt template failed to compile or render
    #[error("Prompt template error: {0}")]
    Prompt(#[from] minijinja::Error),

    /// The orchestrator task has stopped
    #[error("Pipeline orchestrator has shut down")]
    Shutdown,
}

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ValidationError::InvalidSubject {
            subject: "A$B".to_string(),
            reason: "unsupported character '$'".to_string(),
        };
        assert_eq!(err.to_string(), "Invalid subject 'A$B': unsupported character '$'");

        let err = StageError::malformed("missing PP");
        assert_eq!(err.to_string(), "Malformed response: missing PP");
        assert_eq!(err.message(), "missing PP");
    }

    #[test]
    fn test_llm_error_conversion() {
        let err: StageError = LLMError::UnexpectedResponse("no choices".into()).into();
        assert!(matches!(err, StageError::MalformedResponse(_)));

        let err: StageError = LLMError::RateLimitExceeded("429".into()).into();
        match err {
            StageError::Remote(msg) => assert!(msg.contains("Rate limit")),
            StageError::MalformedResponse(_) => panic!("Expected Remote variant"),
        }
    }

    #[test]
    fn test_validation_into_pipeline_error() {
        let err: PipelineError = ValidationError::EmptyPrompt.into();
        assert!(matches!(err, PipelineError::Validation(ValidationError::EmptyPrompt)));
        assert_eq!(err.to_string(), "Prompt must not be empty");
    }

    #[test]
    fn test_stage_error_serialization() {
        let json = serde_json::to_value(StageError::remote("timeout")).unwrap();
        assert_eq!(json["kind"], "remote");
        assert_eq!(json["message"], "timeout");
    }
}
