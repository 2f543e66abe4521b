//! Generation-backed stage adapters
//!
//! Derive, Analyze and Chat share one [`LlmBackend`]: a provider, the model
//! settings, the pricing table and the compiled prompts. Structured stages
//! ask for a single JSON object and parse the first one found in the reply.

use super::{
    ChatResponder, DerivedIndicators, IndicatorDeriver, NarrativeAnalyzer, NarrativeTakeaways,
    RawMarketData, StageKind, StagePayload, StageResult, StageSuccess,
};
use crate::chat::{ChatRequest, ChatTurn, Transcript};
use crate::config::PipelineConfig;
use crate::error::{Result, StageError};
use crate::prompts::PromptSet;
use crate::subject::Subject;
use crate::usage::{PricingTable, UsageReport};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tickerflow_llm::{CompletionRequest, LLMProvider, Message};
use tracing::{debug, instrument, warn};

/// Shared generation client for the LLM-backed stages
pub struct LlmBackend {
    provider: Arc<dyn LLMProvider>,
    model: String,
    max_tokens: usize,
    temperature: f32,
    pricing: PricingTable,
    prompts: PromptSet,
}

impl LlmBackend {
    /// Create a backend from a provider and the pipeline configuration
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            provider,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            pricing: config.pricing.clone(),
            prompts: PromptSet::new()?,
        }))
    }

    pub fn prompts(&self) -> &PromptSet {
        &self.prompts
    }

    /// Run one completion and price its usage
    #[instrument(skip(self, system, messages), fields(provider = self.provider.name(), model = %self.model))]
    async fn complete(
        &self,
        stage: StageKind,
        system: String,
        messages: Vec<Message>,
    ) -> std::result::Result<(String, UsageReport), StageError> {
        let request = CompletionRequest::builder(&self.model)
            .system(system)
            .messages(messages)
            .max_tokens(self.max_tokens)
            .temperature(self.temperature)
            .build();

        let response = self.provider.complete(request).await?;
        if response.is_truncated() {
            warn!(%stage, max_tokens = self.max_tokens, "Completion hit the token budget");
        }
        let usage = self.pricing.price(
            stage,
            response.usage.input_tokens as u64,
            response.usage.output_tokens as u64,
        );
        debug!(
            %stage,
            input = usage.input_units(),
            output = usage.output_units(),
            cost = usage.cost(),
            "Completion finished"
        );
        Ok((response.text().to_string(), usage))
    }

    /// Complete and parse a structured payload
    ///
    /// A reply that does not parse is a malformed response; its usage is
    /// dropped with the payload.
    async fn complete_structured<T, F>(
        &self,
        system: String,
        user: String,
        parse: F,
    ) -> StageResult<T>
    where
        T: StagePayload,
        F: FnOnce(&Value) -> std::result::Result<T, StageError>,
    {
        let (text, usage) = self
            .complete(T::KIND, system, vec![Message::user(user)])
            .await?;

        let payload = extract_json(&text).and_then(|value| parse(&value)).and_then(|payload| {
            payload.validate()?;
            Ok(payload)
        });

        match payload {
            Ok(payload) => Ok(StageSuccess::new(payload).with_usage(usage)),
            Err(err) => {
                debug!(stage = %T::KIND, error = %err, cost = usage.cost(), "Discarding usage of malformed reply");
                Err(err)
            }
        }
    }
}

fn prompt_error(err: minijinja::Error) -> StageError {
    StageError::remote(format!("prompt rendering failed: {err}"))
}

/// Locate and parse the first JSON object in a model reply
///
/// Tolerates Markdown code fences and prose around the object.
pub fn extract_json(text: &str) -> std::result::Result<Value, StageError> {
    let start = text
        .find('{')
        .ok_or_else(|| StageError::malformed("reply contains no JSON object"))?;
    let end = text
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| StageError::malformed("reply contains an unterminated JSON object"))?;

    let candidate = &text[start..=end];
    match serde_json::from_str(candidate) {
        Ok(value) => Ok(value),
        // Trailing prose may contain braces; fall back to the first complete object.
        Err(_) => serde_json::Deserializer::from_str(&text[start..])
            .into_iter::<Value>()
            .next()
            .ok_or_else(|| StageError::malformed("reply contains no JSON object"))?
            .map_err(StageError::from),
    }
}

/// Derive stage backed by a generation model
pub struct LlmIndicatorDeriver {
    backend: Arc<LlmBackend>,
}

impl LlmIndicatorDeriver {
    pub fn new(backend: Arc<LlmBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl IndicatorDeriver for LlmIndicatorDeriver {
    async fn derive(&self, data: &RawMarketData, subject: &Subject) -> StageResult<DerivedIndicators> {
        let prompts = self.backend.prompts();
        let market_json = serde_json::to_string(data)?;
        let system = prompts.derive_system().map_err(prompt_error)?;
        let user = prompts
            .derive_user(subject.as_str(), &market_json)
            .map_err(prompt_error)?;

        self.backend
            .complete_structured(system, user, DerivedIndicators::from_json)
            .await
    }
}

/// Analyze stage backed by a generation model
pub struct LlmNarrativeAnalyzer {
    backend: Arc<LlmBackend>,
}

impl LlmNarrativeAnalyzer {
    pub fn new(backend: Arc<LlmBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl NarrativeAnalyzer for LlmNarrativeAnalyzer {
    async fn analyze(
        &self,
        data: &RawMarketData,
        derived: &DerivedIndicators,
        subject: &Subject,
    ) -> StageResult<NarrativeTakeaways> {
        let prompts = self.backend.prompts();
        let system = prompts.analyze_system().map_err(prompt_error)?;
        let user = prompts
            .analyze_user(subject.as_str(), &data.summary(), &derived.summary())
            .map_err(prompt_error)?;

        self.backend
            .complete_structured(system, user, NarrativeTakeaways::from_json)
            .await
    }
}

/// Chat stage backed by a generation model
pub struct LlmChatResponder {
    backend: Arc<LlmBackend>,
}

impl LlmChatResponder {
    pub fn new(backend: Arc<LlmBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ChatResponder for LlmChatResponder {
    async fn respond(&self, request: &ChatRequest, transcript: &[ChatTurn]) -> StageResult<String> {
        let system = self
            .backend
            .prompts()
            .chat_system(
                request.subject.as_ref().map(Subject::as_str),
                request.digest.as_deref(),
            )
            .map_err(prompt_error)?;

        let mut messages = Transcript::history(transcript);
        messages.push(Message::user(request.prompt.clone()));

        let (text, usage) = self.backend.complete(StageKind::Chat, system, messages).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(StageError::malformed("empty chat reply"));
        }
        Ok(StageSuccess::new(text.to_string()).with_usage(usage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatOrigin;
    use crate::test_support::{sample_market_data, sample_takeaways};
    use std::sync::Mutex;
    use tickerflow_llm::{CompletionResponse, LLMError, StopReason, TokenUsage};
    use tokio_test::{assert_err, assert_ok};

    /// Provider replying with a fixed text and recording requests
    struct ScriptedProvider {
        reply: std::result::Result<String, LLMError>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedProvider {
        fn replying(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Ok(text.to_string()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing(err: LLMError) -> Arc<Self> {
            Arc::new(Self {
                reply: Err(err),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn complete(&self, request: CompletionRequest) -> tickerflow_llm::Result<CompletionResponse> {
            self.requests.lock().unwrap().push(request);
            match &self.reply {
                Ok(text) => Ok(CompletionResponse {
                    message: Message::assistant(text.clone()),
                    stop_reason: StopReason::EndTurn,
                    usage: TokenUsage {
                        input_tokens: 80,
                        output_tokens: 40,
                    },
                }),
                Err(LLMError::RateLimitExceeded(msg)) => Err(LLMError::RateLimitExceeded(msg.clone())),
                Err(other) => Err(LLMError::RequestFailed(other.to_string())),
            }
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn backend(provider: Arc<ScriptedProvider>) -> Arc<LlmBackend> {
        LlmBackend::new(provider, &PipelineConfig::default()).unwrap()
    }

    fn aapl() -> Subject {
        Subject::parse("AAPL").unwrap()
    }

    #[test]
    fn test_extract_json_from_fenced_reply() {
        let text = "Here you go:\n```json\n{\"pivot\": {\"PP\": 1}}\n```";
        let value = extract_json(text).unwrap();
        assert_eq!(value["pivot"]["PP"], 1);
    }

    #[test]
    fn test_extract_json_with_trailing_braces() {
        let text = "{\"a\": 1} and then {oops}";
        let value = extract_json(text).unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_extract_json_without_object() {
        let err = extract_json("I cannot help with that").unwrap_err();
        assert!(matches!(err, StageError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_deriver_parses_levels_and_prices_usage() {
        let provider = ScriptedProvider::replying(
            r#"{"pivot": {"PP": 151, "R1": 154, "R2": 155, "R3": 158, "S1": 150, "S2": 147, "S3": 146}}"#,
        );
        let deriver = LlmIndicatorDeriver::new(backend(Arc::clone(&provider)));

        let success = assert_ok!(deriver.derive(&sample_market_data("AAPL"), &aapl()).await);
        assert_eq!(success.payload.pivot.pp, 151.0);
        let usage = success.usage.unwrap();
        assert_eq!(usage.stage(), StageKind::Derive);
        assert_eq!(usage.input_units(), 80);
        assert!(usage.cost() > 0.0);

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].messages[0].text().contains("Ticker: AAPL"));
    }

    #[tokio::test]
    async fn test_deriver_missing_pp_is_malformed() {
        let provider = ScriptedProvider::replying(
            r#"{"pivot": {"R1": 154, "R2": 155, "R3": 158, "S1": 150, "S2": 147, "S3": 146}}"#,
        );
        let deriver = LlmIndicatorDeriver::new(backend(provider));

        let err = assert_err!(deriver.derive(&sample_market_data("AAPL"), &aapl()).await);
        assert_eq!(err, StageError::malformed("missing pivot level PP"));
    }

    #[tokio::test]
    async fn test_analyzer_parses_takeaways() {
        let reply = serde_json::to_string(&sample_takeaways()).unwrap();
        let analyzer = LlmNarrativeAnalyzer::new(backend(ScriptedProvider::replying(&reply)));
        let derived = DerivedIndicators {
            pivot: crate::stages::PivotLevels::classic(152.0, 148.0, 150.0),
        };

        let success = assert_ok!(
            analyzer
                .analyze(&sample_market_data("AAPL"), &derived, &aapl())
                .await
        );
        assert_eq!(success.payload, sample_takeaways());
        assert_eq!(success.usage.unwrap().stage(), StageKind::Analyze);
    }

    #[tokio::test]
    async fn test_remote_failure_maps_to_remote() {
        let analyzer = LlmNarrativeAnalyzer::new(backend(ScriptedProvider::failing(
            LLMError::RateLimitExceeded("slow down".into()),
        )));
        let derived = DerivedIndicators {
            pivot: crate::stages::PivotLevels::classic(152.0, 148.0, 150.0),
        };

        let err = assert_err!(
            analyzer
                .analyze(&sample_market_data("AAPL"), &derived, &aapl())
                .await
        );
        assert!(matches!(err, StageError::Remote(_)));
    }

    #[tokio::test]
    async fn test_chat_passes_history_and_digest() {
        let provider = ScriptedProvider::replying("  Pivot sits at 151.  ");
        let responder = LlmChatResponder::new(backend(Arc::clone(&provider)));
        let transcript = vec![
            ChatTurn::user("earlier question"),
            ChatTurn::error("Remote call failed: timeout"),
        ];
        let request = ChatRequest::new("Where is the pivot?", ChatOrigin::User)
            .with_digest(Some("AAPL last 150.00".to_string()))
            .with_subject(Some(aapl()));

        let success = assert_ok!(responder.respond(&request, &transcript).await);
        assert_eq!(success.payload, "Pivot sits at 151.");
        assert_eq!(success.usage.unwrap().stage(), StageKind::Chat);

        let requests = provider.requests.lock().unwrap();
        let sent = &requests[0];
        assert_eq!(sent.messages.len(), 2);
        assert_eq!(sent.messages[1].text(), "Where is the pivot?");
        assert!(sent.system.as_deref().unwrap().contains("AAPL last 150.00"));
    }
}
