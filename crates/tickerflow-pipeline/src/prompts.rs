//! Prompt templates for the generation-backed stages
//!
//! Templates use MiniJinja syntax and are compiled once into a shared
//! environment. Rendering variables are plain strings: payloads are passed
//! pre-serialised so the templates stay free of formatting logic.

use crate::error::Result;
use minijinja::{Environment, context};
use std::sync::Arc;

const DERIVE_SYSTEM: &str = r#"You are a quantitative market data executor.

Compute classic floor-trader pivot levels from the previous completed session:
use previous_high, previous_low and previous_close when all three are present,
otherwise the latest bar's high, low and price.
- PP = (high + low + close) / 3
- R1 = 2 * PP - low, S1 = 2 * PP - high
- R2 = PP + (high - low), S2 = PP - (high - low)
- R3 = high + 2 * (PP - low), S3 = low - 2 * (high - PP)

Round every value to 2 decimal places.
Reply with a single JSON object and nothing else:
{"pivot": {"PP": 0.0, "R1": 0.0, "R2": 0.0, "R3": 0.0, "S1": 0.0, "S2": 0.0, "S3": 0.0}}"#;

const DERIVE_USER: &str = r"Ticker: {{ subject }}
Market data (JSON):
{{ market_json }}";

const ANALYZE_SYSTEM: &str = r#"You are a senior equity analyst writing concise takeaways for a single ticker.

Produce exactly five takeaways with these keys:
price_action, momentum, support_resistance, risk, outlook.

Each takeaway is an object {"text": "...", "sentiment": "bullish" | "bearish" | "neutral"}.
Keep each text to one or two sentences and cite concrete levels where useful.
Reply with a single JSON object and nothing else."#;

const ANALYZE_USER: &str = r"Ticker: {{ subject }}

Market data:
{{ market_summary }}

Derived levels:
{{ derived_summary }}";

const CHAT_SYSTEM: &str = r"You are a helpful market analysis assistant.
Answer clearly and acknowledge uncertainty; never present analysis as financial advice.
{% if digest %}
Current analysis context{% if subject %} for {{ subject }}{% endif %}:
{{ digest }}
{% else %}
No completed analysis is available, answer as a general-purpose assistant.
{% endif %}";

/// Template names
pub mod names {
    pub const DERIVE_SYSTEM: &str = "derive.system";
    pub const DERIVE_USER: &str = "derive.user";
    pub const ANALYZE_SYSTEM: &str = "analyze.system";
    pub const ANALYZE_USER: &str = "analyze.user";
    pub const CHAT_SYSTEM: &str = "chat.system";
}

/// Compiled prompt templates
#[derive(Debug, Clone)]
pub struct PromptSet {
    env: Arc<Environment<'static>>,
}

impl PromptSet {
    /// Compile the built-in templates
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template(names::DERIVE_SYSTEM, DERIVE_SYSTEM)?;
        env.add_template(names::DERIVE_USER, DERIVE_USER)?;
        env.add_template(names::ANALYZE_SYSTEM, ANALYZE_SYSTEM)?;
        env.add_template(names::ANALYZE_USER, ANALYZE_USER)?;
        env.add_template(names::CHAT_SYSTEM, CHAT_SYSTEM)?;
        Ok(Self { env: Arc::new(env) })
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> std::result::Result<String, minijinja::Error> {
        self.env.get_template(name)?.render(ctx)
    }

    /// System prompt for the Derive stage
    pub fn derive_system(&self) -> std::result::Result<String, minijinja::Error> {
        self.render(names::DERIVE_SYSTEM, context! {})
    }

    /// User message for the Derive stage
    pub fn derive_user(
        &self,
        subject: &str,
        market_json: &str,
    ) -> std::result::Result<String, minijinja::Error> {
        self.render(names::DERIVE_USER, context! { subject, market_json })
    }

    /// System prompt for the Analyze stage
    pub fn analyze_system(&self) -> std::result::Result<String, minijinja::Error> {
        self.render(names::ANALYZE_SYSTEM, context! {})
    }

    /// User message for the Analyze stage
    pub fn analyze_user(
        &self,
        subject: &str,
        market_summary: &str,
        derived_summary: &str,
    ) -> std::result::Result<String, minijinja::Error> {
        self.render(
            names::ANALYZE_USER,
            context! { subject, market_summary, derived_summary },
        )
    }

    /// System prompt for a chat turn, with or without a digest
    pub fn chat_system(
        &self,
        subject: Option<&str>,
        digest: Option<&str>,
    ) -> std::result::Result<String, minijinja::Error> {
        self.render(names::CHAT_SYSTEM, context! { subject, digest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_compile() {
        assert!(PromptSet::new().is_ok());
    }

    #[test]
    fn test_derive_user_renders_subject() {
        let prompts = PromptSet::new().unwrap();
        let rendered = prompts.derive_user("AAPL", r#"{"price":150.0}"#).unwrap();
        assert!(rendered.starts_with("Ticker: AAPL"));
        assert!(rendered.contains(r#"{"price":150.0}"#));
    }

    #[test]
    fn test_chat_system_with_digest() {
        let prompts = PromptSet::new().unwrap();
        let rendered = prompts
            .chat_system(Some("AAPL"), Some("AAPL last 150.00"))
            .unwrap();
        assert!(rendered.contains("context for AAPL"));
        assert!(rendered.contains("AAPL last 150.00"));
        assert!(!rendered.contains("general-purpose"));
    }

    #[test]
    fn test_chat_system_without_digest() {
        let prompts = PromptSet::new().unwrap();
        let rendered = prompts.chat_system(None, None).unwrap();
        assert!(rendered.contains("general-purpose assistant"));
    }

    #[test]
    fn test_analyze_system_lists_keys() {
        let prompts = PromptSet::new().unwrap();
        let rendered = prompts.analyze_system().unwrap();
        for key in ["price_action", "momentum", "support_resistance", "risk", "outlook"] {
            assert!(rendered.contains(key));
        }
    }
}
