//! Configuration for the analysis pipeline

use crate::error::{PipelineError, Result};
use crate::usage::PricingTable;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tickerflow_utils::{env_flag, env_parsed};

/// Environment variable overriding [`PipelineConfig::model`]
pub const MODEL_VAR: &str = "TICKERFLOW_MODEL";
/// Environment variable overriding [`PipelineConfig::max_tokens`]
pub const MAX_TOKENS_VAR: &str = "TICKERFLOW_MAX_TOKENS";
/// Environment variable overriding [`PipelineConfig::temperature`]
pub const TEMPERATURE_VAR: &str = "TICKERFLOW_TEMPERATURE";
/// Environment variable overriding [`PipelineConfig::cancel_superseded`]
pub const CANCEL_SUPERSEDED_VAR: &str = "TICKERFLOW_CANCEL_SUPERSEDED";

/// Configuration for the orchestrator and the generation-backed stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Model identifier passed to the generation backend
    pub model: String,

    /// Completion budget per stage call
    pub max_tokens: usize,

    /// Sampling temperature (0.0 - 2.0)
    pub temperature: f32,

    /// Per-stage unit pricing
    pub pricing: PricingTable,

    /// Abort in-flight stage calls of a superseded generation
    pub cancel_superseded: bool,

    /// Capacity of the orchestrator command channel
    pub command_buffer: usize,

    /// Maximum retained chat turns (`None` keeps everything)
    pub transcript_limit: Option<usize>,

    /// How long fetched market data is reused
    pub market_cache_ttl: Duration,

    /// Market data request quota
    pub market_requests_per_minute: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            max_tokens: 1024,
            temperature: 0.2,
            pricing: PricingTable::default(),
            cancel_superseded: true,
            command_buffer: 32,
            transcript_limit: None,
            market_cache_ttl: Duration::from_secs(60),
            market_requests_per_minute: 60,
        }
    }
}

impl PipelineConfig {
    /// Create a new configuration builder
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Defaults overlaid with `TICKERFLOW_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::builder().with_env()?.build()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(PipelineError::Config("model must not be empty".to_string()));
        }

        if self.max_tokens == 0 {
            return Err(PipelineError::Config(
                "max_tokens must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(PipelineError::Config(format!(
                "temperature must be between 0.0 and 2.0, got {}",
                self.temperature
            )));
        }

        self.pricing.validate().map_err(PipelineError::Config)?;

        if self.command_buffer == 0 {
            return Err(PipelineError::Config(
                "command_buffer must be greater than 0".to_string(),
            ));
        }

        if self.transcript_limit == Some(0) {
            return Err(PipelineError::Config(
                "transcript_limit must be greater than 0 when set".to_string(),
            ));
        }

        if self.market_requests_per_minute == 0 {
            return Err(PipelineError::Config(
                "market_requests_per_minute must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for PipelineConfig
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    model: Option<String>,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    pricing: Option<PricingTable>,
    cancel_superseded: Option<bool>,
    command_buffer: Option<usize>,
    transcript_limit: Option<usize>,
    market_cache_ttl: Option<Duration>,
    market_requests_per_minute: Option<u32>,
}

impl PipelineConfigBuilder {
    /// Set the model identifier
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the completion budget
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Replace the pricing table
    pub fn pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = Some(pricing);
        self
    }

    /// Enable or disable cancellation of superseded generations
    pub fn cancel_superseded(mut self, cancel: bool) -> Self {
        self.cancel_superseded = Some(cancel);
        self
    }

    /// Set the command channel capacity
    pub fn command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = Some(capacity);
        self
    }

    /// Cap the chat transcript
    pub fn transcript_limit(mut self, limit: usize) -> Self {
        self.transcript_limit = Some(limit);
        self
    }

    /// Set the market data cache TTL
    pub fn market_cache_ttl(mut self, ttl: Duration) -> Self {
        self.market_cache_ttl = Some(ttl);
        self
    }

    /// Set the market data request quota
    pub fn market_requests_per_minute(mut self, quota: u32) -> Self {
        self.market_requests_per_minute = Some(quota);
        self
    }

    /// Overlay `TICKERFLOW_*` environment variables
    pub fn with_env(mut self) -> Result<Self> {
        if let Some(model) = env_parsed::<String>(MODEL_VAR)? {
            self.model = Some(model);
        }
        if let Some(max_tokens) = env_parsed(MAX_TOKENS_VAR)? {
            self.max_tokens = Some(max_tokens);
        }
        if let Some(temperature) = env_parsed(TEMPERATURE_VAR)? {
            self.temperature = Some(temperature);
        }
        if let Some(cancel) = env_flag(CANCEL_SUPERSEDED_VAR)? {
            self.cancel_superseded = Some(cancel);
        }
        Ok(self)
    }

    /// Build the configuration
    pub fn build(self) -> Result<PipelineConfig> {
        let defaults = PipelineConfig::default();

        let config = PipelineConfig {
            model: self.model.unwrap_or(defaults.model),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            pricing: self.pricing.unwrap_or(defaults.pricing),
            cancel_superseded: self.cancel_superseded.unwrap_or(defaults.cancel_superseded),
            command_buffer: self.command_buffer.unwrap_or(defaults.command_buffer),
            transcript_limit: self.transcript_limit.or(defaults.transcript_limit),
            market_cache_ttl: self.market_cache_ttl.unwrap_or(defaults.market_cache_ttl),
            market_requests_per_minute: self
                .market_requests_per_minute
                .unwrap_or(defaults.market_requests_per_minute),
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::StageKind;
    use crate::usage::StageRate;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert!(config.cancel_superseded);
        assert_eq!(config.transcript_limit, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::builder()
            .model("local-model")
            .max_tokens(2048)
            .cancel_superseded(false)
            .transcript_limit(100)
            .build()
            .unwrap();

        assert_eq!(config.model, "local-model");
        assert_eq!(config.max_tokens, 2048);
        assert!(!config.cancel_superseded);
        assert_eq!(config.transcript_limit, Some(100));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(PipelineConfig::builder().model("  ").build().is_err());
        assert!(PipelineConfig::builder().max_tokens(0).build().is_err());
        assert!(PipelineConfig::builder().temperature(2.5).build().is_err());
        assert!(PipelineConfig::builder().command_buffer(0).build().is_err());

        match PipelineConfig::builder().transcript_limit(0).build() {
            Err(PipelineError::Config(msg)) => assert!(msg.contains("transcript_limit")),
            other => panic!("Expected Config error, got {other:?}"),
        }
        assert!(PipelineConfig::builder().transcript_limit(1).build().is_ok());

        let pricing = PricingTable::new().with_rate(StageKind::Derive, StageRate::new(f64::NAN, 0.0));
        match PipelineConfig::builder().pricing(pricing).build() {
            Err(PipelineError::Config(msg)) => assert!(msg.contains("Derive")),
            other => panic!("Expected Config error, got {other:?}"),
        }
    }
}
