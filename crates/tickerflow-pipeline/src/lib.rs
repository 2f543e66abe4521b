//! Multi-stage analysis pipeline for a single ticker
//!
//! A top-level request for a ticker runs four remote stages:
//!
//! - **Fetch**: raw market data for the ticker
//! - **Derive**: pivot-style support/resistance levels from the fetched bar
//! - **Analyze**: five labelled narrative takeaways with sentiment
//! - **Chat**: conversational follow-up, optionally fired automatically once
//!   the analysis completes
//!
//! Every request opens a new [`Generation`]. Stage outcomes carry the
//! generation they were dispatched for, and the reconciler drops any outcome
//! whose generation is no longer current, so overlapping requests and
//! out-of-order completions can never corrupt the visible [`Session`].
//! Token usage of accepted outcomes is folded into [`CumulativeStats`]
//! exactly once.
//!
//! # Architecture
//!
//! - [`Pipeline`]: synchronous state machine (session, generation guard,
//!   usage accounting) returning the next stage to dispatch
//! - [`AutoChatTrigger`]: observer that fires one chat turn per generation
//! - [`Orchestrator`]: tokio actor that owns the state machine, runs the
//!   stage calls and publishes [`PipelineSnapshot`]s
//! - [`stages`]: stage contracts plus LLM, Yahoo and local adapters
//!
//! # Example
//!
//! ```rust,ignore
//! use tickerflow_pipeline::{Orchestrator, PipelineConfig, StageSet};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let stages = StageSet::new(fetcher, deriver, analyzer, chat);
//!     let handle = Orchestrator::spawn(PipelineConfig::default(), stages)?;
//!
//!     handle.submit_top_level_request("aapl", true).await?;
//!     let snapshot = handle.wait_until(|s| s.session.stage().is_terminal()).await?;
//!     println!("{}", serde_json::to_string_pretty(&snapshot)?);
//!     Ok(())
//! }
//! ```

pub mod auto_chat;
pub mod chat;
pub mod config;
pub mod digest;
pub mod error;
pub mod orchestrator;
pub mod outcome;
pub mod pipeline;
pub mod prompts;
pub mod session;
pub mod snapshot;
pub mod stages;
pub mod subject;
pub mod usage;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types for convenience
pub use auto_chat::AutoChatTrigger;
pub use chat::{ChatOrigin, ChatRequest, ChatTurn, Sender, Transcript};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{PipelineError, Result, StageError, ValidationError};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use outcome::StageOutcome;
pub use pipeline::{Dispatch, Pipeline, Reconciliation};
pub use session::{Generation, PipelineStage, Session, StageFailure, StageRecord};
pub use snapshot::PipelineSnapshot;
pub use stages::{
    ChatResponder, DerivedIndicators, IndicatorDeriver, MarketDataFetcher, NarrativeAnalyzer,
    NarrativeTakeaways, PivotLevels, RawMarketData, Sentiment, StageKind, StageResult, StageSet,
    StageSuccess, Takeaway, TakeawayField,
};
pub use subject::Subject;
pub use usage::{CumulativeStats, PricingTable, StageRate, UsageAccumulator, UsageReport};
