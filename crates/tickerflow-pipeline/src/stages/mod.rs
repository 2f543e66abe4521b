//! Stage contracts and adapters
//!
//! Each stage is an async trait taking its inputs by reference and returning
//! a typed payload plus optional usage. Stages never touch the session; the
//! orchestrator wraps their results into [`StageOutcome`](crate::StageOutcome)s.
//!
//! Adapters:
//! - [`YahooMarketDataFetcher`]: Fetch via Yahoo Finance
//! - [`PivotPointDeriver`]: local classic pivot computation
//! - [`LlmIndicatorDeriver`], [`LlmNarrativeAnalyzer`], [`LlmChatResponder`]:
//!   generation-backed stages over any [`LLMProvider`](tickerflow_llm::LLMProvider)

pub mod llm;
pub mod payload;
pub mod pivot;
pub mod yahoo;

pub use llm::{LlmBackend, LlmChatResponder, LlmIndicatorDeriver, LlmNarrativeAnalyzer};
pub use payload::{
    DerivedIndicators, NarrativeTakeaways, PivotLevels, RawMarketData, Sentiment, StagePayload,
    Takeaway, TakeawayField,
};
pub use pivot::PivotPointDeriver;
pub use yahoo::YahooMarketDataFetcher;

use crate::chat::{ChatRequest, ChatTurn};
use crate::error::StageError;
use crate::subject::Subject;
use crate::usage::UsageReport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// One unit of asynchronous work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Fetch,
    Derive,
    Analyze,
    Chat,
}

impl StageKind {
    /// All stages in pipeline order
    pub const ALL: [Self; 4] = [Self::Fetch, Self::Derive, Self::Analyze, Self::Chat];

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fetch => "Fetch",
            Self::Derive => "Derive",
            Self::Analyze => "Analyze",
            Self::Chat => "Chat",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Successful stage result
#[derive(Debug, Clone, PartialEq)]
pub struct StageSuccess<T> {
    pub payload: T,
    pub usage: Option<UsageReport>,
}

impl<T> StageSuccess<T> {
    /// Payload without usage
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            usage: None,
        }
    }

    /// Attach a usage report
    pub fn with_usage(mut self, usage: UsageReport) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// What a stage call returns
pub type StageResult<T> = std::result::Result<StageSuccess<T>, StageError>;

/// Fetch stage: raw market data for a ticker
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MarketDataFetcher: Send + Sync {
    /// Retrieve the latest market data
    ///
    /// A successful payload must carry a non-empty market status.
    async fn fetch(&self, subject: &Subject) -> StageResult<RawMarketData>;
}

/// Derive stage: indicator levels from fetched data
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IndicatorDeriver: Send + Sync {
    /// Compute derived indicators, rounded to two decimals
    async fn derive(&self, data: &RawMarketData, subject: &Subject)
    -> StageResult<DerivedIndicators>;
}

/// Analyze stage: narrative takeaways
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NarrativeAnalyzer: Send + Sync {
    /// Produce exactly five labelled takeaways
    async fn analyze(
        &self,
        data: &RawMarketData,
        derived: &DerivedIndicators,
        subject: &Subject,
    ) -> StageResult<NarrativeTakeaways>;
}

/// Chat stage: one conversational turn
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChatResponder: Send + Sync {
    /// Answer `request`; `transcript` holds the turns before it
    async fn respond(&self, request: &ChatRequest, transcript: &[ChatTurn]) -> StageResult<String>;
}

/// The four stage implementations the orchestrator drives
#[derive(Clone)]
pub struct StageSet {
    pub fetcher: Arc<dyn MarketDataFetcher>,
    pub deriver: Arc<dyn IndicatorDeriver>,
    pub analyzer: Arc<dyn NarrativeAnalyzer>,
    pub chat: Arc<dyn ChatResponder>,
}

impl StageSet {
    /// Bundle stage implementations
    pub fn new(
        fetcher: Arc<dyn MarketDataFetcher>,
        deriver: Arc<dyn IndicatorDeriver>,
        analyzer: Arc<dyn NarrativeAnalyzer>,
        chat: Arc<dyn ChatResponder>,
    ) -> Self {
        Self {
            fetcher,
            deriver,
            analyzer,
            chat,
        }
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageSet").finish_non_exhaustive()
    }
}
