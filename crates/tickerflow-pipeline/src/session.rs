//! Session aggregate and generation guard

use crate::error::StageError;
use crate::stages::{DerivedIndicators, NarrativeTakeaways, RawMarketData, StageKind};
use crate::subject::Subject;
use crate::usage::UsageReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one top-level request and everything descended from it
///
/// Strictly increasing; the only staleness discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    /// Generation of a freshly constructed session
    pub const INITIAL: Self = Self(0);

    /// Raw counter value
    pub fn value(&self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where the current generation is in the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    #[default]
    Idle,
    Fetching,
    FetchFailed,
    Deriving,
    DeriveFailed,
    Analyzing,
    AnalyzeFailed,
    Complete,
}

impl PipelineStage {
    /// Any `*Failed` state
    pub fn is_failed(&self) -> bool {
        self.failed_stage().is_some()
    }

    /// No further transition will happen within this generation
    pub fn is_terminal(&self) -> bool {
        self.is_failed() || *self == Self::Complete
    }

    /// Stage that halted the chain, if any
    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            Self::FetchFailed => Some(StageKind::Fetch),
            Self::DeriveFailed => Some(StageKind::Derive),
            Self::AnalyzeFailed => Some(StageKind::Analyze),
            _ => None,
        }
    }

    /// Position in the forward-only ordering
    pub(crate) fn rank(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Fetching => 1,
            Self::FetchFailed | Self::Deriving => 2,
            Self::DeriveFailed | Self::Analyzing => 3,
            Self::AnalyzeFailed | Self::Complete => 4,
        }
    }

    /// Human label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Fetching => "fetching market data",
            Self::FetchFailed => "fetch failed",
            Self::Deriving => "deriving indicators",
            Self::DeriveFailed => "derive failed",
            Self::Analyzing => "analyzing narrative",
            Self::AnalyzeFailed => "analyze failed",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Settled result of one stage within a generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageRecord<T> {
    pub payload: Option<T>,
    pub usage: Option<UsageReport>,
    pub error: Option<StageError>,
    pub completed_at_generation: Generation,
}

impl<T> StageRecord<T> {
    pub(crate) fn succeeded(generation: Generation, payload: T, usage: Option<UsageReport>) -> Self {
        Self {
            payload: Some(payload),
            usage,
            error: None,
            completed_at_generation: generation,
        }
    }

    pub(crate) fn failed(generation: Generation, error: StageError) -> Self {
        Self {
            payload: None,
            usage: None,
            error: Some(error),
            completed_at_generation: generation,
        }
    }

    /// Successful payload
    pub fn payload(&self) -> Option<&T> {
        self.payload.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.payload.is_some()
    }
}

/// User-visible failure attributed to a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    pub stage: StageKind,
    pub subject: Subject,
    pub message: String,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed for {}: {}", self.stage, self.subject, self.message)
    }
}

/// The single current analysis session
///
/// Replaced wholesale by [`Session::begin`] on every top-level request and
/// otherwise only mutated by the reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Session {
    generation: Generation,
    subject: Option<Subject>,
    stage: PipelineStage,
    fetch: Option<StageRecord<RawMarketData>>,
    derive: Option<StageRecord<DerivedIndicators>>,
    analyze: Option<StageRecord<NarrativeTakeaways>>,
    wants_auto_chat: bool,
    error: Option<StageFailure>,
}

impl Session {
    /// Fresh session for a new generation, already in `Fetching`
    pub(crate) fn begin(generation: Generation, subject: Subject, wants_auto_chat: bool) -> Self {
        Self {
            generation,
            subject: Some(subject),
            stage: PipelineStage::Fetching,
            wants_auto_chat,
            ..Self::default()
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Subject of the current generation (`None` before the first request)
    pub fn subject(&self) -> Option<&Subject> {
        self.subject.as_ref()
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    pub fn fetch(&self) -> Option<&StageRecord<RawMarketData>> {
        self.fetch.as_ref()
    }

    pub fn derive(&self) -> Option<&StageRecord<DerivedIndicators>> {
        self.derive.as_ref()
    }

    pub fn analyze(&self) -> Option<&StageRecord<NarrativeTakeaways>> {
        self.analyze.as_ref()
    }

    /// Whether an automatic chat turn is still owed to this generation
    pub fn wants_auto_chat(&self) -> bool {
        self.wants_auto_chat
    }

    /// Failure that halted the current generation
    pub fn failure(&self) -> Option<&StageFailure> {
        self.error.as_ref()
    }

    /// Generation guard: `generation` is current and `subject` matches
    pub fn is_current(&self, generation: Generation, subject: &Subject) -> bool {
        generation == self.generation && self.subject.as_ref() == Some(subject)
    }

    pub(crate) fn clear_auto_chat(&mut self) {
        self.wants_auto_chat = false;
    }

    /// Move forward; backward transitions are ignored
    pub(crate) fn advance(&mut self, next: PipelineStage) -> bool {
        if next.rank() <= self.stage.rank() {
            return false;
        }
        self.stage = next;
        true
    }

    pub(crate) fn set_fetch(&mut self, record: StageRecord<RawMarketData>) {
        self.fetch = Some(record);
    }

    pub(crate) fn set_derive(&mut self, record: StageRecord<DerivedIndicators>) {
        self.derive = Some(record);
    }

    pub(crate) fn set_analyze(&mut self, record: StageRecord<NarrativeTakeaways>) {
        self.analyze = Some(record);
    }

    /// Record a halting failure for `stage`
    pub(crate) fn fail(&mut self, stage: StageKind, error: &StageError) {
        if let Some(subject) = self.subject.clone() {
            self.error = Some(StageFailure {
                stage,
                subject,
                message: error.to_string(),
            });
        }
    }
}
