//! Reconciler state machine
//!
//! [`Pipeline`] owns the current [`Session`] and the [`UsageAccumulator`].
//! It is purely synchronous: each `apply_*` call reconciles one
//! [`StageOutcome`] and returns the next stage to dispatch, leaving all I/O
//! to the caller. Every outcome passes the same checks in order:
//!
//! 1. generation guard (older generation or different subject: stale)
//! 2. duplicate check (stage already settled for this generation)
//! 3. state check (session is actually waiting for this stage)
//! 4. payload validation (a structurally invalid success becomes a failure)
//! 5. usage fold, at most once per `(generation, stage)`

use crate::error::StageError;
use crate::outcome::StageOutcome;
use crate::session::{Generation, PipelineStage, Session, StageRecord};
use crate::stages::{
    DerivedIndicators, NarrativeTakeaways, RawMarketData, StageKind, StagePayload, StageResult,
};
use crate::subject::Subject;
use crate::usage::{CumulativeStats, UsageAccumulator, UsageReport};
use tracing::{debug, info, warn};

/// Next stage call to make
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Fetch {
        generation: Generation,
        subject: Subject,
    },
    Derive {
        generation: Generation,
        subject: Subject,
        data: RawMarketData,
    },
    Analyze {
        generation: Generation,
        subject: Subject,
        data: RawMarketData,
        derived: DerivedIndicators,
    },
}

impl Dispatch {
    pub fn stage(&self) -> StageKind {
        match self {
            Self::Fetch { .. } => StageKind::Fetch,
            Self::Derive { .. } => StageKind::Derive,
            Self::Analyze { .. } => StageKind::Analyze,
        }
    }

    pub fn generation(&self) -> Generation {
        match self {
            Self::Fetch { generation, .. }
            | Self::Derive { generation, .. }
            | Self::Analyze { generation, .. } => *generation,
        }
    }
}

/// Result of reconciling one outcome
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    /// Outcome belongs to a superseded generation or another subject
    Stale,
    /// Stage already settled for this generation
    Duplicate,
    /// Session is not waiting for this stage
    Unexpected,
    /// Session mutated; `next` is the follow-up stage call, if any
    Applied {
        stage: PipelineStage,
        next: Option<Dispatch>,
    },
}

impl Reconciliation {
    /// Whether the session changed
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Session plus usage accounting, mutated only through reconciliation
#[derive(Debug, Default)]
pub struct Pipeline {
    session: Session,
    usage: UsageAccumulator,
}

impl Pipeline {
    /// Idle session at generation 0, empty totals
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub(crate) fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Process-lifetime usage totals
    pub fn stats(&self) -> CumulativeStats {
        self.usage.stats()
    }

    /// Start a new generation and return the Fetch dispatch for it
    ///
    /// Replaces the session wholesale; cumulative usage is kept.
    pub fn begin_request(&mut self, subject: Subject, wants_auto_chat: bool) -> Dispatch {
        let generation = self.session.generation().next();
        info!(%generation, %subject, wants_auto_chat, "Starting analysis request");
        self.session = Session::begin(generation, subject.clone(), wants_auto_chat);
        Dispatch::Fetch { generation, subject }
    }

    /// Fold a chat turn's usage (no generation guard)
    pub fn fold_chat_usage(&mut self, usage: &UsageReport) -> CumulativeStats {
        self.usage.fold(usage)
    }

    /// Reconcile a Fetch outcome
    pub fn apply_fetch(&mut self, outcome: StageOutcome<RawMarketData>) -> Reconciliation {
        let StageOutcome {
            generation,
            subject,
            result,
        } = outcome;
        if let Some(rejected) = self.check(
            StageKind::Fetch,
            generation,
            &subject,
            self.session.fetch().is_some(),
            PipelineStage::Fetching,
        ) {
            return rejected;
        }

        match self.settle(generation, result) {
            Ok((data, usage)) => {
                self.session
                    .set_fetch(StageRecord::succeeded(generation, data.clone(), usage));
                self.transition(PipelineStage::Deriving);
                Reconciliation::Applied {
                    stage: PipelineStage::Deriving,
                    next: Some(Dispatch::Derive {
                        generation,
                        subject,
                        data,
                    }),
                }
            }
            Err(err) => {
                self.session.set_fetch(StageRecord::failed(generation, err.clone()));
                self.halt(StageKind::Fetch, PipelineStage::FetchFailed, &err)
            }
        }
    }

    /// Reconcile a Derive outcome
    pub fn apply_derive(&mut self, outcome: StageOutcome<DerivedIndicators>) -> Reconciliation {
        let StageOutcome {
            generation,
            subject,
            result,
        } = outcome;
        if let Some(rejected) = self.check(
            StageKind::Derive,
            generation,
            &subject,
            self.session.derive().is_some(),
            PipelineStage::Deriving,
        ) {
            return rejected;
        }

        let Some(data) = self.current_payload(self.session.fetch()) else {
            warn!(%generation, "Derive outcome without a fetched payload");
            return Reconciliation::Unexpected;
        };

        match self.settle(generation, result) {
            Ok((derived, usage)) => {
                self.session
                    .set_derive(StageRecord::succeeded(generation, derived, usage));
                self.transition(PipelineStage::Analyzing);
                Reconciliation::Applied {
                    stage: PipelineStage::Analyzing,
                    next: Some(Dispatch::Analyze {
                        generation,
                        subject,
                        data,
                        derived,
                    }),
                }
            }
            Err(err) => {
                self.session.set_derive(StageRecord::failed(generation, err.clone()));
                self.halt(StageKind::Derive, PipelineStage::DeriveFailed, &err)
            }
        }
    }

    /// Reconcile an Analyze outcome
    ///
    /// The analysis is only stored while the fetch and derive records both
    /// belong to the current generation.
    pub fn apply_analyze(&mut self, outcome: StageOutcome<NarrativeTakeaways>) -> Reconciliation {
        let StageOutcome {
            generation,
            subject,
            result,
        } = outcome;
        if let Some(rejected) = self.check(
            StageKind::Analyze,
            generation,
            &subject,
            self.session.analyze().is_some(),
            PipelineStage::Analyzing,
        ) {
            return rejected;
        }

        if self.current_payload(self.session.fetch()).is_none()
            || self.current_payload(self.session.derive()).is_none()
        {
            warn!(%generation, "Analyze outcome without current fetch and derive payloads");
            return Reconciliation::Unexpected;
        }

        match self.settle(generation, result) {
            Ok((takeaways, usage)) => {
                self.session
                    .set_analyze(StageRecord::succeeded(generation, takeaways, usage));
                self.transition(PipelineStage::Complete);
                Reconciliation::Applied {
                    stage: PipelineStage::Complete,
                    next: None,
                }
            }
            Err(err) => {
                self.session.set_analyze(StageRecord::failed(generation, err.clone()));
                self.halt(StageKind::Analyze, PipelineStage::AnalyzeFailed, &err)
            }
        }
    }

    /// Guard, duplicate and state checks shared by every stage
    fn check(
        &self,
        stage: StageKind,
        generation: Generation,
        subject: &Subject,
        settled: bool,
        awaiting: PipelineStage,
    ) -> Option<Reconciliation> {
        if !self.session.is_current(generation, subject) {
            debug!(
                %stage,
                stale = %generation,
                current = %self.session.generation(),
                %subject,
                "Discarding stale stage result"
            );
            return Some(Reconciliation::Stale);
        }
        if settled {
            debug!(%stage, %generation, "Ignoring duplicate stage result");
            return Some(Reconciliation::Duplicate);
        }
        if self.session.stage() != awaiting {
            debug!(
                %stage,
                %generation,
                session_stage = %self.session.stage(),
                "Ignoring stage result the session is not waiting for"
            );
            return Some(Reconciliation::Unexpected);
        }
        None
    }

    /// Validate a result and fold its usage
    fn settle<T: StagePayload>(
        &mut self,
        generation: Generation,
        result: StageResult<T>,
    ) -> Result<(T, Option<UsageReport>), StageError> {
        let success = result?;
        success.payload.validate()?;
        if let Some(usage) = &success.usage {
            self.usage.fold_once(generation, T::KIND, usage);
        }
        Ok((success.payload, success.usage))
    }

    fn current_payload<T: Clone>(&self, record: Option<&StageRecord<T>>) -> Option<T> {
        record
            .filter(|r| r.completed_at_generation == self.session.generation())
            .and_then(|r| r.payload().cloned())
    }

    fn transition(&mut self, next: PipelineStage) {
        if self.session.advance(next) {
            info!(
                generation = %self.session.generation(),
                stage = %next,
                "Pipeline advanced"
            );
        }
    }

    fn halt(&mut self, stage: StageKind, failed: PipelineStage, err: &StageError) -> Reconciliation {
        self.session.fail(stage, err);
        self.transition(failed);
        if let Some(failure) = self.session.failure() {
            warn!(generation = %self.session.generation(), "{failure}");
        }
        Reconciliation::Applied {
            stage: failed,
            next: None,
        }
    }
}
