//! Stage outcome envelope

use crate::error::StageError;
use crate::session::Generation;
use crate::stages::{StageResult, StageSuccess};
use crate::subject::Subject;

/// The only value handed from a stage call back into the session
///
/// Tagged with the generation and subject the call was dispatched for so the
/// reconciler can drop it once superseded.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome<T> {
    pub generation: Generation,
    pub subject: Subject,
    pub result: StageResult<T>,
}

impl<T> StageOutcome<T> {
    pub fn new(generation: Generation, subject: Subject, result: StageResult<T>) -> Self {
        Self {
            generation,
            subject,
            result,
        }
    }

    /// Successful outcome
    pub fn success(generation: Generation, subject: Subject, success: StageSuccess<T>) -> Self {
        Self::new(generation, subject, Ok(success))
    }

    /// Failed outcome
    pub fn failure(generation: Generation, subject: Subject, error: StageError) -> Self {
        Self::new(generation, subject, Err(error))
    }
}
