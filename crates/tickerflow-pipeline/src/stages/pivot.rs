//! Local pivot-point deriver

use super::{
    DerivedIndicators, IndicatorDeriver, PivotLevels, RawMarketData, StagePayload, StageResult,
    StageSuccess,
};
use crate::error::StageError;
use crate::subject::Subject;
use async_trait::async_trait;

/// Derive stage computing classic pivots in-process
///
/// Levels come from the previous completed session's high, low and close
/// (see [`RawMarketData::pivot_inputs`]); only when the fetch carried no
/// prior session does it fall back to the latest bar. Deterministic and
/// free: no remote call, no usage report.
#[derive(Debug, Clone, Copy, Default)]
pub struct PivotPointDeriver;

impl PivotPointDeriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl IndicatorDeriver for PivotPointDeriver {
    async fn derive(&self, data: &RawMarketData, _subject: &Subject) -> StageResult<DerivedIndicators> {
        let (high, low, close) = data.pivot_inputs();
        if [high, low, close].iter().any(|v| !v.is_finite()) || high < low {
            return Err(StageError::malformed(format!(
                "cannot derive pivots from high {high} / low {low}"
            )));
        }

        let derived = DerivedIndicators {
            pivot: PivotLevels::classic(high, low, close),
        };
        derived.validate()?;
        Ok(StageSuccess::new(derived))
    }
}
