//! Usage accounting
//!
//! Stage calls report input/output units. A [`PricingTable`] turns them into
//! a [`UsageReport`] with a derived cost, and the [`UsageAccumulator`] folds
//! accepted reports into process-lifetime [`CumulativeStats`].

use crate::session::Generation;
use crate::stages::StageKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Price of one stage's units, per million
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageRate {
    /// Cost per million input units
    pub input_per_million: f64,
    /// Cost per million output units
    pub output_per_million: f64,
}

impl StageRate {
    /// A rate that prices everything at zero
    pub const FREE: Self = Self::new(0.0, 0.0);

    /// Create a rate
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Cost of a call with the given unit counts
    pub fn cost(&self, input_units: u64, output_units: u64) -> f64 {
        (input_units as f64 * self.input_per_million + output_units as f64 * self.output_per_million)
            / 1_000_000.0
    }

    fn is_valid(&self) -> bool {
        [self.input_per_million, self.output_per_million]
            .iter()
            .all(|v| v.is_finite() && *v >= 0.0)
    }
}

/// Per-stage pricing
///
/// Stages without an entry are priced at [`StageRate::FREE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    rates: HashMap<StageKind, StageRate>,
}

impl Default for PricingTable {
    fn default() -> Self {
        // Market data is free; the generation stages use small-model list prices.
        let generation = StageRate::new(0.15, 0.60);
        Self::new()
            .with_rate(StageKind::Derive, generation)
            .with_rate(StageKind::Analyze, generation)
            .with_rate(StageKind::Chat, generation)
    }
}

impl PricingTable {
    /// Empty table (everything free)
    pub fn new() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    /// Set the rate for one stage
    pub fn with_rate(mut self, stage: StageKind, rate: StageRate) -> Self {
        self.rates.insert(stage, rate);
        self
    }

    /// Rate for a stage
    pub fn rate(&self, stage: StageKind) -> StageRate {
        self.rates.get(&stage).copied().unwrap_or(StageRate::FREE)
    }

    /// Price a call
    pub fn price(&self, stage: StageKind, input_units: u64, output_units: u64) -> UsageReport {
        UsageReport {
            stage,
            input_units,
            output_units,
            cost: self.rate(stage).cost(input_units, output_units),
        }
    }

    /// Reject negative or non-finite rates
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self.rates.iter().find(|(_, rate)| !rate.is_valid()) {
            Some((stage, rate)) => Err(format!("invalid rate for {stage}: {rate:?}")),
            None => Ok(()),
        }
    }
}

/// Billing record for one stage call
///
/// The cost is fixed at pricing time; there is no way to set it directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct UsageReport {
    stage: StageKind,
    input_units: u64,
    output_units: u64,
    cost: f64,
}

impl UsageReport {
    /// Stage that produced the usage
    pub fn stage(&self) -> StageKind {
        self.stage
    }

    /// Input units consumed
    pub fn input_units(&self) -> u64 {
        self.input_units
    }

    /// Output units produced
    pub fn output_units(&self) -> u64 {
        self.output_units
    }

    /// Derived cost
    pub fn cost(&self) -> f64 {
        self.cost
    }
}

/// Running totals for the whole process lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CumulativeStats {
    pub total_input_units: u64,
    pub total_output_units: u64,
    pub total_cost: f64,
    pub call_count: u64,
}

impl CumulativeStats {
    /// Add one report
    pub fn fold(self, usage: &UsageReport) -> Self {
        Self {
            total_input_units: self.total_input_units + usage.input_units,
            total_output_units: self.total_output_units + usage.output_units,
            total_cost: self.total_cost + usage.cost,
            call_count: self.call_count + 1,
        }
    }
}

/// Folds usage into [`CumulativeStats`], at most once per `(generation, stage)`
///
/// Totals are never reset by a new generation.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    stats: CumulativeStats,
    last_folded: HashMap<StageKind, Generation>,
}

impl UsageAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Current totals
    pub fn stats(&self) -> CumulativeStats {
        self.stats
    }

    /// Fold unconditionally (chat turns)
    pub fn fold(&mut self, usage: &UsageReport) -> CumulativeStats {
        self.stats = self.stats.fold(usage);
        self.stats
    }

    /// Fold a pipeline stage's usage unless `stage` was already folded for
    /// this generation
    ///
    /// The key is the stage being reconciled, not the stage the report is
    /// labelled with. Returns `true` when the usage was folded.
    pub fn fold_once(
        &mut self,
        generation: Generation,
        stage: StageKind,
        usage: &UsageReport,
    ) -> bool {
        if self.last_folded.get(&stage) == Some(&generation) {
            debug!(%stage, %generation, "Usage already folded for this generation");
            return false;
        }
        if usage.stage != stage {
            debug!(%stage, reported = %usage.stage, "Usage report labelled with another stage");
        }
        self.last_folded.insert(stage, generation);
        self.fold(usage);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PricingTable {
        PricingTable::new().with_rate(StageKind::Analyze, StageRate::new(5.0, 25.0))
    }

    #[test]
    fn test_cost_is_derived_from_rate() {
        let usage = table().price(StageKind::Analyze, 500, 300);
        assert!((usage.cost() - 0.01).abs() < 1e-12);
        assert_eq!(usage.input_units(), 500);
        assert_eq!(usage.output_units(), 300);
        assert_eq!(usage.stage(), StageKind::Analyze);
    }

    #[test]
    fn test_missing_rate_is_free() {
        let usage = table().price(StageKind::Fetch, 1_000, 1_000);
        assert_eq!(usage.cost(), 0.0);
    }

    #[test]
    fn test_fold_is_additive() {
        let pricing = table().with_rate(StageKind::Chat, StageRate::new(1.0, 2.0));
        let reports = [
            pricing.price(StageKind::Analyze, 500, 300),
            pricing.price(StageKind::Chat, 1_000, 500),
            pricing.price(StageKind::Chat, 10, 10),
        ];

        let mut acc = UsageAccumulator::new();
        for report in &reports {
            acc.fold(report);
        }

        let stats = acc.stats();
        let expected: f64 = reports.iter().map(UsageReport::cost).sum();
        assert!((stats.total_cost - expected).abs() < 1e-12);
        assert_eq!(stats.call_count, 3);
        assert_eq!(stats.total_input_units, 1_510);
        assert_eq!(stats.total_output_units, 810);
    }

    #[test]
    fn test_fold_once_per_generation() {
        let usage = table().price(StageKind::Analyze, 500, 300);
        let mut acc = UsageAccumulator::new();
        let first = Generation::INITIAL.next();

        assert!(acc.fold_once(first, StageKind::Analyze, &usage));
        assert!(!acc.fold_once(first, StageKind::Analyze, &usage));
        assert_eq!(acc.stats().call_count, 1);

        assert!(acc.fold_once(first.next(), StageKind::Analyze, &usage));
        assert_eq!(acc.stats().call_count, 2);
    }

    #[test]
    fn test_fold_once_keyed_on_reconciled_stage() {
        let pricing = table();
        let mut acc = UsageAccumulator::new();
        let first = Generation::INITIAL.next();

        // A deriver that mislabels its report as Analyze must not block Analyze.
        let mislabelled = pricing.price(StageKind::Analyze, 100, 50);
        assert!(acc.fold_once(first, StageKind::Derive, &mislabelled));
        assert!(!acc.fold_once(first, StageKind::Derive, &mislabelled));

        let analyze = pricing.price(StageKind::Analyze, 500, 300);
        assert!(acc.fold_once(first, StageKind::Analyze, &analyze));
        assert_eq!(acc.stats().call_count, 2);
        assert_eq!(acc.stats().total_input_units, 600);
    }

    #[test]
    fn test_validate_rejects_negative_rate() {
        let pricing = PricingTable::new().with_rate(StageKind::Chat, StageRate::new(-1.0, 0.0));
        assert!(pricing.validate().is_err());
        assert!(PricingTable::default().validate().is_ok());
    }
}
