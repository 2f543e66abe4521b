//! Shared fixtures for unit tests

use crate::stages::{
    DerivedIndicators, NarrativeTakeaways, PivotLevels, RawMarketData, Sentiment, StageKind,
    Takeaway,
};
use crate::usage::{PricingTable, StageRate};
use chrono::{TimeZone, Utc};

pub fn sample_market_data(symbol: &str) -> RawMarketData {
    RawMarketData {
        symbol: symbol.to_string(),
        price: 150.0,
        open: 149.0,
        high: 152.0,
        low: 148.0,
        previous_close: Some(148.0),
        previous_high: None,
        previous_low: None,
        volume: 52_000_000,
        market_status: "CLOSED".to_string(),
        as_of: Utc
            .with_ymd_and_hms(2024, 3, 15, 20, 0, 0)
            .single()
            .unwrap_or_else(Utc::now),
    }
}

pub fn sample_derived() -> DerivedIndicators {
    DerivedIndicators {
        pivot: PivotLevels::classic(152.0, 148.0, 153.0),
    }
}

pub fn sample_takeaways() -> NarrativeTakeaways {
    NarrativeTakeaways {
        price_action: Takeaway::new("Closed at 150.00, up 1.35% on the day", Sentiment::Bullish),
        momentum: Takeaway::new("Higher lows over the last five sessions", Sentiment::Bullish),
        support_resistance: Takeaway::new("Pivot at 151.00 with R1 at 154.00", Sentiment::Neutral),
        risk: Takeaway::new("A close below S1 at 150.00 invalidates the setup", Sentiment::Bearish),
        outlook: Takeaway::new("Constructive while above the pivot", Sentiment::Bullish),
    }
}

/// Rates chosen so that Fetch 100/50 costs 0.001, Derive 80/40 costs 0.0009
/// and Analyze 500/300 costs 0.01
pub fn test_pricing() -> PricingTable {
    PricingTable::new()
        .with_rate(StageKind::Fetch, StageRate::new(5.0, 10.0))
        .with_rate(StageKind::Derive, StageRate::new(5.0, 12.5))
        .with_rate(StageKind::Analyze, StageRate::new(5.0, 25.0))
        .with_rate(StageKind::Chat, StageRate::new(1.0, 2.0))
}
