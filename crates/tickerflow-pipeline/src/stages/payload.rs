//! Stage payloads and their validation

use crate::error::StageError;
use crate::stages::StageKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Round to the two-decimal display precision
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Common behaviour of pipeline stage payloads
pub trait StagePayload: Clone + Send + 'static {
    /// Stage producing this payload
    const KIND: StageKind;

    /// Structural check applied before the payload is accepted
    fn validate(&self) -> Result<(), StageError>;

    /// Human-readable summary used in chat digests
    fn summary(&self) -> String;
}

/// Latest market data for a ticker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMarketData {
    pub symbol: String,
    pub price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub previous_close: Option<f64>,
    /// High of the previous completed session
    #[serde(default)]
    pub previous_high: Option<f64>,
    /// Low of the previous completed session
    #[serde(default)]
    pub previous_low: Option<f64>,
    pub volume: u64,
    /// Exchange session status, e.g. `OPEN` or `CLOSED`
    pub market_status: String,
    pub as_of: DateTime<Utc>,
}

impl RawMarketData {
    /// Change against the previous close, in percent
    pub fn change_percent(&self) -> Option<f64> {
        self.previous_close
            .filter(|prev| *prev > 0.0)
            .map(|prev| round2((self.price - prev) / prev * 100.0))
    }

    /// High, low and close feeding a classic pivot calculation
    ///
    /// Uses the previous completed session when all three of its values are
    /// known, otherwise the latest (possibly in-progress) bar.
    pub fn pivot_inputs(&self) -> (f64, f64, f64) {
        match (self.previous_high, self.previous_low, self.previous_close) {
            (Some(high), Some(low), Some(close)) => (high, low, close),
            _ => (self.high, self.low, self.price),
        }
    }
}

impl StagePayload for RawMarketData {
    const KIND: StageKind = StageKind::Fetch;

    fn validate(&self) -> Result<(), StageError> {
        if self.market_status.trim().is_empty() {
            return Err(StageError::malformed(format!(
                "market data for {} has no market status",
                self.symbol
            )));
        }
        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(StageError::malformed(format!(
                "market data for {} has an unusable price {}",
                self.symbol, self.price
            )));
        }
        Ok(())
    }

    fn summary(&self) -> String {
        let mut summary = format!(
            "{} last {:.2} (open {:.2}, high {:.2}, low {:.2}",
            self.symbol, self.price, self.open, self.high, self.low
        );
        if let Some(prev) = self.previous_close {
            summary.push_str(&format!(", previous close {prev:.2}"));
        }
        summary.push(')');
        if let Some(change) = self.change_percent() {
            summary.push_str(&format!(", {change:+.2}%"));
        }
        summary.push_str(&format!(
            ", volume {}, market {} as of {}",
            self.volume,
            self.market_status,
            self.as_of.format("%Y-%m-%d %H:%M UTC")
        ));
        summary
    }
}

/// Classic floor-trader pivot levels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PivotLevels {
    pub pp: f64,
    pub r1: f64,
    pub r2: f64,
    pub r3: f64,
    pub s1: f64,
    pub s2: f64,
    pub s3: f64,
}

impl PivotLevels {
    const KEYS: [&'static str; 7] = ["PP", "R1", "R2", "R3", "S1", "S2", "S3"];

    /// Compute levels from a bar's high, low and close
    pub fn classic(high: f64, low: f64, close: f64) -> Self {
        let pp = (high + low + close) / 3.0;
        let range = high - low;
        Self {
            pp: round2(pp),
            r1: round2(2.0 * pp - low),
            r2: round2(pp + range),
            r3: round2(high + 2.0 * (pp - low)),
            s1: round2(2.0 * pp - high),
            s2: round2(pp - range),
            s3: round2(low - 2.0 * (high - pp)),
        }
    }

    fn values(&self) -> [f64; 7] {
        [self.pp, self.r1, self.r2, self.r3, self.s1, self.s2, self.s3]
    }

    /// Parse levels from a JSON object keyed `PP`, `R1` … `S3` (any case)
    pub fn from_json(value: &Value) -> Result<Self, StageError> {
        let object = value
            .as_object()
            .ok_or_else(|| StageError::malformed("pivot levels must be a JSON object"))?;

        let mut levels = [0.0_f64; 7];
        for (slot, key) in levels.iter_mut().zip(Self::KEYS) {
            let raw = object
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v)
                .ok_or_else(|| StageError::malformed(format!("missing pivot level {key}")))?;
            let number = raw
                .as_f64()
                .filter(|n| n.is_finite())
                .ok_or_else(|| StageError::malformed(format!("pivot level {key} is not a number")))?;
            *slot = round2(number);
        }

        let [pp, r1, r2, r3, s1, s2, s3] = levels;
        Ok(Self {
            pp,
            r1,
            r2,
            r3,
            s1,
            s2,
            s3,
        })
    }
}

/// Output of the Derive stage
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedIndicators {
    pub pivot: PivotLevels,
}

impl DerivedIndicators {
    /// Parse a remote response, either `{"pivot": {...}}` or the levels inline
    pub fn from_json(value: &Value) -> Result<Self, StageError> {
        let levels = value
            .get("pivot")
            .or_else(|| value.get("pivots"))
            .unwrap_or(value);
        Ok(Self {
            pivot: PivotLevels::from_json(levels)?,
        })
    }
}

impl StagePayload for DerivedIndicators {
    const KIND: StageKind = StageKind::Derive;

    fn validate(&self) -> Result<(), StageError> {
        if self.pivot.values().iter().all(|v| v.is_finite()) {
            Ok(())
        } else {
            Err(StageError::malformed("pivot levels contain non-finite values"))
        }
    }

    fn summary(&self) -> String {
        let p = &self.pivot;
        format!(
            "Pivot {:.2} | R1 {:.2}, R2 {:.2}, R3 {:.2} | S1 {:.2}, S2 {:.2}, S3 {:.2}",
            p.pp, p.r1, p.r2, p.r3, p.s1, p.s2, p.s3
        )
    }
}

/// Directional tone of a takeaway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Bullish,
    Bearish,
    Neutral,
}

impl Sentiment {
    /// Case-insensitive parse of `bullish`, `bearish` or `neutral`
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bullish" => Some(Self::Bullish),
            "bearish" => Some(Self::Bearish),
            "neutral" => Some(Self::Neutral),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One labelled narrative point
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Takeaway {
    pub text: String,
    pub sentiment: Sentiment,
}

impl Takeaway {
    pub fn new(text: impl Into<String>, sentiment: Sentiment) -> Self {
        Self {
            text: text.into(),
            sentiment,
        }
    }
}

/// The five takeaway labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeawayField {
    PriceAction,
    Momentum,
    SupportResistance,
    Risk,
    Outlook,
}

impl TakeawayField {
    pub const ALL: [Self; 5] = [
        Self::PriceAction,
        Self::Momentum,
        Self::SupportResistance,
        Self::Risk,
        Self::Outlook,
    ];

    /// JSON key
    pub fn key(&self) -> &'static str {
        match self {
            Self::PriceAction => "price_action",
            Self::Momentum => "momentum",
            Self::SupportResistance => "support_resistance",
            Self::Risk => "risk",
            Self::Outlook => "outlook",
        }
    }

    /// Human label
    pub fn label(&self) -> &'static str {
        match self {
            Self::PriceAction => "Price action",
            Self::Momentum => "Momentum",
            Self::SupportResistance => "Support & resistance",
            Self::Risk => "Risk",
            Self::Outlook => "Outlook",
        }
    }
}

/// Output of the Analyze stage: exactly five takeaways
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrativeTakeaways {
    pub price_action: Takeaway,
    pub momentum: Takeaway,
    pub support_resistance: Takeaway,
    pub risk: Takeaway,
    pub outlook: Takeaway,
}

impl NarrativeTakeaways {
    /// Takeaway for a label
    pub fn get(&self, field: TakeawayField) -> &Takeaway {
        match field {
            TakeawayField::PriceAction => &self.price_action,
            TakeawayField::Momentum => &self.momentum,
            TakeawayField::SupportResistance => &self.support_resistance,
            TakeawayField::Risk => &self.risk,
            TakeawayField::Outlook => &self.outlook,
        }
    }

    /// Labels paired with their takeaways, in display order
    pub fn iter(&self) -> impl Iterator<Item = (TakeawayField, &Takeaway)> {
        TakeawayField::ALL.into_iter().map(|field| (field, self.get(field)))
    }

    /// Parse a remote response
    ///
    /// Every field must be present with non-empty text and a valid sentiment;
    /// anything else is a malformed response.
    pub fn from_json(value: &Value) -> Result<Self, StageError> {
        let root = value.get("takeaways").unwrap_or(value);
        let field = |f: TakeawayField| parse_takeaway(root, f);
        Ok(Self {
            price_action: field(TakeawayField::PriceAction)?,
            momentum: field(TakeawayField::Momentum)?,
            support_resistance: field(TakeawayField::SupportResistance)?,
            risk: field(TakeawayField::Risk)?,
            outlook: field(TakeawayField::Outlook)?,
        })
    }
}

fn parse_takeaway(root: &Value, field: TakeawayField) -> Result<Takeaway, StageError> {
    let key = field.key();
    let entry = root
        .get(key)
        .ok_or_else(|| StageError::malformed(format!("missing takeaway '{key}'")))?;

    let text = entry
        .get("text")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| StageError::malformed(format!("takeaway '{key}' has no text")))?;

    let raw_sentiment = entry
        .get("sentiment")
        .and_then(Value::as_str)
        .ok_or_else(|| StageError::malformed(format!("takeaway '{key}' has no sentiment")))?;
    let sentiment = Sentiment::parse(raw_sentiment).ok_or_else(|| {
        StageError::malformed(format!(
            "takeaway '{key}' has invalid sentiment '{raw_sentiment}'"
        ))
    })?;

    Ok(Takeaway::new(text, sentiment))
}

impl StagePayload for NarrativeTakeaways {
    const KIND: StageKind = StageKind::Analyze;

    fn validate(&self) -> Result<(), StageError> {
        match self.iter().find(|(_, t)| t.text.trim().is_empty()) {
            Some((field, _)) => Err(StageError::malformed(format!(
                "takeaway '{}' has no text",
                field.key()
            ))),
            None => Ok(()),
        }
    }

    fn summary(&self) -> String {
        self.iter()
            .map(|(field, t)| format!("- {} ({}): {}", field.label(), t.sentiment, t.text))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
