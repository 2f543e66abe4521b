//! Yahoo Finance market data fetcher

use super::{MarketDataFetcher, RawMarketData, StagePayload, StageResult, StageSuccess};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result, StageError};
use crate::subject::Subject;
use async_trait::async_trait;
use cached::{Cached, TimedCache};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};
use yahoo_finance_api as yahoo;

type SharedRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// Bars requested per fetch
const RANGE: &str = "5d";
const INTERVAL: &str = "1d";

/// A bar younger than this means the exchange is trading
const OPEN_WINDOW_MINUTES: i64 = 15;

/// Fetch stage over the public Yahoo Finance chart API
///
/// Responses are cached per ticker for the configured TTL and requests are
/// throttled by a shared quota. No usage report is produced.
pub struct YahooMarketDataFetcher {
    cache: Arc<RwLock<TimedCache<String, RawMarketData>>>,
    rate_limiter: SharedRateLimiter,
}

impl YahooMarketDataFetcher {
    /// Create a fetcher using the market settings of `config`
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let per_minute = NonZeroU32::new(config.market_requests_per_minute).ok_or_else(|| {
            PipelineError::Config("market_requests_per_minute must be greater than 0".to_string())
        })?;

        Ok(Self {
            cache: Arc::new(RwLock::new(TimedCache::with_lifespan(config.market_cache_ttl))),
            rate_limiter: Arc::new(RateLimiter::direct(Quota::per_minute(per_minute))),
        })
    }

    async fn cached(&self, symbol: &str) -> Option<RawMarketData> {
        let mut cache = self.cache.write().await;
        cache.cache_get(symbol).cloned()
    }

    async fn store(&self, data: RawMarketData) {
        let mut cache = self.cache.write().await;
        let _ = cache.cache_set(data.symbol.clone(), data);
    }

    async fn load(&self, symbol: &str) -> std::result::Result<RawMarketData, StageError> {
        self.rate_limiter.until_ready().await;

        let provider = yahoo::YahooConnector::new().map_err(|e| StageError::remote(e.to_string()))?;
        let response = provider
            .get_quote_range(symbol, INTERVAL, RANGE)
            .await
            .map_err(|e| StageError::remote(e.to_string()))?;
        let quotes = response
            .quotes()
            .map_err(|e| StageError::malformed(e.to_string()))?;

        let (latest, earlier) = quotes
            .split_last()
            .ok_or_else(|| StageError::malformed(format!("no quotes returned for {symbol}")))?;

        let previous = earlier.last();
        let as_of = DateTime::from_timestamp(latest.timestamp as i64, 0).ok_or_else(|| {
            StageError::malformed(format!("invalid quote timestamp {}", latest.timestamp))
        })?;

        Ok(RawMarketData {
            symbol: symbol.to_string(),
            price: latest.close,
            open: latest.open,
            high: latest.high,
            low: latest.low,
            previous_close: previous.map(|q| q.close),
            previous_high: previous.map(|q| q.high),
            previous_low: previous.map(|q| q.low),
            volume: latest.volume,
            market_status: market_status(as_of, Utc::now()).to_string(),
            as_of,
        })
    }
}

/// `OPEN` when the latest bar is fresh, `CLOSED` otherwise
pub fn market_status(as_of: DateTime<Utc>, now: DateTime<Utc>) -> &'static str {
    if now - as_of < ChronoDuration::minutes(OPEN_WINDOW_MINUTES) {
        "OPEN"
    } else {
        "CLOSED"
    }
}

#[async_trait]
impl MarketDataFetcher for YahooMarketDataFetcher {
    #[instrument(skip(self), fields(subject = %subject))]
    async fn fetch(&self, subject: &Subject) -> StageResult<RawMarketData> {
        if let Some(data) = self.cached(subject.as_str()).await {
            debug!("Market data cache hit");
            return Ok(StageSuccess::new(data));
        }

        let data = self.load(subject.as_str()).await?;
        data.validate()?;
        self.store(data.clone()).await;
        Ok(StageSuccess::new(data))
    }
}
