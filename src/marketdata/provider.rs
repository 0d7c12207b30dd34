//! Provider abstraction and the retry policy at the fetch boundary.
//!
//! The engine depends only on this trait: given a symbol and a date range,
//! return a sequence of dated values. Transient failures are retried with
//! bounded exponential backoff; a definitive "unknown symbol" response is
//! never retried.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// One dated value from a provider, with the provider's claimed currency
/// (None for exchange rates, which are dimensionless pair quotes)
#[derive(Debug, Clone)]
pub struct ProviderPoint {
    pub date: NaiveDate,
    pub value: Decimal,
    pub currency: Option<String>,
}

#[derive(Error, Debug)]
pub enum FetchError {
    /// The provider definitively does not know this symbol. Not retried.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    /// Network trouble, rate limiting, malformed payload. Retried with
    /// backoff up to the configured attempt cap.
    #[error("transient fetch failure: {0}")]
    Transient(#[from] anyhow::Error),
}

/// Fetch-by-symbol-and-date-range capability. Implementations hold no
/// engine logic; cleaning and caching happen on the engine side.
pub trait MarketDataProvider: Send + Sync {
    /// Historical prices for an instrument over [start, end], inclusive
    fn fetch_prices(
        &self,
        identity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ProviderPoint>, FetchError>;

    /// Historical exchange rates for a currency pair over [start, end]
    fn fetch_rates(
        &self,
        from_currency: &str,
        to_currency: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ProviderPoint>, FetchError>;
}

/// Run `op` up to `attempts` times, sleeping `base_ms * 2^n` between tries.
/// UnknownSymbol short-circuits immediately.
pub fn fetch_with_retry<T>(
    what: &str,
    attempts: u32,
    base_ms: u64,
    mut op: impl FnMut() -> Result<T, FetchError>,
) -> Result<T, FetchError> {
    let mut last_err = None;
    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            let delay = base_ms.saturating_mul(1 << (attempt - 1));
            std::thread::sleep(Duration::from_millis(delay));
        }
        match op() {
            Ok(value) => return Ok(value),
            Err(FetchError::UnknownSymbol(symbol)) => {
                return Err(FetchError::UnknownSymbol(symbol));
            }
            Err(err) => {
                warn!(
                    "Fetch attempt {}/{} for {} failed: {}",
                    attempt + 1,
                    attempts.max(1),
                    what,
                    err
                );
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| {
        FetchError::Transient(anyhow::anyhow!("no fetch attempts were made"))
    }))
}
