//! Market data layer: provider-backed price cache with cleaning and
//! bounded backward search.
//!
//! Prices are fetched lazily per instrument the first time a date is queried,
//! with a lookback buffer so that weekend and holiday queries resolve from the
//! same window. Fetched windows are cleaned on ingest and merged into a
//! run-scoped cache that only ever grows.

pub mod cleaning;
pub mod provider;
pub mod series;
pub mod yahoo;

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use provider::{fetch_with_retry, FetchError, MarketDataProvider};
use series::{Anomaly, DatedSeries};

/// Run-scoped price cache over a market data provider
pub struct MarketData {
    provider: Arc<dyn MarketDataProvider>,
    prices: Mutex<HashMap<String, DatedSeries>>,
    config: EngineConfig,
}

impl MarketData {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: EngineConfig) -> Self {
        Self {
            provider,
            prices: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Price of `identity` on `date`, searching backward over non-trading
    /// days up to the configured horizon. Returns the value and its native
    /// currency after cleaning (pence series come back in pounds).
    pub fn price_on(&self, identity: &str, date: NaiveDate) -> Result<(Decimal, String)> {
        let window_start = date - Duration::days(self.config.lookback_buffer_days);
        self.ensure_range(identity, window_start, date)?;

        let horizon = self.config.backward_search_horizon_days;
        let cache = self.prices.lock().unwrap();
        let series = cache
            .get(identity)
            .ok_or_else(|| EngineError::unavailable("price", identity, date, horizon))?;

        match series.value_on_or_before(date, horizon) {
            Some((found, value)) => {
                if found != date {
                    debug!(
                        "No {} price on {}, using prior trading day {}",
                        identity, date, found
                    );
                }
                let currency = series
                    .currency
                    .clone()
                    .unwrap_or_else(|| self.config.reporting_currency.clone());
                Ok((value, currency))
            }
            None => Err(EngineError::unavailable("price", identity, date, horizon)),
        }
    }

    /// Fetch wide windows for a set of instruments up front so that the
    /// per-date queries of a valuation run hit the cache. Per-symbol
    /// failures are logged and deferred to the point-query that needs them.
    pub fn prefetch(&self, identities: &[String], start: NaiveDate, end: NaiveDate) {
        let window_start = start - Duration::days(self.config.lookback_buffer_days);
        for identity in identities {
            if let Err(err) = self.ensure_range(identity, window_start, end) {
                warn!("Prefetch for {} failed: {}", identity, err);
            }
        }
    }

    /// Cleaned points for `identity` within [start, end], fetching the
    /// range if needed. Used by the trailing-window metrics.
    pub fn price_window(
        &self,
        identity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<(NaiveDate, Decimal)>> {
        self.ensure_range(identity, start, end)?;
        let cache = self.prices.lock().unwrap();
        Ok(cache
            .get(identity)
            .map(|s| s.window(start, end))
            .unwrap_or_default())
    }

    /// Anomalies flagged while cleaning windows for `identity`
    pub fn anomalies(&self, identity: &str) -> Vec<Anomaly> {
        let cache = self.prices.lock().unwrap();
        cache
            .get(identity)
            .map(|s| s.anomalies().to_vec())
            .unwrap_or_default()
    }

    fn ensure_range(&self, identity: &str, start: NaiveDate, end: NaiveDate) -> Result<()> {
        {
            let cache = self.prices.lock().unwrap();
            if let Some(series) = cache.get(identity) {
                if series.covers(start, end) {
                    return Ok(());
                }
            }
        }

        let fetched = fetch_with_retry(
            identity,
            self.config.fetch_retry_attempts,
            self.config.fetch_retry_base_ms,
            || self.provider.fetch_prices(identity, start, end),
        )
        .map_err(|err| match err {
            FetchError::UnknownSymbol(symbol) => EngineError::NotFound(symbol),
            FetchError::Transient(cause) => {
                warn!("Giving up on {} window fetch: {}", identity, cause);
                EngineError::unavailable(
                    "price",
                    identity,
                    end,
                    self.config.backward_search_horizon_days,
                )
            }
        })?;

        let mut currency = fetched.iter().find_map(|p| p.currency.clone());
        let mut points: Vec<(NaiveDate, Decimal)> =
            fetched.into_iter().map(|p| (p.date, p.value)).collect();
        points.sort_by_key(|(date, _)| *date);
        points.dedup_by_key(|(date, _)| *date);

        let anomalies = cleaning::clean_window(identity, &mut points, &mut currency, &self.config);

        let mut cache = self.prices.lock().unwrap();
        let series = cache.entry(identity.to_string()).or_default();
        if series.currency.is_none() {
            series.currency = currency;
        }
        series.merge_window(start, end, points, anomalies);
        Ok(())
    }
}
