//! Currency normalization into the reporting currency.
//!
//! Exchange rates are cached per currency pair with the same lazy windowed
//! fetch and backward search as prices, but in a cache of their own. When a
//! direct pair is not quoted, the rate is built in two steps through USD.

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::marketdata::provider::{fetch_with_retry, FetchError, MarketDataProvider};
use crate::marketdata::series::DatedSeries;

const PENCE_PER_POUND: Decimal = Decimal::ONE_HUNDRED;

/// Converts amounts into the run's reporting currency
pub struct CurrencyNormalizer {
    provider: Arc<dyn MarketDataProvider>,
    rates: Mutex<HashMap<(String, String), DatedSeries>>,
    config: EngineConfig,
}

impl CurrencyNormalizer {
    pub fn new(provider: Arc<dyn MarketDataProvider>, config: EngineConfig) -> Self {
        Self {
            provider,
            rates: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn reporting_currency(&self) -> &str {
        &self.config.reporting_currency
    }

    /// Convert `amount` denominated in `currency` into the reporting
    /// currency as of `date`. Amounts already in the reporting currency
    /// pass through without touching the rate cache; pence amounts are
    /// rescaled to pounds before the currency comparison.
    pub fn to_reporting(
        &self,
        amount: Decimal,
        currency: &str,
        date: NaiveDate,
    ) -> Result<Decimal> {
        let (amount, currency) = if currency == "GBp" {
            (amount / PENCE_PER_POUND, "GBP")
        } else {
            (amount, currency)
        };

        if currency == self.config.reporting_currency {
            return Ok(amount);
        }

        let rate = self.rate_on(currency, &self.config.reporting_currency, date)?;
        Ok(amount * rate)
    }

    /// Exchange rate from `from` to `to` on `date`, with backward search
    /// over unquoted days. Falls back to a two-step conversion through USD
    /// when the direct pair yields nothing.
    pub fn rate_on(&self, from: &str, to: &str, date: NaiveDate) -> Result<Decimal> {
        if from == to {
            return Ok(Decimal::ONE);
        }

        match self.direct_rate_on(from, to, date) {
            Ok(rate) => Ok(rate),
            Err(err) if from != "USD" && to != "USD" => {
                debug!(
                    "No direct {}->{} rate on {} ({}), converting through USD",
                    from, to, date, err
                );
                let to_usd = self.direct_rate_on(from, "USD", date)?;
                let usd_to = self.direct_rate_on("USD", to, date)?;
                Ok(to_usd * usd_to)
            }
            Err(err) => Err(err),
        }
    }

    fn direct_rate_on(&self, from: &str, to: &str, date: NaiveDate) -> Result<Decimal> {
        let window_start = date - Duration::days(self.config.lookback_buffer_days);
        self.ensure_range(from, to, window_start, date)?;

        let horizon = self.config.backward_search_horizon_days;
        let pair_name = format!("{}/{}", from, to);
        let cache = self.rates.lock().unwrap();
        let series = cache
            .get(&(from.to_string(), to.to_string()))
            .ok_or_else(|| EngineError::unavailable("exchange rate", &pair_name, date, horizon))?;

        match series.value_on_or_before(date, horizon) {
            Some((found, rate)) => {
                if found != date {
                    debug!(
                        "No {} rate on {}, using prior quote from {}",
                        pair_name, date, found
                    );
                }
                Ok(rate)
            }
            None => Err(EngineError::unavailable(
                "exchange rate",
                pair_name,
                date,
                horizon,
            )),
        }
    }

    fn ensure_range(&self, from: &str, to: &str, start: NaiveDate, end: NaiveDate) -> Result<()> {
        let key = (from.to_string(), to.to_string());
        {
            let cache = self.rates.lock().unwrap();
            if let Some(series) = cache.get(&key) {
                if series.covers(start, end) {
                    return Ok(());
                }
            }
        }

        let pair_name = format!("{}/{}", from, to);
        let fetched = fetch_with_retry(
            &pair_name,
            self.config.fetch_retry_attempts,
            self.config.fetch_retry_base_ms,
            || self.provider.fetch_rates(from, to, start, end),
        )
        .map_err(|err| match err {
            FetchError::UnknownSymbol(_) => EngineError::unavailable(
                "exchange rate",
                &pair_name,
                end,
                self.config.backward_search_horizon_days,
            ),
            FetchError::Transient(cause) => {
                warn!("Giving up on {} rate fetch: {}", pair_name, cause);
                EngineError::unavailable(
                    "exchange rate",
                    &pair_name,
                    end,
                    self.config.backward_search_horizon_days,
                )
            }
        })?;

        let points = fetched.into_iter().map(|p| (p.date, p.value));
        let mut cache = self.rates.lock().unwrap();
        cache
            .entry(key)
            .or_default()
            .merge_window(start, end, points, vec![]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketdata::provider::ProviderPoint;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Quotes only the pairs it is given, every calendar day
    struct PairProvider {
        pairs: Vec<(&'static str, &'static str, Decimal)>,
    }

    impl MarketDataProvider for PairProvider {
        fn fetch_prices(
            &self,
            _identity: &str,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> std::result::Result<Vec<ProviderPoint>, FetchError> {
            Ok(vec![])
        }

        fn fetch_rates(
            &self,
            from: &str,
            to: &str,
            start: NaiveDate,
            end: NaiveDate,
        ) -> std::result::Result<Vec<ProviderPoint>, FetchError> {
            let Some((_, _, rate)) = self
                .pairs
                .iter()
                .find(|(f, t, _)| *f == from && *t == to)
            else {
                return Ok(vec![]);
            };
            let mut points = Vec::new();
            let mut day = start;
            while day <= end {
                points.push(ProviderPoint {
                    date: day,
                    value: *rate,
                    currency: None,
                });
                day += Duration::days(1);
            }
            Ok(points)
        }
    }

    fn normalizer(pairs: Vec<(&'static str, &'static str, Decimal)>) -> CurrencyNormalizer {
        CurrencyNormalizer::new(Arc::new(PairProvider { pairs }), EngineConfig::default())
    }

    #[test]
    fn test_reporting_currency_passes_through() {
        // No pairs quoted at all; a GBP amount must still convert
        let fx = normalizer(vec![]);
        let result = fx.to_reporting(dec!(150), "GBP", date(2023, 5, 1)).unwrap();
        assert_eq!(result, dec!(150));
    }

    #[test]
    fn test_pence_rescaled_before_comparison() {
        let fx = normalizer(vec![]);
        let result = fx.to_reporting(dec!(450), "GBp", date(2023, 5, 1)).unwrap();
        assert_eq!(result, dec!(4.50));
    }

    #[test]
    fn test_direct_pair_conversion() {
        let fx = normalizer(vec![("USD", "GBP", dec!(0.8))]);
        let result = fx.to_reporting(dec!(100), "USD", date(2023, 5, 1)).unwrap();
        assert_eq!(result, dec!(80.0));
    }

    #[test]
    fn test_two_step_conversion_through_usd() {
        // EUR/GBP is not quoted directly; EUR->USD and USD->GBP are
        let fx = normalizer(vec![("EUR", "USD", dec!(1.1)), ("USD", "GBP", dec!(0.8))]);
        let result = fx.to_reporting(dec!(100), "EUR", date(2023, 5, 1)).unwrap();
        assert_eq!(result, dec!(88.00));
    }

    #[test]
    fn test_unquoted_pair_is_unavailable() {
        let fx = normalizer(vec![]);
        let err = fx
            .to_reporting(dec!(100), "JPY", date(2023, 5, 1))
            .unwrap_err();
        assert!(matches!(err, EngineError::DataUnavailable { .. }));
    }

    #[test]
    fn test_identical_pair_is_unity() {
        let fx = normalizer(vec![]);
        assert_eq!(
            fx.rate_on("USD", "USD", date(2023, 5, 1)).unwrap(),
            Decimal::ONE
        );
    }
}
