//! Valuation engine: position and portfolio values in the reporting
//! currency, cashflow assembly and money-weighted returns.
//!
//! Composes the holdings calculator with the price cache and currency
//! normalizer. A fully-sold position values to exactly zero without
//! touching market data; an unpriceable position inside a portfolio query
//! becomes an explicit gap rather than poisoning the total.

pub mod metrics;
pub mod returns;

use chrono::{Duration, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::fx::CurrencyNormalizer;
use crate::holdings::{HoldingsCalculator, HoldingsFilter};
use crate::marketdata::provider::MarketDataProvider;
use crate::marketdata::MarketData;
use crate::timeline::{Consideration, EventKind, Timeline};
use metrics::WindowMetrics;

/// Trailing window for per-instrument high/volatility metrics
const METRICS_WINDOW_DAYS: i64 = 90;

/// One priced position inside a portfolio valuation
#[derive(Debug, Clone)]
pub struct PositionValue {
    pub identity: String,
    pub quantity: Decimal,
    /// Unit price in the instrument's native currency after cleaning
    pub unit_price: Decimal,
    pub price_currency: String,
    /// Position value in the reporting currency
    pub value: Decimal,
}

/// A held position that could not be priced for this valuation
#[derive(Debug, Clone)]
pub struct ValuationGap {
    pub identity: String,
    pub quantity: Decimal,
    pub reason: String,
}

/// Portfolio snapshot: valued positions, explicit gaps, and the total over
/// the valued subset
#[derive(Debug, Clone)]
pub struct PortfolioValuation {
    pub date: NaiveDate,
    pub total: Decimal,
    pub positions: Vec<PositionValue>,
    pub gaps: Vec<ValuationGap>,
}

/// Top-level engine for one analysis run
pub struct ValuationEngine {
    holdings: HoldingsCalculator,
    market: MarketData,
    fx: CurrencyNormalizer,
    config: EngineConfig,
}

impl ValuationEngine {
    /// Build the engine for one run. Resolves corporate actions and
    /// validates the timeline up front; construction fails on inconsistent
    /// input rather than deferring the error to the first query.
    pub fn new(
        timeline: Timeline,
        provider: Arc<dyn MarketDataProvider>,
        config: EngineConfig,
    ) -> Result<Self> {
        let holdings = HoldingsCalculator::new(timeline)?;
        let market = MarketData::new(provider.clone(), config.clone());
        let fx = CurrencyNormalizer::new(provider, config.clone());
        Ok(Self {
            holdings,
            market,
            fx,
            config,
        })
    }

    pub fn holdings(&self) -> &HoldingsCalculator {
        &self.holdings
    }

    pub fn market(&self) -> &MarketData {
        &self.market
    }

    pub fn fx(&self) -> &CurrencyNormalizer {
        &self.fx
    }

    /// Value of one position on `date` in the reporting currency. A
    /// quantity of zero values to exactly zero whether or not a price is
    /// obtainable.
    pub fn value_at(&self, identity: &str, date: NaiveDate) -> Result<Decimal> {
        let quantity = self.holdings.quantity_at(identity, date)?;
        if quantity.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let canonical = self
            .holdings
            .resolver()
            .canonical_identity_at(identity, date)?;
        let (price, currency) = self.market.price_on(&canonical, date)?;
        self.fx.to_reporting(quantity * price, &currency, date)
    }

    /// Portfolio snapshot on `date`. Positions that cannot be priced are
    /// reported as gaps; the total covers the valued subset only.
    pub fn portfolio_value_at(
        &self,
        date: NaiveDate,
        filter: &HoldingsFilter,
    ) -> Result<PortfolioValuation> {
        let held = self.holdings.held_set_at_filtered(date, filter)?;
        let mut valuation = PortfolioValuation {
            date,
            total: Decimal::ZERO,
            positions: Vec::new(),
            gaps: Vec::new(),
        };

        for (identity, quantity) in held {
            match self.price_position(&identity, quantity, date) {
                Ok(position) => {
                    valuation.total += position.value;
                    valuation.positions.push(position);
                }
                Err(
                    err @ (EngineError::NotFound(_) | EngineError::DataUnavailable { .. }),
                ) => {
                    debug!("Valuation gap for {} on {}: {}", identity, date, err);
                    valuation.gaps.push(ValuationGap {
                        identity,
                        quantity,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(err),
            }
        }

        info!(
            "Portfolio on {}: {} {} across {} positions ({} gaps)",
            date,
            valuation.total,
            self.config.reporting_currency,
            valuation.positions.len(),
            valuation.gaps.len()
        );
        Ok(valuation)
    }

    /// The dated, signed reporting-currency flows of the (filtered)
    /// portfolio over [start, end]: synthetic opening purchases, trades,
    /// cash-merger proceeds, synthetic closing sales. This is the series
    /// the money-weighted return is solved on.
    pub fn cashflow_timeline(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        filter: &HoldingsFilter,
    ) -> Result<Vec<(NaiveDate, f64)>> {
        self.flows_between(None, start, end, filter)
    }

    /// Money-weighted annualized return of the (filtered) portfolio over
    /// [start, end]. None when no rate is defined for the window's flows.
    pub fn money_weighted_return(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        filter: &HoldingsFilter,
    ) -> Result<Option<f64>> {
        let flows = self.cashflow_timeline(start, end, filter)?;
        returns::xirr(&flows)
    }

    /// Money-weighted annualized return of a single instrument over
    /// [start, end], including every recorded identity that resolves to it.
    pub fn instrument_return(
        &self,
        identity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Option<f64>> {
        let canonical = self
            .holdings
            .resolver()
            .canonical_identity_at(identity, end)?;
        let flows =
            self.flows_between(Some(&canonical), start, end, &HoldingsFilter::default())?;
        returns::xirr(&flows)
    }

    /// Trailing high and annualized volatility over the metrics window
    /// ending on `date`
    pub fn window_metrics_at(&self, identity: &str, date: NaiveDate) -> Result<WindowMetrics> {
        let canonical = self
            .holdings
            .resolver()
            .canonical_identity_at(identity, date)?;
        let points = self.market.price_window(
            &canonical,
            date - Duration::days(METRICS_WINDOW_DAYS),
            date,
        )?;
        Ok(metrics::window_metrics(&points))
    }

    /// Warm the price cache for everything held or traded in [start, end]
    pub fn prefetch(&self, start: NaiveDate, end: NaiveDate) -> Result<()> {
        let identities: Vec<String> = self
            .holdings
            .instruments_held_during(start, end)?
            .into_iter()
            .collect();
        info!(
            "Prefetching {} instruments for {} to {}",
            identities.len(),
            start,
            end
        );
        self.market.prefetch(&identities, start, end);
        Ok(())
    }

    fn price_position(
        &self,
        identity: &str,
        quantity: Decimal,
        date: NaiveDate,
    ) -> Result<PositionValue> {
        let (price, currency) = self.market.price_on(identity, date)?;
        let value = self.fx.to_reporting(quantity * price, &currency, date)?;
        Ok(PositionValue {
            identity: identity.to_string(),
            quantity,
            unit_price: price,
            price_currency: currency,
            value,
        })
    }

    /// Currency of the cash consideration declared for `acquired` on
    /// `effective`, if that merge event exists
    fn cash_merger_currency(&self, acquired: &str, effective: NaiveDate) -> Option<&str> {
        self.holdings.timeline().events().iter().find_map(|e| {
            match &e.kind {
                EventKind::Merge {
                    consideration: Consideration::Cash { .. },
                } if e.identity == acquired && e.date == effective => Some(e.currency.as_str()),
                _ => None,
            }
        })
    }

    /// Assemble the signed reporting-currency flows the return solve runs
    /// on: a synthetic opening purchase for anything already held going
    /// into the window, the window's trades and cash-merger proceeds, and
    /// a synthetic closing sale for anything still held at the end.
    fn flows_between(
        &self,
        scope: Option<&str>,
        start: NaiveDate,
        end: NaiveDate,
        filter: &HoldingsFilter,
    ) -> Result<Vec<(NaiveDate, f64)>> {
        let day_before = start - Duration::days(1);
        let resolver = self.holdings.resolver();
        let mut flows: Vec<(NaiveDate, f64)> = Vec::new();

        // Opening positions: treated as bought at the window start for
        // their value on that date
        for (identity, quantity) in self.holdings.held_set_at_filtered(day_before, filter)? {
            if let Some(target) = scope {
                if resolver.canonical_identity_at(&identity, end)? != target {
                    continue;
                }
            }
            let (price, currency) = self.market.price_on(&identity, start)?;
            let value = self.fx.to_reporting(quantity * price, &currency, start)?;
            flows.push((start, -value.to_f64().unwrap_or(0.0)));
        }

        // Trades inside the window, at their recorded prices
        for event in self.holdings.timeline().events() {
            if !event.kind.is_trade() || !filter.matches(event) {
                continue;
            }
            if event.date < start || event.date > end {
                continue;
            }
            if let Some(target) = scope {
                if resolver.chain(&event.identity)?.identity_at(end) != target {
                    continue;
                }
            }
            if let Some((date, amount)) = event.cash_flow() {
                let converted = self.fx.to_reporting(amount, &event.currency, date)?;
                flows.push((date, converted.to_f64().unwrap_or(0.0)));
            }
        }

        // Cash mergers realize the retired position as an inflow on the
        // effective date. Signed event quantities make sells net out.
        for event in self.holdings.timeline().events() {
            if !event.kind.is_trade() || !filter.matches(event) || event.date > end {
                continue;
            }
            let chain = resolver.chain(&event.identity)?;
            if let Some(target) = scope {
                if chain.identity_at(end) != target {
                    continue;
                }
            }
            if let Some((when, factor, per_unit)) =
                chain.cash_retirement_between(event.date, end, resolver.actions())
            {
                if when < start {
                    continue;
                }
                let amount = event.quantity * factor * per_unit;
                // The per-unit cash is denominated in the merge event's
                // currency, not the originating trade's
                let currency = self
                    .cash_merger_currency(chain.identity_at(when), when)
                    .unwrap_or(event.currency.as_str());
                let converted = self.fx.to_reporting(amount, currency, when)?;
                flows.push((when, converted.to_f64().unwrap_or(0.0)));
            }
        }

        // Closing positions: treated as sold at the window end
        for (identity, quantity) in self.holdings.held_set_at_filtered(end, filter)? {
            if let Some(target) = scope {
                if identity != target {
                    continue;
                }
            }
            let (price, currency) = self.market.price_on(&identity, end)?;
            let value = self.fx.to_reporting(quantity * price, &currency, end)?;
            flows.push((end, value.to_f64().unwrap_or(0.0)));
        }

        flows.sort_by_key(|(date, _)| *date);
        debug!(
            "Assembled {} flows for {:?} between {} and {}",
            flows.len(),
            scope.unwrap_or("portfolio"),
            start,
            end
        );
        Ok(flows)
    }
}
