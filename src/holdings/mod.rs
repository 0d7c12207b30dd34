//! Holdings calculation
//!
//! Answers "how many units of X did I hold on day D" by partitioning the
//! timeline by canonical identity, filtering events dated on or before the
//! query date, summing signed quantity deltas and scaling each by the
//! adjustment chain's multiplier between its recorded date and the query
//! date. Pure functions of (timeline, date): repeated calls within a run
//! always agree.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::actions::ActionResolver;
use crate::error::{EngineError, Result};
use crate::timeline::{AccountCategory, EventKind, Timeline, TransactionEvent};

/// Restricts portfolio-level queries to a subset of the timeline. Corporate
/// actions always apply; the filter narrows trades only.
#[derive(Debug, Clone, Default)]
pub struct HoldingsFilter {
    pub categories: Option<Vec<AccountCategory>>,
    pub include_tags: Option<Vec<String>>,
    pub exclude_tags: Option<Vec<String>>,
}

impl HoldingsFilter {
    pub fn matches(&self, event: &TransactionEvent) -> bool {
        if !event.kind.is_trade() {
            return true;
        }
        if let Some(categories) = &self.categories {
            if !categories.contains(&event.category) {
                return false;
            }
        }
        if let Some(include) = &self.include_tags {
            let tag = event.tag.as_deref().unwrap_or("");
            if !include.iter().any(|t| tag.contains(t.as_str())) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude_tags {
            if let Some(tag) = event.tag.as_deref() {
                if exclude.iter().any(|t| tag.contains(t.as_str())) {
                    return false;
                }
            }
        }
        true
    }
}

/// Aggregates for one position through a date, in conversion-adjusted units
#[derive(Debug, Clone)]
pub struct PositionSummary {
    pub identity: String,
    pub units_held: Decimal,
    pub total_invested: Decimal,
    pub total_received: Decimal,
    pub cost_basis: Decimal,
    pub conversion_ratio: Decimal,
}

/// Quantity queries over the resolved timeline
#[derive(Debug)]
pub struct HoldingsCalculator {
    timeline: Timeline,
    resolver: ActionResolver,
}

impl HoldingsCalculator {
    /// Resolve corporate actions and validate the timeline's referential
    /// consistency. A sell that oversells the position held at its date
    /// aborts the run.
    pub fn new(timeline: Timeline) -> Result<Self> {
        let resolver = ActionResolver::resolve(&timeline)?;
        let calculator = Self { timeline, resolver };
        calculator.validate()?;
        Ok(calculator)
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn resolver(&self) -> &ActionResolver {
        &self.resolver
    }

    /// Units of `identity` held at end of day `date`, in the units current
    /// at `date`. Zero is a meaningful answer (fully sold); an identity the
    /// run has never seen is a not-found error instead.
    pub fn quantity_at(&self, identity: &str, date: NaiveDate) -> Result<Decimal> {
        self.quantity_at_filtered(identity, date, &HoldingsFilter::default())
    }

    pub fn quantity_at_filtered(
        &self,
        identity: &str,
        date: NaiveDate,
        filter: &HoldingsFilter,
    ) -> Result<Decimal> {
        let canonical = self.resolver.canonical_identity_at(identity, date)?;
        let mut quantity = Decimal::ZERO;

        for event in self.trade_events(filter) {
            if event.date > date {
                continue;
            }
            let chain = self.resolver.chain(&event.identity)?;
            if chain.identity_at(date) != canonical {
                continue;
            }
            quantity += event.quantity * chain.factor_between(event.date, date);
        }

        debug!("quantity_at({}, {}) = {}", identity, date, quantity);
        Ok(quantity)
    }

    /// Canonical identity -> quantity for everything held (nonzero) at `date`
    pub fn held_set_at(&self, date: NaiveDate) -> Result<BTreeMap<String, Decimal>> {
        self.held_set_at_filtered(date, &HoldingsFilter::default())
    }

    pub fn held_set_at_filtered(
        &self,
        date: NaiveDate,
        filter: &HoldingsFilter,
    ) -> Result<BTreeMap<String, Decimal>> {
        let mut held: BTreeMap<String, Decimal> = BTreeMap::new();

        for event in self.trade_events(filter) {
            if event.date > date {
                continue;
            }
            let chain = self.resolver.chain(&event.identity)?;
            let canonical = chain.identity_at(date).to_string();
            *held.entry(canonical).or_insert(Decimal::ZERO) +=
                event.quantity * chain.factor_between(event.date, date);
        }

        held.retain(|_, quantity| !quantity.is_zero());
        Ok(held)
    }

    /// Canonical identities with a nonzero position at any point in
    /// [start, end]: held going into the window, or traded inside it.
    pub fn instruments_held_during(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<BTreeSet<String>> {
        let mut identities: BTreeSet<String> = self.held_set_at(start)?.into_keys().collect();

        for event in self.trade_events(&HoldingsFilter::default()) {
            if event.date >= start && event.date <= end {
                let chain = self.resolver.chain(&event.identity)?;
                identities.insert(chain.identity_at(end).to_string());
            }
        }
        Ok(identities)
    }

    /// Invested/received/cost-basis aggregates for one position through
    /// `date`. Buys and inbound transfers add to invested; sells add to
    /// received; transfers adjust cost basis with their recorded sign.
    pub fn position_summary_at(&self, identity: &str, date: NaiveDate) -> Result<PositionSummary> {
        let canonical = self.resolver.canonical_identity_at(identity, date)?;
        let mut summary = PositionSummary {
            identity: canonical.clone(),
            units_held: Decimal::ZERO,
            total_invested: Decimal::ZERO,
            total_received: Decimal::ZERO,
            cost_basis: Decimal::ZERO,
            conversion_ratio: Decimal::ONE,
        };

        for event in self.trade_events(&HoldingsFilter::default()) {
            if event.date > date {
                continue;
            }
            let chain = self.resolver.chain(&event.identity)?;
            if chain.identity_at(date) != canonical {
                continue;
            }
            let factor = chain.factor_between(event.date, date);
            summary.units_held += event.quantity * factor;

            let amount = event.quantity * event.price.unwrap_or(Decimal::ZERO);
            match event.kind {
                EventKind::Buy => {
                    summary.total_invested += amount;
                    summary.cost_basis += amount;
                }
                EventKind::Sell => {
                    summary.total_received += -amount;
                }
                EventKind::Transfer => {
                    summary.total_invested += amount;
                    summary.cost_basis += amount;
                }
                _ => {}
            }
            summary.conversion_ratio = factor.max(summary.conversion_ratio);
        }

        Ok(summary)
    }

    fn trade_events<'a>(
        &'a self,
        filter: &'a HoldingsFilter,
    ) -> impl Iterator<Item = &'a TransactionEvent> {
        self.timeline
            .events()
            .iter()
            .filter(move |e| e.kind.is_trade() && filter.matches(e))
    }

    /// Replay the full timeline in order, tracking each position under its
    /// current name, and reject any point where raw cumulative quantity
    /// goes negative.
    fn validate(&self) -> Result<()> {
        let mut positions: BTreeMap<String, Decimal> = BTreeMap::new();

        for event in self.timeline.events() {
            match &event.kind {
                EventKind::Buy | EventKind::Sell | EventKind::Transfer => {
                    let quantity = positions
                        .entry(event.identity.clone())
                        .or_insert(Decimal::ZERO);
                    *quantity += event.quantity;
                    if *quantity < Decimal::ZERO {
                        return Err(EngineError::consistency(
                            &event.identity,
                            event.date,
                            format!("position oversold by {} units", quantity.abs()),
                        ));
                    }
                }
                EventKind::Split { ratio } => {
                    if let Some(quantity) = positions.get_mut(&event.identity) {
                        *quantity *= ratio;
                    }
                }
                EventKind::Rename { new_identity } => {
                    let quantity = positions
                        .remove(&event.identity)
                        .unwrap_or(Decimal::ZERO);
                    *positions.entry(new_identity.clone()).or_insert(Decimal::ZERO) += quantity;
                }
                EventKind::Convert {
                    new_identity,
                    ratio,
                } => {
                    let quantity = positions
                        .remove(&event.identity)
                        .unwrap_or(Decimal::ZERO);
                    *positions.entry(new_identity.clone()).or_insert(Decimal::ZERO) +=
                        quantity * ratio;
                }
                EventKind::Merge { consideration } => {
                    let quantity = positions
                        .remove(&event.identity)
                        .unwrap_or(Decimal::ZERO);
                    if let crate::timeline::Consideration::Shares { acquirer, ratio } =
                        consideration
                    {
                        *positions.entry(acquirer.clone()).or_insert(Decimal::ZERO) +=
                            quantity * ratio;
                    }
                    // Cash consideration: position retired, nothing carried
                }
            }
        }
        Ok(())
    }
}
