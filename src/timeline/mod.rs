//! Transaction timeline: the ordered, immutable event stream one analysis
//! run is built from.
//!
//! Events arrive from the parsing layer already normalized (typed fields,
//! one record per trade or corporate action). This module owns their total
//! ordering: by date, with corporate actions applied before same-day trades
//! (splits first, then renames/conversions, then mergers) and declaration
//! order breaking remaining ties.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Tax wrapper / account bucket a trade settled in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountCategory {
    Isa,
    Taxable,
    Pension,
    Other,
}

/// What a merger pays the holders of the acquired instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Consideration {
    /// Shares of the acquirer, `ratio` new units per old unit
    Shares { acquirer: String, ratio: Decimal },
    /// Cash per old unit, in the event's currency
    Cash { per_unit: Decimal },
}

/// Closed set of event kinds. Adding a corporate-action kind is a
/// compile-checked variant addition; the resolver and holdings calculator
/// match exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    Buy,
    Sell,
    Transfer,
    /// `ratio` new units per old unit (2 for a 2:1 split, 0.1 for a 10:1
    /// reverse split)
    Split { ratio: Decimal },
    /// Pure identity change, quantity unchanged
    Rename { new_identity: String },
    /// Fund-class or similar conversion: new identity and a unit ratio
    Convert { new_identity: String, ratio: Decimal },
    /// The event's identity is the acquired instrument, retired at the
    /// effective date
    Merge { consideration: Consideration },
}

impl EventKind {
    pub fn is_trade(&self) -> bool {
        matches!(self, EventKind::Buy | EventKind::Sell | EventKind::Transfer)
    }

    pub fn is_corporate_action(&self) -> bool {
        !self.is_trade()
    }

    /// Same-day application rank: splits before renames/conversions before
    /// mergers, trades last (a trade dated on an action's effective date is
    /// already in post-action units).
    fn same_day_rank(&self) -> u8 {
        match self {
            EventKind::Split { .. } => 0,
            EventKind::Rename { .. } | EventKind::Convert { .. } => 1,
            EventKind::Merge { .. } => 2,
            EventKind::Buy | EventKind::Sell | EventKind::Transfer => 3,
        }
    }
}

/// One normalized record from the parsing layer. Immutable once constructed.
///
/// `quantity` is a signed unit delta: positive for buys and inbound
/// transfers, negative for sells and outbound transfers. Pure corporate
/// actions carry a zero delta and no price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    /// Ticker as recorded at event time; may differ from the instrument's
    /// identity at query time after renames or conversions
    pub identity: String,
    pub kind: EventKind,
    pub date: NaiveDate,
    pub quantity: Decimal,
    /// Unit price in `currency`; None for pure corporate actions
    pub price: Option<Decimal>,
    pub currency: String,
    pub category: AccountCategory,
    pub tag: Option<String>,
}

impl TransactionEvent {
    /// Signed cash flow of this event from the investor's point of view:
    /// buys are outflows, sells inflows, transfers carry their recorded
    /// sign, corporate actions are zero-flow (cash mergers are realized by
    /// the valuation engine, which knows the retired quantity).
    pub fn cash_flow(&self) -> Option<(NaiveDate, Decimal)> {
        let price = self.price?;
        match self.kind {
            EventKind::Buy | EventKind::Sell => Some((self.date, -(self.quantity * price))),
            EventKind::Transfer => Some((self.date, self.quantity * price)),
            _ => None,
        }
    }

    /// Gross amount of a trade (always non-negative)
    pub fn gross_amount(&self) -> Decimal {
        (self.quantity * self.price.unwrap_or(Decimal::ZERO)).abs()
    }
}

/// The run's event stream, sorted once at construction and never mutated.
#[derive(Debug, Clone)]
pub struct Timeline {
    events: Vec<TransactionEvent>,
}

impl Timeline {
    /// Sort events into the canonical total order. The sort is stable, so
    /// same-day events of equal rank keep their declaration order.
    pub fn new(mut events: Vec<TransactionEvent>) -> Self {
        events.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then(a.kind.same_day_rank().cmp(&b.kind.same_day_rank()))
        });
        Self { events }
    }

    pub fn events(&self) -> &[TransactionEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Raw identities that appear on trade events (the recorded names, not
    /// the canonical ones)
    pub fn traded_identities(&self) -> BTreeSet<String> {
        self.events
            .iter()
            .filter(|e| e.kind.is_trade())
            .map(|e| e.identity.clone())
            .collect()
    }

    /// Date of the first event, if any
    pub fn first_date(&self) -> Option<NaiveDate> {
        self.events.first().map(|e| e.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.events.last().map(|e| e.date)
    }
}
