//! Corporate action resolution
//!
//! Walks the timeline's corporate-action events and builds, per recorded
//! identity, an adjustment chain: the ordered list of quantity ratios and
//! identity links (old ticker -> new ticker) in force from that identity
//! forward. A raw quantity recorded on date T and queried at date D is
//! multiplied by the product of all ratios effective in (T, D], and is
//! attributed to whatever identity the chain points at by D.
//!
//! Same-day actions apply in a fixed order: splits, then renames and
//! conversions, then mergers.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::timeline::{Consideration, EventKind, Timeline, TransactionEvent};

/// A corporate action lifted out of the timeline. Owned by the resolver,
/// never mutated after construction for a given run.
#[derive(Debug, Clone, PartialEq)]
pub enum CorporateAction {
    Split {
        identity: String,
        ratio: Decimal,
        effective: NaiveDate,
    },
    Rename {
        old: String,
        new: String,
        effective: NaiveDate,
    },
    Conversion {
        old: String,
        new: String,
        ratio: Decimal,
        effective: NaiveDate,
    },
    Merger {
        acquired: String,
        consideration: Consideration,
        effective: NaiveDate,
    },
}

impl CorporateAction {
    fn from_event(event: &TransactionEvent) -> Option<Self> {
        match &event.kind {
            EventKind::Split { ratio } => Some(CorporateAction::Split {
                identity: event.identity.clone(),
                ratio: *ratio,
                effective: event.date,
            }),
            EventKind::Rename { new_identity } => Some(CorporateAction::Rename {
                old: event.identity.clone(),
                new: new_identity.clone(),
                effective: event.date,
            }),
            EventKind::Convert {
                new_identity,
                ratio,
            } => Some(CorporateAction::Conversion {
                old: event.identity.clone(),
                new: new_identity.clone(),
                ratio: *ratio,
                effective: event.date,
            }),
            EventKind::Merge { consideration } => Some(CorporateAction::Merger {
                acquired: event.identity.clone(),
                consideration: consideration.clone(),
                effective: event.date,
            }),
            EventKind::Buy | EventKind::Sell | EventKind::Transfer => None,
        }
    }

    /// The identity this action applies to
    pub fn subject(&self) -> &str {
        match self {
            CorporateAction::Split { identity, .. } => identity,
            CorporateAction::Rename { old, .. } => old,
            CorporateAction::Conversion { old, .. } => old,
            CorporateAction::Merger { acquired, .. } => acquired,
        }
    }

    pub fn effective(&self) -> NaiveDate {
        match self {
            CorporateAction::Split { effective, .. }
            | CorporateAction::Rename { effective, .. }
            | CorporateAction::Conversion { effective, .. }
            | CorporateAction::Merger { effective, .. } => *effective,
        }
    }

    /// Identity the position carries after this action (None if unchanged)
    fn successor(&self) -> Option<&str> {
        match self {
            CorporateAction::Split { .. } => None,
            CorporateAction::Rename { new, .. } => Some(new),
            CorporateAction::Conversion { new, .. } => Some(new),
            CorporateAction::Merger { consideration, .. } => match consideration {
                Consideration::Shares { acquirer, .. } => Some(acquirer),
                // Cash mergers retire the identity without a successor
                Consideration::Cash { .. } => None,
            },
        }
    }

    /// Quantity multiplier the action applies to units recorded before it
    fn quantity_ratio(&self) -> Decimal {
        match self {
            CorporateAction::Split { ratio, .. } => *ratio,
            CorporateAction::Rename { .. } => Decimal::ONE,
            CorporateAction::Conversion { ratio, .. } => *ratio,
            CorporateAction::Merger { consideration, .. } => match consideration {
                Consideration::Shares { ratio, .. } => *ratio,
                // Cash consideration zeroes the equity position; the cash
                // leg is realized by the valuation engine
                Consideration::Cash { .. } => Decimal::ZERO,
            },
        }
    }

    /// Same-day ordering: splits before renames/conversions before mergers
    fn same_day_rank(&self) -> u8 {
        match self {
            CorporateAction::Split { .. } => 0,
            CorporateAction::Rename { .. } | CorporateAction::Conversion { .. } => 1,
            CorporateAction::Merger { .. } => 2,
        }
    }

    fn is_identity_link(&self) -> bool {
        matches!(
            self,
            CorporateAction::Rename { .. } | CorporateAction::Conversion { .. }
        )
    }
}

/// One step of an adjustment chain
#[derive(Debug, Clone, PartialEq)]
pub struct ChainStep {
    pub effective: NaiveDate,
    /// Multiplier applied to units recorded before `effective`
    pub ratio: Decimal,
    /// Identity the position trades under from `effective` onward
    pub identity_after: String,
}

/// Per recorded identity: the ordered adjustments between it and whatever
/// the position is called today.
#[derive(Debug, Clone)]
pub struct AdjustmentChain {
    origin: String,
    steps: Vec<ChainStep>,
}

impl AdjustmentChain {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }

    /// Identity this position is recorded under at `date`
    pub fn identity_at(&self, date: NaiveDate) -> &str {
        self.steps
            .iter()
            .rev()
            .find(|s| s.effective <= date)
            .map(|s| s.identity_after.as_str())
            .unwrap_or(&self.origin)
    }

    /// Cumulative multiplier for all actions effective on or before `date`
    pub fn multiplier_at(&self, date: NaiveDate) -> Decimal {
        self.steps
            .iter()
            .take_while(|s| s.effective <= date)
            .fold(Decimal::ONE, |acc, s| acc * s.ratio)
    }

    /// Multiplier converting a quantity recorded on `recorded` into units
    /// current at `query`. An action effective on the recorded date itself
    /// does not apply: a trade dated that day is already in new units.
    pub fn factor_between(&self, recorded: NaiveDate, query: NaiveDate) -> Decimal {
        self.steps
            .iter()
            .filter(|s| s.effective > recorded && s.effective <= query)
            .fold(Decimal::ONE, |acc, s| acc * s.ratio)
    }

    /// Cash realized per old unit by a cash merger effective in
    /// (recorded, query], together with the unit factor in force when the
    /// merger hit (splits between recording and retirement still scale the
    /// retired quantity).
    pub fn cash_retirement_between(
        &self,
        recorded: NaiveDate,
        query: NaiveDate,
        actions: &[CorporateAction],
    ) -> Option<(NaiveDate, Decimal, Decimal)> {
        let mut factor = Decimal::ONE;
        for step in self
            .steps
            .iter()
            .filter(|s| s.effective > recorded && s.effective <= query)
        {
            if step.ratio.is_zero() {
                // Find the matching cash merger for the per-unit amount
                let per_unit = actions.iter().find_map(|a| match a {
                    CorporateAction::Merger {
                        acquired,
                        consideration: Consideration::Cash { per_unit },
                        effective,
                    } if acquired == &step.identity_after && *effective == step.effective => {
                        Some(*per_unit)
                    }
                    _ => None,
                })?;
                return Some((step.effective, factor, per_unit));
            }
            factor *= step.ratio;
        }
        None
    }
}

/// Resolved view of the run's corporate actions: one adjustment chain per
/// identity ever recorded, plus the canonical-identity lookup.
#[derive(Debug)]
pub struct ActionResolver {
    actions: Vec<CorporateAction>,
    chains: HashMap<String, AdjustmentChain>,
}

impl ActionResolver {
    /// Build chains from the timeline's corporate-action events.
    ///
    /// Fails fast with a data-consistency error when a rename or conversion
    /// references an identity with no prior transaction history, or when the
    /// identity-link graph contains a cycle.
    pub fn resolve(timeline: &Timeline) -> Result<Self> {
        let mut actions: Vec<CorporateAction> = timeline
            .events()
            .iter()
            .filter_map(CorporateAction::from_event)
            .collect();
        actions.sort_by(|a, b| {
            a.effective()
                .cmp(&b.effective())
                .then(a.same_day_rank().cmp(&b.same_day_rank()))
        });

        validate_links_have_history(&actions, timeline)?;
        validate_acyclic(&actions)?;

        // Every name the run has seen gets a chain: recorded trade tickers,
        // action subjects, and action successors (an acquirer may never have
        // been bought directly).
        let mut identities: BTreeSet<String> = timeline.traded_identities();
        for action in &actions {
            identities.insert(action.subject().to_string());
            if let Some(successor) = action.successor() {
                identities.insert(successor.to_string());
            }
        }

        let mut chains = HashMap::new();
        for identity in identities {
            let chain = build_chain(&identity, &actions);
            if !chain.steps.is_empty() {
                debug!(
                    "Adjustment chain for {}: {} steps, current identity {}",
                    identity,
                    chain.steps.len(),
                    chain.identity_at(NaiveDate::MAX)
                );
            }
            chains.insert(identity, chain);
        }

        Ok(Self { actions, chains })
    }

    pub fn actions(&self) -> &[CorporateAction] {
        &self.actions
    }

    /// Whether `identity` was ever recorded in this run
    pub fn knows(&self, identity: &str) -> bool {
        self.chains.contains_key(identity)
    }

    pub fn chain(&self, identity: &str) -> Result<&AdjustmentChain> {
        self.chains
            .get(identity)
            .ok_or_else(|| EngineError::NotFound(identity.to_string()))
    }

    /// The identity a position recorded under `raw` trades under at `date`
    pub fn canonical_identity_at(&self, raw: &str, date: NaiveDate) -> Result<String> {
        Ok(self.chain(raw)?.identity_at(date).to_string())
    }

    /// All recorded identities that resolve to `canonical` at `date`
    pub fn recorded_identities_for(&self, canonical: &str, date: NaiveDate) -> Vec<&str> {
        self.chains
            .iter()
            .filter(|(_, chain)| chain.identity_at(date) == canonical)
            .map(|(identity, _)| identity.as_str())
            .collect()
    }
}

fn build_chain(origin: &str, actions: &[CorporateAction]) -> AdjustmentChain {
    let mut current = origin.to_string();
    let mut retired = false;
    let mut steps = Vec::new();

    for action in actions {
        if retired || action.subject() != current {
            continue;
        }
        let identity_after = action.successor().unwrap_or(&current).to_string();
        steps.push(ChainStep {
            effective: action.effective(),
            ratio: action.quantity_ratio(),
            identity_after: identity_after.clone(),
        });
        if action.quantity_ratio().is_zero() {
            retired = true;
        }
        current = identity_after;
    }

    AdjustmentChain {
        origin: origin.to_string(),
        steps,
    }
}

/// A rename or conversion must reference an identity that has either been
/// traded before its effective date or was produced by an earlier link.
fn validate_links_have_history(actions: &[CorporateAction], timeline: &Timeline) -> Result<()> {
    for (idx, action) in actions.iter().enumerate() {
        if !action.is_identity_link() {
            continue;
        }
        let subject = action.subject();
        let effective = action.effective();

        let traded_before = timeline.events().iter().any(|e| {
            e.kind.is_trade() && e.identity == subject && e.date <= effective
        });
        let produced_earlier = actions[..idx]
            .iter()
            .any(|earlier| earlier.successor() == Some(subject));

        if !traded_before && !produced_earlier {
            return Err(EngineError::consistency(
                subject,
                effective,
                "rename/conversion references an identity with no prior transaction history",
            ));
        }
    }
    Ok(())
}

/// The identity-link graph (old -> new across renames, conversions and
/// share mergers) must be acyclic.
fn validate_acyclic(actions: &[CorporateAction]) -> Result<()> {
    let mut edges: HashMap<&str, Vec<(&str, NaiveDate)>> = HashMap::new();
    for action in actions {
        if let Some(successor) = action.successor() {
            edges
                .entry(action.subject())
                .or_default()
                .push((successor, action.effective()));
        }
    }

    // Iterative DFS with an explicit in-progress set
    let mut visited: HashSet<&str> = HashSet::new();
    for start in edges.keys().copied().collect::<Vec<_>>() {
        if visited.contains(start) {
            continue;
        }
        let mut in_progress: HashSet<&str> = HashSet::new();
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        in_progress.insert(start);

        while let Some((node, next_edge)) = stack.pop() {
            let successors = edges.get(node).map(|v| v.as_slice()).unwrap_or(&[]);
            if next_edge < successors.len() {
                stack.push((node, next_edge + 1));
                let (successor, effective) = successors[next_edge];
                if in_progress.contains(successor) {
                    return Err(EngineError::consistency(
                        successor,
                        effective,
                        "identity-link cycle detected in corporate actions",
                    ));
                }
                if !visited.contains(successor) {
                    in_progress.insert(successor);
                    stack.push((successor, 0));
                }
            } else {
                in_progress.remove(node);
                visited.insert(node);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::AccountCategory;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn event(identity: &str, kind: EventKind, on: NaiveDate, qty: Decimal) -> TransactionEvent {
        TransactionEvent {
            identity: identity.to_string(),
            kind,
            date: on,
            quantity: qty,
            price: Some(dec!(5)),
            currency: "GBP".to_string(),
            category: AccountCategory::Isa,
            tag: None,
        }
    }

    fn action(identity: &str, kind: EventKind, on: NaiveDate) -> TransactionEvent {
        let mut e = event(identity, kind, on, Decimal::ZERO);
        e.price = None;
        e
    }

    #[test]
    fn test_split_factor_applies_only_to_earlier_dates() {
        let timeline = Timeline::new(vec![
            event("AAA", EventKind::Buy, date(2020, 1, 10), dec!(10)),
            action("AAA", EventKind::Split { ratio: dec!(2) }, date(2021, 6, 1)),
        ]);
        let resolver = ActionResolver::resolve(&timeline).unwrap();
        let chain = resolver.chain("AAA").unwrap();

        assert_eq!(chain.factor_between(date(2020, 1, 10), date(2021, 7, 1)), dec!(2));
        // Query before the split: unscaled
        assert_eq!(chain.factor_between(date(2020, 1, 10), date(2020, 6, 1)), dec!(1));
        // Trade dated on the effective date is already in new units
        assert_eq!(chain.factor_between(date(2021, 6, 1), date(2021, 7, 1)), dec!(1));
    }

    #[test]
    fn test_rename_links_identities() {
        let timeline = Timeline::new(vec![
            event("ASI", EventKind::Buy, date(2020, 1, 1), dec!(100)),
            action(
                "ASI",
                EventKind::Rename {
                    new_identity: "ABRDN".to_string(),
                },
                date(2021, 9, 1),
            ),
        ]);
        let resolver = ActionResolver::resolve(&timeline).unwrap();

        assert_eq!(
            resolver.canonical_identity_at("ASI", date(2021, 10, 1)).unwrap(),
            "ABRDN"
        );
        assert_eq!(
            resolver.canonical_identity_at("ASI", date(2021, 8, 1)).unwrap(),
            "ASI"
        );
        // Rename carries ratio 1
        let chain = resolver.chain("ASI").unwrap();
        assert_eq!(chain.factor_between(date(2020, 1, 1), date(2022, 1, 1)), dec!(1));
    }

    #[test]
    fn test_conversion_carries_ratio_through_chain() {
        let timeline = Timeline::new(vec![
            event("FUND.R", EventKind::Buy, date(2020, 1, 1), dec!(100)),
            action(
                "FUND.R",
                EventKind::Convert {
                    new_identity: "FUND.Z".to_string(),
                    ratio: dec!(0.5),
                },
                date(2020, 11, 24),
            ),
            action("FUND.Z", EventKind::Split { ratio: dec!(3) }, date(2021, 2, 1)),
        ]);
        let resolver = ActionResolver::resolve(&timeline).unwrap();
        let chain = resolver.chain("FUND.R").unwrap();

        // Conversion then split compose: 0.5 * 3
        assert_eq!(chain.factor_between(date(2020, 1, 1), date(2021, 3, 1)), dec!(1.5));
        assert_eq!(chain.identity_at(date(2021, 3, 1)), "FUND.Z");
    }

    #[test]
    fn test_cash_merger_zeroes_factor() {
        let timeline = Timeline::new(vec![
            event("TGT", EventKind::Buy, date(2020, 1, 1), dec!(50)),
            action(
                "TGT",
                EventKind::Merge {
                    consideration: Consideration::Cash { per_unit: dec!(12) },
                },
                date(2021, 5, 1),
            ),
        ]);
        let resolver = ActionResolver::resolve(&timeline).unwrap();
        let chain = resolver.chain("TGT").unwrap();

        assert_eq!(chain.factor_between(date(2020, 1, 1), date(2021, 6, 1)), dec!(0));
        let (when, factor, per_unit) = chain
            .cash_retirement_between(date(2020, 1, 1), date(2021, 6, 1), resolver.actions())
            .unwrap();
        assert_eq!(when, date(2021, 5, 1));
        assert_eq!(factor, dec!(1));
        assert_eq!(per_unit, dec!(12));
    }

    #[test]
    fn test_share_merger_attributes_to_acquirer() {
        let timeline = Timeline::new(vec![
            event("SMALL", EventKind::Buy, date(2020, 1, 1), dec!(40)),
            event("BIG", EventKind::Buy, date(2020, 6, 1), dec!(10)),
            action(
                "SMALL",
                EventKind::Merge {
                    consideration: Consideration::Shares {
                        acquirer: "BIG".to_string(),
                        ratio: dec!(0.25),
                    },
                },
                date(2021, 1, 1),
            ),
        ]);
        let resolver = ActionResolver::resolve(&timeline).unwrap();

        assert_eq!(
            resolver.canonical_identity_at("SMALL", date(2021, 2, 1)).unwrap(),
            "BIG"
        );
        let mut recorded = resolver.recorded_identities_for("BIG", date(2021, 2, 1));
        recorded.sort();
        assert_eq!(recorded, vec!["BIG", "SMALL"]);
    }

    #[test]
    fn test_dangling_rename_is_a_consistency_error() {
        let timeline = Timeline::new(vec![
            event("AAA", EventKind::Buy, date(2020, 1, 1), dec!(1)),
            action(
                "GHOST",
                EventKind::Rename {
                    new_identity: "PHANTOM".to_string(),
                },
                date(2021, 1, 1),
            ),
        ]);
        let result = ActionResolver::resolve(&timeline);
        assert!(matches!(result, Err(EngineError::DataConsistency { .. })));
    }

    #[test]
    fn test_identity_cycle_is_a_consistency_error() {
        let timeline = Timeline::new(vec![
            event("A", EventKind::Buy, date(2020, 1, 1), dec!(1)),
            action(
                "A",
                EventKind::Rename {
                    new_identity: "B".to_string(),
                },
                date(2020, 2, 1),
            ),
            action(
                "B",
                EventKind::Rename {
                    new_identity: "A".to_string(),
                },
                date(2020, 3, 1),
            ),
        ]);
        let result = ActionResolver::resolve(&timeline);
        assert!(matches!(result, Err(EngineError::DataConsistency { .. })));
    }

    #[test]
    fn test_same_day_split_applies_before_rename() {
        let timeline = Timeline::new(vec![
            event("OLD", EventKind::Buy, date(2020, 1, 1), dec!(10)),
            // Declared rename-first; the resolver must still order the
            // split ahead of the rename on the shared effective date
            action(
                "OLD",
                EventKind::Rename {
                    new_identity: "NEW".to_string(),
                },
                date(2021, 1, 1),
            ),
            action("OLD", EventKind::Split { ratio: dec!(2) }, date(2021, 1, 1)),
        ]);
        let resolver = ActionResolver::resolve(&timeline).unwrap();
        let chain = resolver.chain("OLD").unwrap();

        assert_eq!(chain.factor_between(date(2020, 1, 1), date(2021, 2, 1)), dec!(2));
        assert_eq!(chain.identity_at(date(2021, 1, 1)), "NEW");
    }

    #[test]
    fn test_unknown_identity_is_not_found() {
        let timeline = Timeline::new(vec![event("AAA", EventKind::Buy, date(2020, 1, 1), dec!(1))]);
        let resolver = ActionResolver::resolve(&timeline).unwrap();
        assert!(matches!(
            resolver.chain("ZZZ"),
            Err(EngineError::NotFound(_))
        ));
    }
}
