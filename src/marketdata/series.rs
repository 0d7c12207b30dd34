//! Dated value series shared by the price and exchange-rate caches.
//!
//! A series is created lazily on first query, extended (never shrunk) when a
//! request exceeds the fetched range, and lives only for the duration of one
//! analysis run. Cleaning flags anomalies instead of deleting points.

use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// A point flagged by data cleaning. The raw value is kept for diagnostics;
/// the series itself holds the replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub date: NaiveDate,
    pub kind: AnomalyKind,
    pub raw_value: Decimal,
    pub adjusted_value: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnomalyKind {
    /// Single-day move and reversal beyond the spike threshold; replaced by
    /// interpolation between valid neighbors
    Spike,
    /// Sustained x100 level shift (pence/pound flip); segment renormalized
    UnitShift,
}

/// Ordered (date, value) series with fetch-range bookkeeping
#[derive(Debug, Clone, Default)]
pub struct DatedSeries {
    points: BTreeMap<NaiveDate, Decimal>,
    /// Native currency of the values, once known
    pub currency: Option<String>,
    /// Disjoint fetched intervals, sorted by start. Two windows with a gap
    /// between them must not claim coverage of the gap.
    fetched: Vec<(NaiveDate, NaiveDate)>,
    anomalies: Vec<Anomaly>,
}

impl DatedSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn fetched_ranges(&self) -> &[(NaiveDate, NaiveDate)] {
        &self.fetched
    }

    pub fn anomalies(&self) -> &[Anomaly] {
        &self.anomalies
    }

    /// Whether [start, end] lies inside one contiguous fetched interval
    pub fn covers(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.fetched
            .iter()
            .any(|(from, to)| *from <= start && *to >= end)
    }

    /// Merge a freshly fetched window into the series. Points outside the
    /// new window are kept; overlapping dates take the new value. The new
    /// interval is coalesced with any fetched interval it overlaps or
    /// directly abuts; gaps between intervals stay uncovered.
    pub fn merge_window(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
        points: impl IntoIterator<Item = (NaiveDate, Decimal)>,
        anomalies: Vec<Anomaly>,
    ) {
        for (date, value) in points {
            self.points.insert(date, value);
        }
        self.anomalies.extend(anomalies);

        self.fetched.push((start, end));
        self.fetched.sort_by_key(|(from, _)| *from);
        let mut coalesced: Vec<(NaiveDate, NaiveDate)> = Vec::with_capacity(self.fetched.len());
        for (from, to) in self.fetched.drain(..) {
            match coalesced.last_mut() {
                Some((_, last_to)) if from <= *last_to + Duration::days(1) => {
                    *last_to = (*last_to).max(to);
                }
                _ => coalesced.push((from, to)),
            }
        }
        self.fetched = coalesced;
    }

    /// Value on `date` exactly, if present
    pub fn value_on(&self, date: NaiveDate) -> Option<Decimal> {
        self.points.get(&date).copied()
    }

    /// Backward search: the nearest value on or before `date`, looking back
    /// at most `horizon_days` calendar days. Never returns a value dated
    /// after `date`.
    pub fn value_on_or_before(
        &self,
        date: NaiveDate,
        horizon_days: i64,
    ) -> Option<(NaiveDate, Decimal)> {
        let floor = date - Duration::days(horizon_days);
        self.points
            .range(floor..=date)
            .next_back()
            .map(|(d, v)| (*d, *v))
    }

    /// Most recent point in the series
    pub fn latest(&self) -> Option<(NaiveDate, Decimal)> {
        self.points.iter().next_back().map(|(d, v)| (*d, *v))
    }

    /// Points within [start, end], in date order
    pub fn window(&self, start: NaiveDate, end: NaiveDate) -> Vec<(NaiveDate, Decimal)> {
        self.points
            .range(start..=end)
            .map(|(d, v)| (*d, *v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_backward_search_finds_prior_trading_day() {
        let mut series = DatedSeries::new();
        series.merge_window(
            date(2023, 1, 2),
            date(2023, 1, 8),
            vec![(date(2023, 1, 6), dec!(101))], // Friday only
            vec![],
        );

        // Saturday resolves to Friday's value
        let (found, value) = series.value_on_or_before(date(2023, 1, 7), 14).unwrap();
        assert_eq!(found, date(2023, 1, 6));
        assert_eq!(value, dec!(101));
    }

    #[test]
    fn test_backward_search_never_looks_forward() {
        let mut series = DatedSeries::new();
        series.merge_window(
            date(2023, 1, 1),
            date(2023, 1, 31),
            vec![(date(2023, 1, 20), dec!(99))],
            vec![],
        );
        assert_eq!(series.value_on_or_before(date(2023, 1, 10), 14), None);
    }

    #[test]
    fn test_backward_search_bounded_by_horizon() {
        let mut series = DatedSeries::new();
        series.merge_window(
            date(2023, 1, 1),
            date(2023, 2, 28),
            vec![(date(2023, 1, 2), dec!(50))],
            vec![],
        );
        // 20 days later is outside a 14-day horizon
        assert_eq!(series.value_on_or_before(date(2023, 1, 22), 14), None);
        assert!(series.value_on_or_before(date(2023, 1, 10), 14).is_some());
    }

    #[test]
    fn test_merge_keeps_points_outside_new_window() {
        let mut series = DatedSeries::new();
        series.merge_window(
            date(2023, 1, 1),
            date(2023, 1, 10),
            vec![(date(2023, 1, 5), dec!(10))],
            vec![],
        );
        series.merge_window(
            date(2023, 2, 1),
            date(2023, 2, 10),
            vec![(date(2023, 2, 5), dec!(20))],
            vec![],
        );

        assert_eq!(series.value_on(date(2023, 1, 5)), Some(dec!(10)));
        assert_eq!(series.value_on(date(2023, 2, 5)), Some(dec!(20)));
        assert_eq!(
            series.fetched_ranges(),
            &[
                (date(2023, 1, 1), date(2023, 1, 10)),
                (date(2023, 2, 1), date(2023, 2, 10)),
            ]
        );
        assert!(series.covers(date(2023, 1, 3), date(2023, 1, 8)));
        assert!(series.covers(date(2023, 2, 3), date(2023, 2, 8)));
    }

    #[test]
    fn test_gap_between_windows_is_not_covered() {
        let mut series = DatedSeries::new();
        series.merge_window(date(2023, 1, 1), date(2023, 1, 10), vec![], vec![]);
        series.merge_window(date(2023, 2, 1), date(2023, 2, 10), vec![], vec![]);

        // Neither the gap itself nor a range spanning it is covered
        assert!(!series.covers(date(2023, 1, 15), date(2023, 1, 20)));
        assert!(!series.covers(date(2023, 1, 3), date(2023, 2, 3)));
    }

    #[test]
    fn test_overlapping_and_abutting_windows_coalesce() {
        let mut series = DatedSeries::new();
        series.merge_window(date(2023, 1, 1), date(2023, 1, 10), vec![], vec![]);
        series.merge_window(date(2023, 1, 8), date(2023, 1, 20), vec![], vec![]);
        // Next calendar day counts as contiguous
        series.merge_window(date(2023, 1, 21), date(2023, 1, 31), vec![], vec![]);

        assert_eq!(
            series.fetched_ranges(),
            &[(date(2023, 1, 1), date(2023, 1, 31))]
        );
        assert!(series.covers(date(2023, 1, 2), date(2023, 1, 30)));
    }
}
