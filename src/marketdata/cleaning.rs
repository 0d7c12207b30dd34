//! Data cleaning for freshly fetched price windows.
//!
//! Providers occasionally return single-day spikes (bad rows) and UK series
//! that flip between pence and pounds mid-stream. Both are corrected before
//! the window enters the cache: spikes are replaced by interpolation between
//! their neighbors, minor-unit level shifts renormalize the discontinuous
//! segment. Nothing is deleted; every correction is recorded as an anomaly.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::series::{Anomaly, AnomalyKind};
use crate::config::EngineConfig;

const PENCE_PER_POUND: Decimal = Decimal::ONE_HUNDRED;

/// Clean a sorted fetched window in place. Returns the anomalies flagged.
/// `currency` is the provider's claimed currency and may be rewritten
/// (GBp series come out normalized to GBP).
pub fn clean_window(
    symbol: &str,
    points: &mut Vec<(NaiveDate, Decimal)>,
    currency: &mut Option<String>,
    config: &EngineConfig,
) -> Vec<Anomaly> {
    let mut anomalies = suppress_spikes(symbol, points, config.spike_threshold);
    anomalies.extend(normalize_unit_shifts(
        symbol,
        points,
        currency,
        config.unit_shift_factor,
    ));
    anomalies
}

/// Replace V-shaped single-day spikes: a move beyond the threshold in one
/// direction followed by a comparable reversal. A genuine jump that holds
/// its level is left alone.
fn suppress_spikes(
    symbol: &str,
    points: &mut [(NaiveDate, Decimal)],
    threshold: Decimal,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    if points.len() < 3 {
        return anomalies;
    }

    for i in 1..points.len() - 1 {
        let (_, prev) = points[i - 1];
        let (date, current) = points[i];
        let (_, next) = points[i + 1];
        if prev <= Decimal::ZERO || current <= Decimal::ZERO || next <= Decimal::ZERO {
            continue;
        }

        let prev_move = ((current - prev) / prev).abs();
        let next_move = ((current - next) / next).abs();
        let is_reversal =
            (current > prev && next < current) || (current < prev && next > current);

        if is_reversal && prev_move > threshold && next_move > threshold {
            let (prev_date, _) = points[i - 1];
            let (next_date, _) = points[i + 1];
            let replacement = interpolate(prev_date, prev, next_date, next, date);
            warn!(
                "Suppressing price spike for {} at {}: {} (neighbors {} / {}), interpolated to {}",
                symbol, date, current, prev, next, replacement
            );
            anomalies.push(Anomaly {
                date,
                kind: AnomalyKind::Spike,
                raw_value: current,
                adjusted_value: replacement,
            });
            points[i].1 = replacement;
        }
    }
    anomalies
}

/// Linear interpolation by date between two valid neighbors
fn interpolate(
    d0: NaiveDate,
    v0: Decimal,
    d1: NaiveDate,
    v1: Decimal,
    at: NaiveDate,
) -> Decimal {
    let span = (d1 - d0).num_days();
    if span <= 0 {
        return v0;
    }
    let elapsed = Decimal::from((at - d0).num_days());
    v0 + (v1 - v0) * elapsed / Decimal::from(span)
}

/// Detect a sustained x100 level shift (pence/pound flip) and normalize the
/// whole discontinuous segment to pounds. A shift is recognized when two
/// consecutive values differ by at least `shift_factor` in either direction.
/// A series the provider labels GBp with no internal shift is converted
/// wholesale.
fn normalize_unit_shifts(
    symbol: &str,
    points: &mut [(NaiveDate, Decimal)],
    currency: &mut Option<String>,
    shift_factor: Decimal,
) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    let is_pence = currency.as_deref() == Some("GBp");
    if !is_pence && currency.as_deref() != Some("GBP") {
        return anomalies;
    }

    let mut boundary: Option<(usize, bool)> = None; // (index, earlier_segment_is_pence)
    for i in 1..points.len() {
        let last = points[i - 1].1;
        let current = points[i].1;
        if last <= Decimal::ZERO || current <= Decimal::ZERO {
            continue;
        }
        if last > current * shift_factor {
            // Level dropped ~100x: earlier segment was pence
            warn!(
                "Detected pence->pounds level shift in {} at {}: {} -> {}",
                symbol, points[i].0, last, current
            );
            boundary = Some((i, true));
            break;
        } else if current > last * shift_factor {
            warn!(
                "Detected pounds->pence level shift in {} at {}: {} -> {}",
                symbol, points[i].0, last, current
            );
            boundary = Some((i, false));
            break;
        }
    }

    match boundary {
        Some((index, earlier_is_pence)) => {
            let range = if earlier_is_pence {
                0..index
            } else {
                index..points.len()
            };
            for point in &mut points[range] {
                let raw = point.1;
                point.1 = raw / PENCE_PER_POUND;
                anomalies.push(Anomaly {
                    date: point.0,
                    kind: AnomalyKind::UnitShift,
                    raw_value: raw,
                    adjusted_value: point.1,
                });
            }
        }
        None if is_pence => {
            // No internal shift but the whole series is quoted in pence
            debug!("Converting {} from pence to pounds across the window", symbol);
            for point in points.iter_mut() {
                point.1 /= PENCE_PER_POUND;
            }
        }
        None => {}
    }

    if is_pence {
        *currency = Some("GBP".to_string());
    }
    anomalies
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 3, d).unwrap()
    }

    fn gbp_window(values: &[(u32, Decimal)]) -> Vec<(NaiveDate, Decimal)> {
        values.iter().map(|(d, v)| (date(*d), *v)).collect()
    }

    #[test]
    fn test_v_spike_is_interpolated_not_deleted() {
        // ..., 100, 100, 250, 98, 101, ... with 20% threshold
        let mut points = gbp_window(&[
            (1, dec!(100)),
            (2, dec!(100)),
            (3, dec!(250)),
            (4, dec!(98)),
            (5, dec!(101)),
        ]);
        let mut currency = Some("GBP".to_string());
        let anomalies = clean_window("TEST", &mut points, &mut currency, &EngineConfig::default());

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, AnomalyKind::Spike);
        assert_eq!(anomalies[0].raw_value, dec!(250));
        // Still 5 points; the spike value became the neighbor interpolation
        assert_eq!(points.len(), 5);
        assert_eq!(points[2].1, dec!(99));
    }

    #[test]
    fn test_sustained_jump_is_not_a_spike() {
        // A 50% jump that holds its level is a genuine repricing
        let mut points = gbp_window(&[
            (1, dec!(100)),
            (2, dec!(150)),
            (3, dec!(151)),
            (4, dec!(149)),
        ]);
        let mut currency = Some("GBP".to_string());
        let anomalies = clean_window("TEST", &mut points, &mut currency, &EngineConfig::default());
        assert!(anomalies.is_empty());
        assert_eq!(points[1].1, dec!(150));
    }

    #[test]
    fn test_small_reversal_below_threshold_kept() {
        let mut points = gbp_window(&[(1, dec!(100)), (2, dec!(110)), (3, dec!(100))]);
        let mut currency = Some("GBP".to_string());
        let anomalies = clean_window("TEST", &mut points, &mut currency, &EngineConfig::default());
        assert!(anomalies.is_empty());
    }

    #[test]
    fn test_pence_to_pounds_shift_normalizes_early_segment() {
        // Provider flips from pence to pounds mid-series
        let mut points = gbp_window(&[
            (1, dec!(450)),
            (2, dec!(452)),
            (3, dec!(4.51)),
            (4, dec!(4.49)),
        ]);
        let mut currency = Some("GBP".to_string());
        let anomalies = clean_window("FUND.L", &mut points, &mut currency, &EngineConfig::default());

        assert_eq!(points[0].1, dec!(4.50));
        assert_eq!(points[1].1, dec!(4.52));
        assert_eq!(points[2].1, dec!(4.51));
        assert!(anomalies.iter().all(|a| a.kind == AnomalyKind::UnitShift));
        assert_eq!(anomalies.len(), 2);
    }

    #[test]
    fn test_pounds_to_pence_shift_normalizes_late_segment() {
        let mut points = gbp_window(&[(1, dec!(4.50)), (2, dec!(451)), (3, dec!(452))]);
        let mut currency = Some("GBP".to_string());
        clean_window("FUND.L", &mut points, &mut currency, &EngineConfig::default());

        assert_eq!(points[0].1, dec!(4.50));
        assert_eq!(points[1].1, dec!(4.51));
        assert_eq!(points[2].1, dec!(4.52));
    }

    #[test]
    fn test_gbp_pence_label_converts_whole_window() {
        let mut points = gbp_window(&[(1, dec!(450)), (2, dec!(452))]);
        let mut currency = Some("GBp".to_string());
        clean_window("FUND.L", &mut points, &mut currency, &EngineConfig::default());

        assert_eq!(points[0].1, dec!(4.50));
        assert_eq!(points[1].1, dec!(4.52));
        assert_eq!(currency.as_deref(), Some("GBP"));
    }

    #[test]
    fn test_non_uk_currencies_left_alone() {
        let mut points = gbp_window(&[(1, dec!(450)), (2, dec!(4.5))]);
        let mut currency = Some("USD".to_string());
        let anomalies = clean_window("TICK", &mut points, &mut currency, &EngineConfig::default());
        assert!(anomalies.is_empty());
        assert_eq!(points[0].1, dec!(450));
    }
}
