//! Money-weighted rate of return via the irregular-interval internal rate
//! of return (XIRR).
//!
//! Solved in f64: Newton-Raphson from a fixed seed, falling back to
//! bisection over a wide bracket when Newton walks out of the domain or
//! oscillates. A flow set with no sign change has no defined rate and is
//! reported as such rather than as a solver failure.

use chrono::NaiveDate;
use itertools::Itertools;
use tracing::debug;

use crate::error::{EngineError, Result};

const DAYS_PER_YEAR: f64 = 365.0;
const TOLERANCE: f64 = 1e-7;
const MAX_ITERATIONS: u32 = 100;
const NEWTON_SEED: f64 = 0.1;
const BRACKET_LOW: f64 = -0.9999;
const BRACKET_HIGH: f64 = 10.0;

/// Annualized internal rate of return for dated flows (negative =
/// invested, positive = received). Returns None when the rate is
/// undefined: fewer than two flows, or all flows on the same side of zero.
pub fn xirr(flows: &[(NaiveDate, f64)]) -> Result<Option<f64>> {
    // Same-day flows net out before the solve
    let flows: Vec<(NaiveDate, f64)> = flows
        .iter()
        .copied()
        .into_group_map()
        .into_iter()
        .map(|(date, amounts)| (date, amounts.iter().sum::<f64>()))
        .filter(|(_, amount)| *amount != 0.0)
        .sorted_by_key(|(date, _)| *date)
        .collect();

    if flows.len() < 2 {
        return Ok(None);
    }
    let has_outflow = flows.iter().any(|(_, amount)| *amount < 0.0);
    let has_inflow = flows.iter().any(|(_, amount)| *amount > 0.0);
    if !has_outflow || !has_inflow {
        return Ok(None);
    }

    // Flows are date-sorted, so the first one anchors the time axis
    let epoch = flows[0].0;
    let times: Vec<(f64, f64)> = flows
        .iter()
        .map(|(date, amount)| ((*date - epoch).num_days() as f64 / DAYS_PER_YEAR, *amount))
        .collect();

    if let Some(rate) = newton(&times) {
        debug!("XIRR converged by Newton: {:.6}", rate);
        return Ok(Some(rate));
    }
    match bisect(&times) {
        Some(rate) => {
            debug!("XIRR converged by bisection: {:.6}", rate);
            Ok(Some(rate))
        }
        None => Err(EngineError::Convergence {
            iterations: MAX_ITERATIONS,
            last_estimate: npv(&times, NEWTON_SEED),
        }),
    }
}

fn npv(times: &[(f64, f64)], rate: f64) -> f64 {
    times
        .iter()
        .map(|(t, amount)| amount / (1.0 + rate).powf(*t))
        .sum()
}

fn npv_derivative(times: &[(f64, f64)], rate: f64) -> f64 {
    times
        .iter()
        .map(|(t, amount)| -t * amount / (1.0 + rate).powf(t + 1.0))
        .sum()
}

fn newton(times: &[(f64, f64)]) -> Option<f64> {
    let mut rate = NEWTON_SEED;
    for _ in 0..MAX_ITERATIONS {
        let value = npv(times, rate);
        if value.abs() < TOLERANCE {
            return Some(rate);
        }
        let slope = npv_derivative(times, rate);
        if slope.abs() < f64::EPSILON {
            return None;
        }
        let next = rate - value / slope;
        if !next.is_finite() || next <= -1.0 {
            return None;
        }
        if (next - rate).abs() < TOLERANCE {
            // A vanishing step is only convergence at an actual root
            if npv(times, next).abs() < TOLERANCE {
                return Some(next);
            }
            return None;
        }
        rate = next;
    }
    None
}

fn bisect(times: &[(f64, f64)]) -> Option<f64> {
    let mut low = BRACKET_LOW;
    let mut high = BRACKET_HIGH;
    let mut npv_low = npv(times, low);
    let npv_high = npv(times, high);
    if npv_low * npv_high > 0.0 {
        return None;
    }

    for _ in 0..MAX_ITERATIONS {
        let mid = (low + high) / 2.0;
        let npv_mid = npv(times, mid);
        if npv_mid.abs() < TOLERANCE || (high - low) / 2.0 < TOLERANCE {
            return Some(mid);
        }
        if npv_low * npv_mid < 0.0 {
            high = mid;
        } else {
            low = mid;
            npv_low = npv_mid;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_one_year_doubling_is_one_hundred_percent() {
        let flows = vec![
            (date(2020, 1, 1), -1000.0),
            (date(2021, 1, 1), 2000.0),
        ];
        let rate = xirr(&flows).unwrap().unwrap();
        // 366 days in 2020, so slightly under the exact doubling rate
        assert!((rate - 1.0).abs() < 0.01, "rate was {}", rate);
    }

    #[test]
    fn test_flat_value_is_zero_return() {
        let flows = vec![
            (date(2020, 1, 1), -500.0),
            (date(2020, 7, 1), -500.0),
            (date(2021, 1, 1), 1000.0),
        ];
        let rate = xirr(&flows).unwrap().unwrap();
        assert!(rate.abs() < 1e-4, "rate was {}", rate);
    }

    #[test]
    fn test_loss_gives_negative_rate() {
        let flows = vec![
            (date(2020, 1, 1), -1000.0),
            (date(2021, 1, 1), 600.0),
        ];
        let rate = xirr(&flows).unwrap().unwrap();
        assert!((-0.45..-0.35).contains(&rate), "rate was {}", rate);
    }

    #[test]
    fn test_single_sided_flows_are_undefined_not_an_error() {
        let flows = vec![
            (date(2020, 1, 1), -1000.0),
            (date(2020, 6, 1), -500.0),
        ];
        assert_eq!(xirr(&flows).unwrap(), None);
    }

    #[test]
    fn test_fewer_than_two_flows_is_undefined() {
        assert_eq!(xirr(&[]).unwrap(), None);
        assert_eq!(xirr(&[(date(2020, 1, 1), -100.0)]).unwrap(), None);
        // Zero flows are dropped before counting
        let flows = vec![(date(2020, 1, 1), -100.0), (date(2020, 6, 1), 0.0)];
        assert_eq!(xirr(&flows).unwrap(), None);
    }

    #[test]
    fn test_rootless_flows_report_convergence_failure() {
        // -100 + 230x - 135x^2 (x = discount factor) has a negative
        // discriminant: the discounted value stays below zero for every
        // rate in the search bracket, so no rate exists
        let flows = vec![
            (date(2020, 1, 1), -100.0),
            (date(2021, 1, 1), 230.0),
            (date(2022, 1, 1), -135.0),
        ];
        assert!(matches!(
            xirr(&flows),
            Err(EngineError::Convergence { .. })
        ));
    }

    #[test]
    fn test_irregular_intervals() {
        // Worked example with known result near 12.3%
        let flows = vec![
            (date(2020, 1, 1), -10000.0),
            (date(2020, 3, 15), -2500.0),
            (date(2020, 10, 1), 1500.0),
            (date(2021, 1, 1), 12500.0),
        ];
        let rate = xirr(&flows).unwrap().unwrap();
        assert!((0.08..0.17).contains(&rate), "rate was {}", rate);
        // NPV at the solution is ~zero
        let epoch = date(2020, 1, 1);
        let npv: f64 = flows
            .iter()
            .map(|(d, a)| a / (1.0 + rate).powf((*d - epoch).num_days() as f64 / 365.0))
            .sum();
        assert!(npv.abs() < 1e-4);
    }
}
