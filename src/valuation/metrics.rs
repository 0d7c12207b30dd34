//! Trailing-window price metrics for a single instrument.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Trading days per year, for annualizing daily volatility
const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Metrics over a trailing price window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowMetrics {
    /// Highest cleaned price in the window
    pub recent_high: Option<Decimal>,
    /// Annualized standard deviation of daily log returns; None with
    /// fewer than two usable returns
    pub annualized_volatility: Option<f64>,
}

pub fn window_metrics(points: &[(NaiveDate, Decimal)]) -> WindowMetrics {
    WindowMetrics {
        recent_high: points.iter().map(|(_, value)| *value).max(),
        annualized_volatility: annualized_volatility(points),
    }
}

fn annualized_volatility(points: &[(NaiveDate, Decimal)]) -> Option<f64> {
    let values: Vec<f64> = points
        .iter()
        .filter_map(|(_, value)| value.to_f64())
        .filter(|v| *v > 0.0)
        .collect();
    if values.len() < 3 {
        return None;
    }

    let log_returns: Vec<f64> = values.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
    let n = log_returns.len() as f64;
    let mean = log_returns.iter().sum::<f64>() / n;
    // Sample variance; n >= 2 is guaranteed by the length check above
    let variance = log_returns
        .iter()
        .map(|r| (r - mean).powi(2))
        .sum::<f64>()
        / (n - 1.0);

    Some(variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt())
}
