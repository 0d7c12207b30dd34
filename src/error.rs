//! Error handling for the valuation engine
//!
//! Defines the error taxonomy used across the analysis pipeline. Consistency
//! errors abort a run; not-found and unavailable errors propagate per query so
//! callers can report partial results with explicit gaps.

use chrono::NaiveDate;
use thiserror::Error;

/// Core error types for valuation queries
#[derive(Error, Debug)]
pub enum EngineError {
    /// The timeline or corporate-action data violates an invariant (oversold
    /// position, dangling rename, identity cycle). Indicates corrupt or
    /// mis-parsed upstream input; never recovered locally.
    #[error("data consistency error for {identity} on {date}: {message}")]
    DataConsistency {
        identity: String,
        date: NaiveDate,
        message: String,
    },

    /// Query for an identity with no resolvable answer. Distinct from a
    /// holding of exactly zero, which is a valid result.
    #[error("unknown instrument: {0}")]
    NotFound(String),

    /// A price or exchange rate could not be obtained within the backward
    /// search horizon, or the provider stayed unreachable after retries.
    #[error("no {kind} available for {symbol} on {date} (searched {horizon_days} days back)")]
    DataUnavailable {
        kind: &'static str,
        symbol: String,
        date: NaiveDate,
        horizon_days: i64,
    },

    /// The rate-of-return solve did not converge.
    #[error("return solve did not converge after {iterations} iterations (last estimate {last_estimate})")]
    Convergence { iterations: u32, last_estimate: f64 },
}

impl EngineError {
    pub fn consistency(
        identity: impl Into<String>,
        date: NaiveDate,
        message: impl Into<String>,
    ) -> Self {
        EngineError::DataConsistency {
            identity: identity.into(),
            date,
            message: message.into(),
        }
    }

    pub fn unavailable(
        kind: &'static str,
        symbol: impl Into<String>,
        date: NaiveDate,
        horizon_days: i64,
    ) -> Self {
        EngineError::DataUnavailable {
            kind,
            symbol: symbol.into(),
            date,
            horizon_days,
        }
    }
}

/// Result type alias for engine queries
pub type Result<T> = std::result::Result<T, EngineError>;
