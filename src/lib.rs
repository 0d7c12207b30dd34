//! Temporal holdings and valuation engine.
//!
//! Answers point-in-time questions about an investment portfolio from a
//! transaction timeline: how many units of an instrument were held on a
//! date, what a position or the whole portfolio was worth in the reporting
//! currency, and the money-weighted return over a window. Corporate
//! actions (splits, renames, fund conversions, mergers) are resolved into
//! per-identity adjustment chains so that historical quantities and the
//! identities they trade under are always consistent with the query date.
//!
//! Market data is fetched lazily through a provider trait, cleaned on
//! ingest (single-day spikes, pence/pound level shifts) and cached for
//! the duration of one analysis run. All money arithmetic is decimal;
//! floating point appears only inside the return solver and volatility
//! metrics.

pub mod actions;
pub mod config;
pub mod error;
pub mod fx;
pub mod holdings;
pub mod marketdata;
pub mod timeline;
pub mod valuation;

/// Install the default tracing subscriber, honoring `RUST_LOG`. Intended
/// for binaries and test harnesses embedding the engine; calling it twice
/// is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use holdings::{HoldingsCalculator, HoldingsFilter, PositionSummary};
pub use timeline::{AccountCategory, Consideration, EventKind, Timeline, TransactionEvent};
pub use valuation::{PortfolioValuation, PositionValue, ValuationEngine, ValuationGap};
