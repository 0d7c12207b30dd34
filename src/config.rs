//! Engine configuration
//!
//! Thresholds and horizons for data cleaning, backward price search and
//! provider retries, plus the reporting currency fixed for the life of one
//! analysis run. All values have defaults matching the documented policies;
//! a TOML file can override any subset.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Currency all valuations are reported in
    pub reporting_currency: String,

    /// Fractional daily move that marks a candidate sourcing spike (0.20 = 20%)
    pub spike_threshold: Decimal,

    /// Days fetched before a requested date so the backward search has data
    /// at the start of the range (14-day search + weekends/holidays slack)
    pub lookback_buffer_days: i64,

    /// Maximum calendar days the backward price search walks from a
    /// requested date before reporting the price unavailable
    pub backward_search_horizon_days: i64,

    /// Level-shift factor treated as a minor-unit (pence/pound) flip rather
    /// than a genuine move. 80x catches the 100x flip with slack for the
    /// underlying price drifting on the same day.
    pub unit_shift_factor: Decimal,

    /// Attempts per provider fetch before giving up
    pub fetch_retry_attempts: u32,

    /// Base delay for exponential backoff between fetch attempts
    pub fetch_retry_base_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reporting_currency: "GBP".to_string(),
            spike_threshold: Decimal::new(20, 2),
            lookback_buffer_days: 21,
            backward_search_horizon_days: 14,
            unit_shift_factor: Decimal::from(80),
            fetch_retry_attempts: 3,
            fetch_retry_base_ms: 250,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// any field not present.
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}
