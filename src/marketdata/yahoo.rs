//! Yahoo Finance chart API provider.

use anyhow::{anyhow, Context};
use chrono::NaiveDate;
use reqwest::blocking::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use super::provider::{FetchError, MarketDataProvider, ProviderPoint};

/// Yahoo Finance chart response
#[derive(Debug, Deserialize)]
struct YahooChartResponse {
    chart: ChartData,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    result: Option<Vec<ChartResult>>,
    error: Option<YahooError>,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    meta: Meta,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Meta {
    currency: Option<String>,
    #[allow(dead_code)]
    symbol: String,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<Quote>,
}

#[derive(Debug, Deserialize)]
struct Quote {
    close: Option<Vec<Option<f64>>>,
}

#[derive(Debug, Deserialize)]
struct YahooError {
    code: String,
    description: String,
}

/// Provider backed by the public Yahoo Finance v8 chart endpoint
pub struct YahooProvider {
    client: Client,
}

impl YahooProvider {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0 (compatible; WorthBot/1.0)")
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn fetch_chart(
        &self,
        symbol: &str,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ProviderPoint>, FetchError> {
        info!("Fetching {} history from {} to {}", symbol, from, to);

        let from_timestamp = from
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| FetchError::Transient(anyhow!("Invalid from date")))?
            .and_utc()
            .timestamp();
        let to_timestamp = to
            .and_hms_opt(23, 59, 59)
            .ok_or_else(|| FetchError::Transient(anyhow!("Invalid to date")))?
            .and_utc()
            .timestamp();

        let url = format!(
            "https://query1.finance.yahoo.com/v8/finance/chart/{}?period1={}&period2={}&interval=1d",
            symbol, from_timestamp, to_timestamp
        );

        let response = self
            .client
            .get(&url)
            .send()
            .context("Failed to send request to Yahoo Finance")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::UnknownSymbol(symbol.to_string()));
        }
        if !response.status().is_success() {
            return Err(FetchError::Transient(anyhow!(
                "Yahoo Finance returned error status: {}",
                response.status()
            )));
        }

        let data: YahooChartResponse = response
            .json()
            .context("Failed to parse Yahoo Finance response")?;

        if let Some(error) = data.chart.error {
            if error.code == "Not Found" {
                return Err(FetchError::UnknownSymbol(symbol.to_string()));
            }
            return Err(FetchError::Transient(anyhow!(
                "Yahoo Finance API error: {} - {}",
                error.code,
                error.description
            )));
        }

        let result = data
            .chart
            .result
            .and_then(|r| r.into_iter().next())
            .ok_or_else(|| FetchError::UnknownSymbol(symbol.to_string()))?;

        let currency = result.meta.currency;
        let timestamps = result.timestamp.unwrap_or_default();
        let closes = result
            .indicators
            .quote
            .into_iter()
            .next()
            .and_then(|q| q.close)
            .unwrap_or_default();

        let mut points = Vec::new();
        for (i, &timestamp) in timestamps.iter().enumerate() {
            let date = chrono::DateTime::from_timestamp(timestamp, 0)
                .ok_or_else(|| FetchError::Transient(anyhow!("Invalid timestamp")))?
                .date_naive();
            // Holidays and suspended sessions come back as nulls; skip them
            let Some(close) = closes.get(i).and_then(|&v| v) else {
                continue;
            };
            let value = Decimal::from_f64_retain(close)
                .ok_or_else(|| FetchError::Transient(anyhow!("Invalid close price")))?;
            points.push(ProviderPoint {
                date,
                value,
                currency: currency.clone(),
            });
        }

        debug!("Fetched {} points for {}", points.len(), symbol);
        Ok(points)
    }
}

impl MarketDataProvider for YahooProvider {
    fn fetch_prices(
        &self,
        identity: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ProviderPoint>, FetchError> {
        self.fetch_chart(identity, start, end)
    }

    fn fetch_rates(
        &self,
        from_currency: &str,
        to_currency: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<ProviderPoint>, FetchError> {
        let symbol = format!("{}{}=X", from_currency, to_currency);
        let mut points = self.fetch_chart(&symbol, start, end)?;
        // A pair quote is dimensionless; drop the endpoint's currency label
        for point in &mut points {
            point.currency = None;
        }
        Ok(points)
    }
}
