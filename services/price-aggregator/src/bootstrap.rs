//! Daily-candle bootstrap
//!
//! Before a symbol's live streams are attached, the aggregator asks the
//! market service for the most recent daily candle so the very first tick
//! already carries a correct change against the day's open.
//!
//! The fetch is best-effort and fails fast: any transport error, non-2xx
//! status, decode failure or timeout is reported as a `BootstrapError` and
//! treated by the aggregator as "no data". Nothing is retried.
//!
//! The market service answers either with a bare payload or with its
//! response envelope `{ "code", "message", "data" }`; `data` may be a single
//! candle, a list of candles, or `null`. An envelope without `data` and a
//! record whose `open` does not decode both mean "no data".
//!
//! The default endpoint is the market service's `GET /api/v1/candles/recent`,
//! which returns the recent series for one symbol; the newest record (by
//! `openTime`, else position) is the day's candle.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::candles::coerce_decimal;

/// Latest daily aggregate for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCandle {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    /// Candle start, Unix millis.
    #[serde(rename = "openTime", default)]
    pub open_time: Option<i64>,
}

impl DailyCandle {
    /// Decode a candle record. Non-objects and records without a decodable
    /// `open` are rejected; the other numeric fields use the same
    /// zero-fallback coercion as live candles.
    pub fn from_json(value: &Value) -> Option<Self> {
        let record = value.as_object()?;
        let open = record.get("open").and_then(coerce_decimal)?;
        let number = |name: &str| {
            record
                .get(name)
                .and_then(coerce_decimal)
                .unwrap_or(Decimal::ZERO)
        };
        Some(Self {
            symbol: record
                .get("symbol")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            open,
            high: number("high"),
            low: number("low"),
            close: number("close"),
            volume: number("volume"),
            open_time: record.get("openTime").and_then(parse_open_time),
        })
    }
}

/// Unix millis, as a number, a numeric string or an RFC 3339 timestamp.
fn parse_open_time(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                chrono::DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|t| t.timestamp_millis())
            })
        }
        _ => None,
    }
}

/// Shape of a bootstrap response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DailyPayload {
    /// A single, already filtered record.
    One(DailyCandle),
    /// Records for many symbols; filtered by symbol on resolve.
    Many(Vec<DailyCandle>),
    /// The collaborator had nothing to return.
    Empty,
}

impl DailyPayload {
    /// Decode a response body, unwrapping the envelope if present.
    pub fn from_json(body: Value) -> Self {
        let data = match body {
            Value::Object(mut map) if map.contains_key("data") => {
                map.remove("data").unwrap_or(Value::Null)
            }
            // Envelope with nothing in it
            Value::Object(map) if map.contains_key("code") || map.contains_key("message") => {
                Value::Null
            }
            other => other,
        };

        match data {
            Value::Array(items) => {
                DailyPayload::Many(items.iter().filter_map(DailyCandle::from_json).collect())
            }
            record @ Value::Object(_) => DailyCandle::from_json(&record)
                .map(DailyPayload::One)
                .unwrap_or(DailyPayload::Empty),
            _ => DailyPayload::Empty,
        }
    }

    /// Pick the record for `symbol`.
    ///
    /// Records are trusted as pre-filtered unless they name a different
    /// symbol. Of several matches the newest wins.
    pub fn resolve(self, symbol: &str) -> Option<DailyCandle> {
        match self {
            DailyPayload::One(candle) => {
                if candle.symbol.is_empty() || candle.symbol.eq_ignore_ascii_case(symbol) {
                    Some(candle)
                } else {
                    None
                }
            }
            DailyPayload::Many(candles) => candles
                .into_iter()
                .filter(|c| c.symbol.is_empty() || c.symbol.eq_ignore_ascii_case(symbol))
                // max_by_key keeps the last of equal keys
                .max_by_key(|c| c.open_time),
            DailyPayload::Empty => None,
        }
    }
}

/// Errors from the bootstrap collaborator.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("bootstrap request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("bootstrap endpoint returned status {status}")]
    Status { status: u16 },

    #[error("no daily candle for {symbol}")]
    NotFound { symbol: String },
}

/// Source of the latest daily candle.
#[async_trait]
pub trait DailyFetcher: Send + Sync {
    async fn fetch_latest_daily(&self, symbol: &str) -> Result<DailyPayload, BootstrapError>;
}

/// Fetcher that never has data; live streams seed everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBootstrap;

#[async_trait]
impl DailyFetcher for NoBootstrap {
    async fn fetch_latest_daily(&self, _symbol: &str) -> Result<DailyPayload, BootstrapError> {
        Ok(DailyPayload::Empty)
    }
}

/// Configuration for the HTTP bootstrap fetcher.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    /// Market service base URL.
    pub base_url: String,
    /// Path of the recent-candles endpoint.
    pub path: String,
    /// Interval requested from the endpoint.
    pub interval: String,
    /// Whole-request timeout.
    pub timeout: Duration,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081".to_string(),
            path: "/api/v1/candles/recent".to_string(),
            interval: "1d".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl BootstrapConfig {
    /// Defaults overridden by `PRICE_BOOTSTRAP_URL` and
    /// `PRICE_BOOTSTRAP_TIMEOUT_MS`. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("PRICE_BOOTSTRAP_URL") {
            if !url.trim().is_empty() {
                config.base_url = url.trim().to_string();
            }
        }
        if let Some(ms) = std::env::var("PRICE_BOOTSTRAP_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
        {
            config.timeout = Duration::from_millis(ms);
        }
        config
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }
}

/// `DailyFetcher` backed by the market service's REST API.
#[derive(Debug, Clone)]
pub struct HttpDailyFetcher {
    client: reqwest::Client,
    config: BootstrapConfig,
}

impl HttpDailyFetcher {
    pub fn new(config: BootstrapConfig) -> Result<Self, BootstrapError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        info!(
            endpoint = %config.endpoint(),
            timeout_ms = config.timeout.as_millis() as u64,
            "HttpDailyFetcher initialized"
        );
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DailyFetcher for HttpDailyFetcher {
    async fn fetch_latest_daily(&self, symbol: &str) -> Result<DailyPayload, BootstrapError> {
        let response = self
            .client
            .get(self.config.endpoint())
            .query(&[("interval", self.config.interval.as_str()), ("symbol", symbol)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(BootstrapError::Status {
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await?;
        let payload = DailyPayload::from_json(body);
        debug!(symbol = %symbol, payload = ?payload, "Bootstrap response decoded");
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_with_collection() {
        let body = json!({
            "code": 1000,
            "message": "Success",
            "data": [
                {"symbol": "BTCUSD", "open": 87000, "high": 87500, "low": 86000, "close": 86800, "volume": 1000},
                {"symbol": "ETHUSD", "open": "2960.5", "high": 3000, "low": 2900, "close": 2925.2, "volume": "50"}
            ]
        });
        let payload = DailyPayload::from_json(body);
        assert!(matches!(payload, DailyPayload::Many(ref c) if c.len() == 2));

        let eth = payload.resolve("ETHUSD").unwrap();
        assert_eq!(eth.open.to_string(), "2960.5");
        assert_eq!(eth.volume, Decimal::from(50));
    }

    #[test]
    fn test_bare_single_record() {
        let payload = DailyPayload::from_json(json!({"open": 87000, "volume": 1000}));
        let candle = payload.resolve("BTCUSD").unwrap();
        assert_eq!(candle.open, Decimal::from(87000));
        assert_eq!(candle.volume, Decimal::from(1000));
    }

    #[test]
    fn test_single_record_for_other_symbol_is_rejected() {
        let payload = DailyPayload::from_json(json!({"data": {"symbol": "VCB", "open": 1}}));
        assert!(payload.resolve("HPG").is_none());
    }

    #[test]
    fn test_symbol_missing_from_collection() {
        let payload = DailyPayload::from_json(json!([{"symbol": "VIX", "open": 14}]));
        assert!(payload.resolve("NDQ").is_none());
    }

    #[test]
    fn test_newest_matching_record_wins() {
        let payload = DailyPayload::from_json(json!({
            "code": 1000,
            "data": [
                {"symbol": "BTCUSD", "open": 86000, "volume": 900, "openTime": 1_760_745_600_000_i64},
                {"symbol": "BTCUSD", "open": 87000, "volume": 1000, "openTime": "2025-10-19T00:00:00Z"},
                {"symbol": "BTCUSD", "open": 85000, "volume": 800, "openTime": "1760659200000"}
            ]
        }));
        let daily = payload.resolve("BTCUSD").unwrap();
        assert_eq!(daily.open, Decimal::from(87000));
        assert_eq!(daily.open_time, Some(1_760_832_000_000));
    }

    #[test]
    fn test_series_without_times_takes_last() {
        let payload = DailyPayload::from_json(json!([
            {"open": 1, "volume": 1},
            {"open": 2, "volume": 2}
        ]));
        assert_eq!(payload.resolve("VCB").unwrap().open, Decimal::from(2));
    }

    #[test]
    fn test_record_without_open_is_rejected() {
        assert!(DailyCandle::from_json(&json!({"symbol": "VCB", "volume": 10})).is_none());
        assert!(DailyCandle::from_json(&json!({"symbol": "VCB", "open": "n/a"})).is_none());

        let payload = DailyPayload::from_json(json!({"data": {"symbol": "VCB", "close": 1}}));
        assert_eq!(payload, DailyPayload::Empty);
    }

    #[test]
    fn test_envelope_without_data_is_empty() {
        let payload = DailyPayload::from_json(json!({"code": 1000, "message": "Success"}));
        assert_eq!(payload, DailyPayload::Empty);
        assert!(payload.resolve("BTCUSD").is_none());
    }

    #[test]
    fn test_null_data_is_empty() {
        assert_eq!(DailyPayload::from_json(json!({"data": null})), DailyPayload::Empty);
        assert_eq!(DailyPayload::from_json(json!("oops")), DailyPayload::Empty);
    }

    #[test]
    fn test_endpoint_joins_cleanly() {
        let config = BootstrapConfig {
            base_url: "http://market:8081/".to_string(),
            ..BootstrapConfig::default()
        };
        assert_eq!(config.endpoint(), "http://market:8081/api/v1/candles/recent");
    }

    #[tokio::test]
    async fn test_no_bootstrap_is_empty() {
        let payload = NoBootstrap.fetch_latest_daily("BTCUSD").await.unwrap();
        assert_eq!(payload, DailyPayload::Empty);
    }
}
