//! Candle events consumed from the transport
//!
//! The shared feed delivers one candle per frame for a `(symbol, interval)`
//! topic. Candle bodies come from several upstream producers and are not
//! uniformly typed: prices arrive as JSON numbers or as numeric strings
//! (serialized `BigDecimal`), and fields are occasionally missing.
//!
//! Coercion policy: every numeric field is decoded leniently. Numbers and
//! numeric strings (including scientific notation) are accepted; anything
//! else (missing, `null`, booleans, non-numeric strings, values outside the
//! `Decimal` range) becomes `Decimal::ZERO` and is counted in
//! `CandleEvent::malformed`. Decoding never fails. A coerced or non-positive
//! `open` never seeds the daily open.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Candle stream granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Interval {
    /// 1 minute: drives price, high, low, close and change.
    #[serde(rename = "1m")]
    Minute,
    /// 1 day: drives 24h volume and, when still unset, the daily open.
    #[serde(rename = "1d")]
    Daily,
}

impl Interval {
    /// Both intervals the aggregator subscribes per symbol.
    pub const ALL: [Interval; 2] = [Interval::Minute, Interval::Daily];

    /// Wire name used in topics and HTTP queries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute => "1m",
            Interval::Daily => "1d",
        }
    }

    /// Parse a wire name (`1m` / `1d`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Interval::Minute),
            "1d" => Some(Interval::Daily),
            _ => None,
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A numeric field of a candle body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandleField {
    Open,
    High,
    Low,
    Close,
    Volume,
}

impl CandleField {
    pub const ALL: [CandleField; 5] = [
        CandleField::Open,
        CandleField::High,
        CandleField::Low,
        CandleField::Close,
        CandleField::Volume,
    ];

    /// JSON key of the field.
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleField::Open => "open",
            CandleField::High => "high",
            CandleField::Low => "low",
            CandleField::Close => "close",
            CandleField::Volume => "volume",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

/// Set of fields that fell back to zero while decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MalformedFields(u8);

impl MalformedFields {
    pub fn insert(&mut self, field: CandleField) {
        self.0 |= field.bit();
    }

    pub fn contains(&self, field: CandleField) -> bool {
        self.0 & field.bit() != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// A single OHLCV candle as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleEvent {
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    #[serde(skip)]
    pub malformed: MalformedFields,
}

impl CandleEvent {
    pub fn new(open: Decimal, high: Decimal, low: Decimal, close: Decimal, volume: Decimal) -> Self {
        Self {
            open,
            high,
            low,
            close,
            volume,
            malformed: MalformedFields::default(),
        }
    }

    /// Decode a candle body, applying the zero-fallback coercion policy.
    pub fn from_json(body: &Value) -> Self {
        let mut malformed = MalformedFields::default();
        let mut field = |which: CandleField| {
            let raw = body.get(which.as_str());
            match raw.and_then(coerce_decimal) {
                Some(value) => value,
                None => {
                    malformed.insert(which);
                    debug!(field = which.as_str(), raw = ?raw, "Coercing malformed candle field to zero");
                    Decimal::ZERO
                }
            }
        };

        let open = field(CandleField::Open);
        let high = field(CandleField::High);
        let low = field(CandleField::Low);
        let close = field(CandleField::Close);
        let volume = field(CandleField::Volume);

        Self {
            open,
            high,
            low,
            close,
            volume,
            malformed,
        }
    }

    /// Whether every field decoded cleanly.
    pub fn is_well_formed(&self) -> bool {
        self.malformed.is_empty()
    }

    /// The open, if it can seed a daily open: decoded and positive.
    pub fn seed_open(&self) -> Option<Decimal> {
        (!self.malformed.contains(CandleField::Open) && self.open > Decimal::ZERO).then_some(self.open)
    }
}

/// Leniently convert a JSON value to a `Decimal`.
///
/// Returns `None` for anything that is not a finite number or a numeric
/// string.
pub fn coerce_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => parse_decimal(&n.to_string()),
        Value::String(s) => parse_decimal(s.trim()),
        _ => None,
    }
}

fn parse_decimal(s: &str) -> Option<Decimal> {
    if s.is_empty() {
        return None;
    }
    Decimal::from_str(s)
        .or_else(|_| Decimal::from_scientific(s))
        .ok()
}
