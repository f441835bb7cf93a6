//! Derived per-symbol price records and the versioned price table
//!
//! A `SymbolPrice` merges the minute stream (price, high, low, close) with
//! the daily stream (24h volume, daily open). `PriceTable` is the full set
//! of records handed to listeners; every mutation bumps its version so a
//! listener receiving snapshots from concurrent deliveries can discard
//! older ones.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::candles::CandleEvent;

/// Canonical derived price state for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolPrice {
    pub symbol: String,
    /// Latest minute close.
    pub price: Decimal,
    /// Open of the latest minute candle.
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Opening price of the current trading day.
    pub daily_open: Decimal,
    /// `price - daily_open`
    pub change: Decimal,
    /// `change / daily_open * 100`, or zero when `daily_open <= 0`.
    pub change_percent: Decimal,
    pub volume_24h: Decimal,
    /// Unix milliseconds of the last mutation.
    pub last_update: i64,
}

impl SymbolPrice {
    /// Build a record from a minute candle against the resolved daily open.
    pub fn from_minute(
        symbol: &str,
        candle: &CandleEvent,
        daily_open: Decimal,
        volume_24h: Decimal,
        last_update: i64,
    ) -> Self {
        let (change, change_percent) = derive_change(candle.close, daily_open);
        Self {
            symbol: symbol.to_string(),
            price: candle.close,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            daily_open,
            change,
            change_percent,
            volume_24h,
            last_update,
        }
    }

    /// Recompute change metrics against a (possibly new) daily open.
    pub fn rederive(&mut self, daily_open: Decimal) {
        let (change, change_percent) = derive_change(self.price, daily_open);
        self.daily_open = daily_open;
        self.change = change;
        self.change_percent = change_percent;
    }
}

/// Compute `(change, change_percent)` of `price` against `daily_open`.
///
/// Percent is zero when the open is not positive. Arithmetic overflow also
/// yields zero rather than panicking on the delivery path.
pub fn derive_change(price: Decimal, daily_open: Decimal) -> (Decimal, Decimal) {
    let change = price.checked_sub(daily_open).unwrap_or(Decimal::ZERO);
    if daily_open <= Decimal::ZERO {
        return (change, Decimal::ZERO);
    }
    let percent = change
        .checked_div(daily_open)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .unwrap_or(Decimal::ZERO);
    (change, percent)
}

/// Snapshot of every symbol's derived price.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTable {
    version: u64,
    prices: BTreeMap<String, SymbolPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonic mutation counter.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolPrice> {
        self.prices.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, SymbolPrice> {
        self.prices
    }

    /// Insert or replace a record.
    pub(crate) fn upsert(&mut self, record: SymbolPrice) {
        self.version += 1;
        self.prices.insert(record.symbol.clone(), record);
    }

    /// Mutate an existing record in place. Returns false if absent.
    pub(crate) fn patch<F>(&mut self, symbol: &str, f: F) -> bool
    where
        F: FnOnce(&mut SymbolPrice),
    {
        match self.prices.get_mut(symbol) {
            Some(record) => {
                f(record);
                self.version += 1;
                true
            }
            None => false,
        }
    }
}
