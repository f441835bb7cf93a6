//! Transport seam between the aggregator and the candle multiplexer
//!
//! The multiplexer owns the single physical connection and hands out one
//! `Subscription` per `(symbol, interval)` request. Dropping or cancelling
//! the subscription detaches the handler.

use std::fmt;
use std::sync::Arc;

use crate::candles::{CandleEvent, Interval};

/// Callback invoked once per received candle.
pub type CandleHandler = Arc<dyn Fn(CandleEvent) + Send + Sync>;

/// A multiplexed candle source.
pub trait CandleTransport: Send + Sync {
    /// Register `handler` for candles of `symbol` at `interval`.
    ///
    /// Implementations must not hold internal locks while invoking
    /// handlers.
    fn subscribe(&self, symbol: &str, interval: Interval, handler: CandleHandler) -> Subscription;
}

/// Opaque unsubscribe handle. Cancels on drop.
#[must_use = "dropping a Subscription cancels it immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Detach the handler from the transport.
    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
