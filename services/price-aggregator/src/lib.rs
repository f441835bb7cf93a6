//! Price Aggregator
//!
//! Real-time price aggregation and fan-out for dashboard market data:
//! - One transport subscription per symbol and interval, shared by every consumer
//! - Daily open and 24h volume bootstrapped from the market service
//! - Minute and daily candle streams merged into one `SymbolPrice` per symbol
//! - Change and change-percent derived against the daily open
//! - Full-table snapshots pushed to every registered listener
//!
//! # Architecture
//!
//! ```text
//!  Socket frames            Market service (HTTP)
//!       │                          │
//!  ┌────▼─────┐             ┌──────▼──────┐
//!  │SharedFeed│             │DailyFetcher │  ← one-shot bootstrap
//!  └────┬─────┘             └──────┬──────┘
//!       │ 1m / 1d candles          │
//!  ┌────▼──────────────────────────▼──┐
//!  │         PriceAggregator          │
//!  │  subscriptions · daily cache ·   │
//!  │  PriceTable (versioned)          │
//!  └────────────────┬─────────────────┘
//!                   │
//!        ┌──────────┼──────────┐
//!        ▼          ▼          ▼
//!     Listener   Listener   Listener
//! ```

pub mod aggregator;
pub mod bootstrap;
pub mod candles;
pub mod feed;
pub mod metrics;
pub mod price;
pub mod transport;

pub use aggregator::{AggregatorConfig, Listener, ListenerHandle, ListenerId, PriceAggregator};
pub use bootstrap::{
    BootstrapConfig, BootstrapError, DailyCandle, DailyFetcher, DailyPayload, HttpDailyFetcher,
    NoBootstrap,
};
pub use candles::{CandleEvent, CandleField, Interval, MalformedFields};
pub use feed::{FeedError, Frame, SharedFeed, Topic};
pub use metrics::AggregatorMetrics;
pub use price::{PriceTable, SymbolPrice};
pub use transport::{CandleHandler, CandleTransport, Subscription};

// Library version
pub const SERVICE_VERSION: &str = "0.1.0";
