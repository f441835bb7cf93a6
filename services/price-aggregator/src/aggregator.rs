//! Price aggregator: subscription dedup, derived state and listener fan-out
//!
//! One `PriceAggregator` serves every consumer. Each symbol is attached to
//! the transport at most once, with one minute and one daily handler; both
//! streams fold into a single `SymbolPrice`, and every change is pushed to
//! all listeners as an immutable `PriceTable` snapshot.
//!
//! Daily open resolution is seed-if-unset from three sources (bootstrap,
//! first daily candle, first minute candle), so the outcome does not depend
//! on which stream arrives first. Only a decoded, positive open seeds; until
//! one arrives the record reads a zero open and a zero change percent.
//!
//! Locking: all derived state sits behind one mutex. Transport calls,
//! bootstrap fetches and listener callbacks all run with no lock held, so
//! listeners may call back into the aggregator.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{BootstrapError, DailyCandle, DailyFetcher};
use crate::candles::{CandleEvent, Interval};
use crate::metrics::AggregatorMetrics;
use crate::price::{PriceTable, SymbolPrice};
use crate::transport::{CandleHandler, CandleTransport, Subscription};

/// Listener callback receiving the full table on every change.
pub type Listener = Arc<dyn Fn(&PriceTable) + Send + Sync>;

/// Identifies a registered listener.
pub type ListenerId = u64;

/// Configuration for the aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Fetch the latest daily candle before attaching a new symbol.
    pub bootstrap_enabled: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            bootstrap_enabled: true,
        }
    }
}

/// Daily-granularity cache for one symbol.
#[derive(Debug, Default, Clone, Copy)]
struct DailyState {
    open: Option<Decimal>,
    volume: Option<Decimal>,
}

#[derive(Default)]
struct State {
    prices: PriceTable,
    daily: BTreeMap<String, DailyState>,
    /// Symbols whose bootstrap has been attempted.
    initialized: BTreeSet<String>,
    /// Symbols with a subscribe between bootstrap and handler registration.
    pending: BTreeSet<String>,
    subscriptions: BTreeMap<(String, Interval), Subscription>,
}

struct Inner {
    transport: Arc<dyn CandleTransport>,
    fetcher: Arc<dyn DailyFetcher>,
    config: AggregatorConfig,
    state: Mutex<State>,
    listeners: Mutex<BTreeMap<ListenerId, Listener>>,
    next_listener: AtomicU64,
    metrics: AggregatorMetrics,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, BTreeMap<ListenerId, Listener>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn bootstrap(&self, symbol: &str) -> Option<DailyCandle> {
        let outcome = self
            .fetcher
            .fetch_latest_daily(symbol)
            .await
            .and_then(|payload| {
                payload.resolve(symbol).ok_or_else(|| BootstrapError::NotFound {
                    symbol: symbol.to_string(),
                })
            });

        match outcome {
            Ok(daily) => {
                self.metrics.record_bootstrap(true);
                debug!(
                    symbol = %symbol,
                    open = %daily.open,
                    volume = %daily.volume,
                    "Bootstrap daily candle resolved"
                );
                Some(daily)
            }
            Err(e) => {
                self.metrics.record_bootstrap(false);
                warn!(
                    symbol = %symbol,
                    error = %e,
                    "Bootstrap unavailable, daily open will come from live candles"
                );
                None
            }
        }
    }

    fn seed_daily(&self, symbol: &str, daily: &DailyCandle) {
        let mut state = self.state();
        let cache = state.daily.entry(symbol.to_string()).or_default();
        if daily.open > Decimal::ZERO {
            cache.open.get_or_insert(daily.open);
        }
        cache.volume = Some(daily.volume);
    }

    fn on_minute(&self, symbol: &str, candle: CandleEvent) {
        self.metrics.record_event(Interval::Minute, candle.malformed.count());

        let snapshot = {
            let mut guard = self.state();
            let state = &mut *guard;

            let cache = state.daily.entry(symbol.to_string()).or_default();
            let daily_open = resolve_open(&mut cache.open, &candle);
            let cached_volume = cache.volume;

            let previous = state.prices.get(symbol);
            let volume_24h = cached_volume
                .or_else(|| previous.map(|p| p.volume_24h))
                .unwrap_or(Decimal::ZERO);
            let last_update = next_timestamp(previous.map(|p| p.last_update));

            let record = SymbolPrice::from_minute(symbol, &candle, daily_open, volume_24h, last_update);
            debug!(
                symbol = %symbol,
                price = %record.price,
                change = %record.change,
                "Minute candle applied"
            );
            state.prices.upsert(record);
            Arc::new(state.prices.clone())
        };

        self.notify(snapshot);
    }

    fn on_daily(&self, symbol: &str, candle: CandleEvent) {
        self.metrics.record_event(Interval::Daily, candle.malformed.count());

        let snapshot = {
            let mut guard = self.state();
            let state = &mut *guard;

            let cache = state.daily.entry(symbol.to_string()).or_default();
            cache.volume = Some(candle.volume);
            let daily_open = resolve_open(&mut cache.open, &candle);

            // No minute candle yet: keep the caches, publish nothing partial.
            let patched = state.prices.patch(symbol, |record| {
                record.volume_24h = candle.volume;
                record.rederive(daily_open);
                record.last_update = next_timestamp(Some(record.last_update));
            });
            debug!(symbol = %symbol, volume = %candle.volume, patched, "Daily candle applied");

            patched.then(|| Arc::new(state.prices.clone()))
        };

        if let Some(snapshot) = snapshot {
            self.notify(snapshot);
        }
    }

    fn notify(&self, snapshot: Arc<PriceTable>) {
        let listeners: Vec<(ListenerId, Listener)> = self
            .listeners()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect();

        for (id, listener) in &listeners {
            self.deliver(*id, listener, &snapshot);
        }
        self.metrics.record_notification(listeners.len());
    }

    fn deliver(&self, id: ListenerId, listener: &Listener, table: &PriceTable) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(table)));
        if let Err(payload) = outcome {
            self.metrics.record_listener_failure();
            error!(
                listener_id = id,
                version = table.version(),
                reason = %panic_message(payload.as_ref()),
                "Price listener failed"
            );
        }
    }
}

/// Seed-if-unset from a usable open. Unresolved opens read as zero.
fn resolve_open(cached: &mut Option<Decimal>, candle: &CandleEvent) -> Decimal {
    if cached.is_none() {
        *cached = candle.seed_open();
    }
    cached.unwrap_or(Decimal::ZERO)
}

/// Wall-clock millis, never behind the previous update.
fn next_timestamp(previous: Option<i64>) -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    previous.map_or(now, |prev| now.max(prev))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Real-time price aggregator shared by every consumer.
///
/// Cheap to clone; clones share state. Dropping the last clone cancels
/// every transport subscription.
#[derive(Clone)]
pub struct PriceAggregator {
    inner: Arc<Inner>,
}

impl PriceAggregator {
    pub fn new(transport: Arc<dyn CandleTransport>, fetcher: Arc<dyn DailyFetcher>) -> Self {
        Self::with_config(transport, fetcher, AggregatorConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn CandleTransport>,
        fetcher: Arc<dyn DailyFetcher>,
        config: AggregatorConfig,
    ) -> Self {
        info!(
            bootstrap_enabled = config.bootstrap_enabled,
            "PriceAggregator initialized"
        );
        Self {
            inner: Arc::new(Inner {
                transport,
                fetcher,
                config,
                state: Mutex::new(State::default()),
                listeners: Mutex::new(BTreeMap::new()),
                next_listener: AtomicU64::new(1),
                metrics: AggregatorMetrics::new(),
            }),
        }
    }

    /// Start tracking `symbol`.
    ///
    /// No-op (returns false) if the symbol is already subscribed or a
    /// subscribe for it is in flight. On first sight of the symbol since the
    /// last daily reset the daily candle is bootstrapped before the live
    /// handlers are attached. Returns true once handlers are registered.
    pub async fn subscribe(&self, symbol: &str) -> bool {
        let needs_bootstrap = {
            let mut state = self.inner.state();
            let key = (symbol.to_string(), Interval::Minute);
            if state.subscriptions.contains_key(&key) || state.pending.contains(symbol) {
                debug!(symbol = %symbol, "Already subscribed");
                return false;
            }
            state.pending.insert(symbol.to_string());
            state.initialized.insert(symbol.to_string())
        };

        if needs_bootstrap && self.inner.config.bootstrap_enabled {
            if let Some(daily) = self.inner.bootstrap(symbol).await {
                self.inner.seed_daily(symbol, &daily);
            }
        }

        if !self.inner.state().pending.contains(symbol) {
            info!(symbol = %symbol, "Subscribe cancelled during bootstrap");
            return false;
        }

        let minute = self.inner.transport.subscribe(
            symbol,
            Interval::Minute,
            self.handler(symbol, Interval::Minute),
        );
        let daily = self.inner.transport.subscribe(
            symbol,
            Interval::Daily,
            self.handler(symbol, Interval::Daily),
        );

        let registered = {
            let mut state = self.inner.state();
            if state.pending.remove(symbol) {
                state
                    .subscriptions
                    .insert((symbol.to_string(), Interval::Minute), minute);
                state
                    .subscriptions
                    .insert((symbol.to_string(), Interval::Daily), daily);
                true
            } else {
                // Unsubscribed while the handlers were being attached.
                drop(state);
                minute.cancel();
                daily.cancel();
                false
            }
        };

        if registered {
            self.inner.metrics.record_subscribe();
            info!(symbol = %symbol, bootstrapped = needs_bootstrap, "Subscribed");
        }
        registered
    }

    /// Subscribe every symbol concurrently. Returns how many were newly
    /// subscribed.
    pub async fn subscribe_all<I, S>(&self, symbols: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let symbols: Vec<String> = symbols
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect();
        let results = join_all(symbols.iter().map(|s| self.subscribe(s))).await;
        results.into_iter().filter(|newly| *newly).count()
    }

    /// Stop tracking `symbol`. Cached prices and bootstrap state are kept.
    ///
    /// Returns false if the symbol was not subscribed.
    pub fn unsubscribe(&self, symbol: &str) -> bool {
        let (was_pending, removed) = {
            let mut state = self.inner.state();
            let was_pending = state.pending.remove(symbol);
            let removed: Vec<Subscription> = Interval::ALL
                .iter()
                .filter_map(|interval| state.subscriptions.remove(&(symbol.to_string(), *interval)))
                .collect();
            (was_pending, removed)
        };

        if removed.is_empty() && !was_pending {
            debug!(symbol = %symbol, "Unsubscribe ignored, not subscribed");
            return false;
        }

        for subscription in removed {
            subscription.cancel();
        }
        self.inner.metrics.record_unsubscribe();
        info!(symbol = %symbol, "Unsubscribed");
        true
    }

    /// Current record for `symbol`, if any minute candle has been seen.
    pub fn get_price(&self, symbol: &str) -> Option<SymbolPrice> {
        self.inner.state().prices.get(symbol).cloned()
    }

    /// Independent copy of the full table.
    pub fn get_all_prices(&self) -> PriceTable {
        self.inner.state().prices.clone()
    }

    /// Register a listener. It is called immediately with the current table
    /// and then after every change until removed.
    ///
    /// Listeners run without internal locks held and may call back into the
    /// aggregator. A listener added during a fan-out cycle does not receive
    /// that cycle's snapshot; one removed during a cycle may still receive
    /// it.
    pub fn add_listener<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&PriceTable) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners().insert(id, listener.clone());
        debug!(listener_id = id, "Listener registered");

        let current = self.get_all_prices();
        self.inner.deliver(id, &listener, &current);

        ListenerHandle {
            id,
            aggregator: Arc::downgrade(&self.inner),
        }
    }

    /// Start of a new trading day: forget daily opens, volumes and which
    /// symbols were bootstrapped.
    ///
    /// Prices and subscriptions are kept. Active symbols re-seed their
    /// daily open from the next live candle; only a later
    /// unsubscribe/subscribe cycle bootstraps again.
    pub fn reset_daily_prices(&self) {
        let mut state = self.inner.state();
        let symbols = state.daily.len();
        state.daily.clear();
        state.initialized.clear();
        info!(symbols, "Daily prices reset");
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.inner
            .state()
            .subscriptions
            .contains_key(&(symbol.to_string(), Interval::Minute))
    }

    /// Actively tracked symbols in order.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.inner
            .state()
            .subscriptions
            .keys()
            .filter(|(_, interval)| *interval == Interval::Minute)
            .map(|(symbol, _)| symbol.clone())
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners().len()
    }

    pub fn metrics(&self) -> &AggregatorMetrics {
        &self.inner.metrics
    }

    /// Cancel every subscription and drop every listener.
    pub fn shutdown(&self) {
        let subscriptions = {
            let mut state = self.inner.state();
            state.pending.clear();
            std::mem::take(&mut state.subscriptions)
        };
        let listeners = std::mem::take(&mut *self.inner.listeners());

        let count = subscriptions.len();
        for subscription in subscriptions.into_values() {
            subscription.cancel();
        }
        info!(
            subscriptions = count,
            listeners = listeners.len(),
            "PriceAggregator shut down"
        );
    }

    fn handler(&self, symbol: &str, interval: Interval) -> CandleHandler {
        let aggregator: Weak<Inner> = Arc::downgrade(&self.inner);
        let symbol = symbol.to_string();
        Arc::new(move |candle: CandleEvent| {
            let Some(inner) = aggregator.upgrade() else {
                return;
            };
            match interval {
                Interval::Minute => inner.on_minute(&symbol, candle),
                Interval::Daily => inner.on_daily(&symbol, candle),
            }
        })
    }
}

/// Unregisters a listener. Dropping the handle leaves the listener
/// registered.
#[derive(Debug)]
pub struct ListenerHandle {
    id: ListenerId,
    aggregator: Weak<Inner>,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Unregister. Returns false if it was already gone.
    pub fn remove(self) -> bool {
        let Some(inner) = self.aggregator.upgrade() else {
            return false;
        };
        let removed = inner.listeners().remove(&self.id).is_some();
        if removed {
            debug!(listener_id = self.id, "Listener removed");
        }
        removed
    }
}
