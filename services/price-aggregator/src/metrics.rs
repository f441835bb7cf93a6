//! Observability counters for the price aggregator
//!
//! Counters are plain relaxed atomics, cheap enough to bump on every
//! candle. `export` renders them for Prometheus-style exposition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::candles::Interval;

/// Core metrics for the aggregator.
#[derive(Debug, Default)]
pub struct AggregatorMetrics {
    // Event processing
    pub minute_events: AtomicU64,
    pub daily_events: AtomicU64,
    pub malformed_fields: AtomicU64,

    // Fan-out
    pub notifications: AtomicU64,
    pub deliveries: AtomicU64,
    pub listener_failures: AtomicU64,

    // Bootstrap
    pub bootstrap_hits: AtomicU64,
    pub bootstrap_misses: AtomicU64,

    // Subscriptions
    pub subscribes: AtomicU64,
    pub unsubscribes: AtomicU64,
}

impl AggregatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a candle received on `interval`.
    pub fn record_event(&self, interval: Interval, malformed_fields: u32) {
        match interval {
            Interval::Minute => self.minute_events.fetch_add(1, Ordering::Relaxed),
            Interval::Daily => self.daily_events.fetch_add(1, Ordering::Relaxed),
        };
        if malformed_fields > 0 {
            self.malformed_fields
                .fetch_add(u64::from(malformed_fields), Ordering::Relaxed);
        }
    }

    /// Record one fan-out cycle reaching `listeners` listeners.
    pub fn record_notification(&self, listeners: usize) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
        self.deliveries.fetch_add(listeners as u64, Ordering::Relaxed);
    }

    pub fn record_listener_failure(&self) {
        self.listener_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bootstrap(&self, hit: bool) {
        if hit {
            self.bootstrap_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bootstrap_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_subscribe(&self) {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsubscribe(&self) {
        self.unsubscribes.fetch_add(1, Ordering::Relaxed);
    }

    /// Export metrics as a BTreeMap for Prometheus-style exposition.
    pub fn export(&self) -> BTreeMap<String, u64> {
        let counters = [
            ("minute_events", &self.minute_events),
            ("daily_events", &self.daily_events),
            ("malformed_fields", &self.malformed_fields),
            ("notifications", &self.notifications),
            ("deliveries", &self.deliveries),
            ("listener_failures", &self.listener_failures),
            ("bootstrap_hits", &self.bootstrap_hits),
            ("bootstrap_misses", &self.bootstrap_misses),
            ("subscribes", &self.subscribes),
            ("unsubscribes", &self.unsubscribes),
        ];
        counters
            .into_iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_counters_by_interval() {
        let metrics = AggregatorMetrics::new();
        metrics.record_event(Interval::Minute, 0);
        metrics.record_event(Interval::Minute, 2);
        metrics.record_event(Interval::Daily, 0);

        let exported = metrics.export();
        assert_eq!(exported["minute_events"], 2);
        assert_eq!(exported["daily_events"], 1);
        assert_eq!(exported["malformed_fields"], 2);
    }

    #[test]
    fn test_fanout_and_bootstrap_counters() {
        let metrics = AggregatorMetrics::new();
        metrics.record_notification(3);
        metrics.record_notification(0);
        metrics.record_listener_failure();
        metrics.record_bootstrap(true);
        metrics.record_bootstrap(false);
        metrics.record_bootstrap(false);

        let exported = metrics.export();
        assert_eq!(exported["notifications"], 2);
        assert_eq!(exported["deliveries"], 3);
        assert_eq!(exported["listener_failures"], 1);
        assert_eq!(exported["bootstrap_hits"], 1);
        assert_eq!(exported["bootstrap_misses"], 2);
    }

    #[test]
    fn test_export_has_every_counter() {
        let exported = AggregatorMetrics::default().export();
        assert_eq!(exported.len(), 10);
        assert!(exported.values().all(|v| *v == 0));
    }
}
