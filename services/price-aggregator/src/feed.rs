//! In-process candle multiplexer
//!
//! `SharedFeed` stands in for the single shared socket: every consumer
//! subscribes by topic, and each inbound frame is decoded once and handed
//! to every handler registered on its topic.
//!
//! Topic format: `/topic/candle.{SYMBOL}.{interval}`, e.g.
//! `/topic/candle.BTCUSDT.1m`.
//!
//! Flow: socket reader → `Frame` → mpsc → `pump` → `dispatch` → handlers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::candles::{CandleEvent, Interval};
use crate::transport::{CandleHandler, CandleTransport, Subscription};

const TOPIC_PREFIX: &str = "/topic/candle.";

/// A `(symbol, interval)` candle topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    pub symbol: String,
    pub interval: Interval,
}

impl Topic {
    pub fn new(symbol: &str, interval: Interval) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval,
        }
    }

    /// Parse a destination such as `/topic/candle.BTCUSDT.1m`.
    ///
    /// The interval is taken after the last `.` so symbols containing dots
    /// (`BRK.B`) still parse.
    pub fn parse(destination: &str) -> Option<Self> {
        let rest = destination.strip_prefix(TOPIC_PREFIX)?;
        let (symbol, interval) = rest.rsplit_once('.')?;
        if symbol.is_empty() {
            return None;
        }
        Some(Self {
            symbol: symbol.to_string(),
            interval: Interval::parse(interval)?,
        })
    }

    pub fn to_destination(&self) -> String {
        format!("{}{}.{}", TOPIC_PREFIX, self.symbol, self.interval)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.symbol, self.interval)
    }
}

/// A raw inbound message from the socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub destination: String,
    /// JSON candle, either inline or as a JSON-encoded string (STOMP body).
    pub body: Value,
}

/// Errors while dispatching a frame.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("unrecognized destination: {0}")]
    UnknownDestination(String),

    #[error("malformed body on {destination}: {source}")]
    MalformedBody {
        destination: String,
        #[source]
        source: serde_json::Error,
    },
}

type HandlerId = u64;

#[derive(Default)]
struct FeedInner {
    topics: Mutex<BTreeMap<Topic, BTreeMap<HandlerId, CandleHandler>>>,
    next_id: AtomicU64,
    frames_dispatched: AtomicU64,
}

impl FeedInner {
    fn topics(&self) -> MutexGuard<'_, BTreeMap<Topic, BTreeMap<HandlerId, CandleHandler>>> {
        self.topics.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, topic: &Topic, id: HandlerId) {
        let mut topics = self.topics();
        let Some(handlers) = topics.get_mut(topic) else {
            return;
        };
        handlers.remove(&id);
        if handlers.is_empty() {
            topics.remove(topic);
            info!(topic = %topic, "Topic closed");
        }
    }
}

/// Shared candle feed. Cheap to clone; clones share one handler registry.
#[derive(Clone, Default)]
pub struct SharedFeed {
    inner: Arc<FeedInner>,
}

impl SharedFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and deliver a frame. Returns the number of handlers invoked.
    pub fn dispatch(&self, frame: &Frame) -> Result<usize, FeedError> {
        let topic = Topic::parse(&frame.destination)
            .ok_or_else(|| FeedError::UnknownDestination(frame.destination.clone()))?;

        let candle = match &frame.body {
            Value::String(raw) => {
                let body: Value =
                    serde_json::from_str(raw).map_err(|source| FeedError::MalformedBody {
                        destination: frame.destination.clone(),
                        source,
                    })?;
                CandleEvent::from_json(&body)
            }
            body => CandleEvent::from_json(body),
        };

        if !candle.is_well_formed() {
            debug!(
                destination = %frame.destination,
                malformed = candle.malformed.count(),
                "Frame carried malformed fields"
            );
        }
        self.inner.frames_dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(self.publish(&topic.symbol, topic.interval, candle))
    }

    /// Deliver a raw destination/body pair, as read off a STOMP socket.
    pub fn dispatch_frame(&self, destination: &str, body: &str) -> Result<usize, FeedError> {
        self.dispatch(&Frame {
            destination: destination.to_string(),
            body: Value::String(body.to_string()),
        })
    }

    /// Deliver an already-decoded candle to every handler on its topic.
    pub fn publish(&self, symbol: &str, interval: Interval, candle: CandleEvent) -> usize {
        let topic = Topic::new(symbol, interval);
        let handlers: Vec<CandleHandler> = self
            .inner
            .topics()
            .get(&topic)
            .map(|handlers| handlers.values().cloned().collect())
            .unwrap_or_default();

        debug!(topic = %topic, handlers = handlers.len(), "Dispatching candle");

        for handler in &handlers {
            handler(candle.clone());
        }
        handlers.len()
    }

    /// Drain frames until every sender is dropped.
    pub async fn pump(&self, mut frames: mpsc::Receiver<Frame>) {
        info!("Feed pump started");
        while let Some(frame) = frames.recv().await {
            if let Err(e) = self.dispatch(&frame) {
                warn!(error = %e, "Skipping undeliverable frame");
            }
        }
        info!(
            frames = self.inner.frames_dispatched.load(Ordering::Relaxed),
            "Feed pump stopped"
        );
    }

    /// Handlers currently registered on a topic.
    pub fn handler_count(&self, symbol: &str, interval: Interval) -> usize {
        self.inner
            .topics()
            .get(&Topic::new(symbol, interval))
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Number of topics with at least one handler.
    pub fn topic_count(&self) -> usize {
        self.inner.topics().len()
    }

    /// Frames successfully decoded since creation.
    pub fn frames_dispatched(&self) -> u64 {
        self.inner.frames_dispatched.load(Ordering::Relaxed)
    }
}

impl CandleTransport for SharedFeed {
    fn subscribe(&self, symbol: &str, interval: Interval, handler: CandleHandler) -> Subscription {
        let topic = Topic::new(symbol, interval);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut topics = self.inner.topics();
            let handlers = topics.entry(topic.clone()).or_insert_with(|| {
                info!(topic = %topic, "Topic opened");
                BTreeMap::new()
            });
            handlers.insert(id, handler);
        }

        let feed: Weak<FeedInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(feed) = feed.upgrade() {
                feed.remove(&topic, id);
            }
        })
    }
}
