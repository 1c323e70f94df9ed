//! In-process publish/subscribe bus carrying [`Event`]s to every interested sink.
//!
//! Publishing assigns a monotonically increasing sequence number and hands the event to
//! each matching sink while the bus lock is held, so every sink observes events in
//! publish order. Sinks must therefore never block: slow consumers sit behind a
//! [`QueueSink`], which drops its own oldest entry instead of stalling the publisher.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use helm_core::{Event, EventKind, EventPayload};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::warn;

/// Default number of published events retained for `history`.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

/// Error raised by a sink that could not accept an event.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,
    #[error("sink rejected event: {0}")]
    Rejected(String),
}

/// Consumer of published events.
///
/// `deliver` runs while the bus is locked: it must return promptly and must not publish.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &Event) -> Result<(), SinkError>;

    /// Accept the seed of a seeded subscription. Buffering sinks must keep it ahead of
    /// every later event and never discard it.
    fn seed(&self, event: &Event) -> Result<(), SinkError> {
        self.deliver(event)
    }
}

/// Which events a subscription receives. The topic of an event is its kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Topic {
    All,
    Kind(EventKind),
}

impl Topic {
    #[must_use]
    pub fn matches(self, kind: EventKind) -> bool {
        match self {
            Self::All => true,
            Self::Kind(expected) => expected == kind,
        }
    }
}

impl From<EventKind> for Topic {
    fn from(kind: EventKind) -> Self {
        Self::Kind(kind)
    }
}

struct Subscriber {
    id: u64,
    topic: Topic,
    sink: Arc<dyn EventSink>,
}

struct BusInner {
    last_seq: u64,
    next_subscriber: u64,
    subscribers: Vec<Subscriber>,
    history: VecDeque<Event>,
    history_limit: usize,
}

impl BusInner {
    fn remove(&mut self, id: u64) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|sub| sub.id != id);
        before != self.subscribers.len()
    }

    fn attach(&mut self, topic: Topic, sink: Arc<dyn EventSink>) -> u64 {
        self.next_subscriber += 1;
        let id = self.next_subscriber;
        self.subscribers.push(Subscriber { id, topic, sink });
        id
    }
}

thread_local! {
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Whether the current thread is inside [`EventBus::publish`].
///
/// Code that publishes in reaction to diagnostics (e.g. a log forwarding layer) must
/// check this first; the bus lock is not reentrant.
#[must_use]
pub fn is_dispatching() -> bool {
    DISPATCHING.with(Cell::get)
}

struct DispatchGuard {
    previous: bool,
}

impl DispatchGuard {
    fn enter() -> Self {
        Self {
            previous: DISPATCHING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCHING.with(|flag| flag.set(self.previous));
    }
}

/// Shared handle to the event bus. Cloning is cheap.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl EventBus {
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                last_seq: 0,
                next_subscriber: 0,
                subscribers: Vec::new(),
                history: VecDeque::with_capacity(history_limit.min(1024)),
                history_limit,
            })),
        }
    }

    /// Publish a payload to every matching subscriber and return the sequenced event.
    pub fn publish(&self, payload: EventPayload) -> Event {
        let _dispatch = DispatchGuard::enter();
        let mut failures = Vec::new();
        let event = {
            let mut inner = self.inner.lock();
            inner.last_seq += 1;
            let mut event = Event::new(payload);
            event.seq = inner.last_seq;
            let kind = event.kind();
            for sub in inner.subscribers.iter().filter(|sub| sub.topic.matches(kind)) {
                if let Err(err) = sub.sink.deliver(&event) {
                    failures.push((sub.id, err));
                }
            }
            if inner.history_limit > 0 {
                if inner.history.len() == inner.history_limit {
                    inner.history.pop_front();
                }
                inner.history.push_back(event.clone());
            }
            event
        };
        for (subscription, err) in failures {
            warn!(
                subscription,
                kind = %event.kind(),
                seq = event.seq,
                error = %err,
                "event sink failed; subscription kept"
            );
        }
        event
    }

    /// Register `sink` for `topic`. The subscription ends when the handle is dropped.
    pub fn subscribe(&self, topic: Topic, sink: Arc<dyn EventSink>) -> Subscription {
        let id = self.inner.lock().attach(topic, sink);
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Register `sink` after handing it a seed event built from the current sequence.
    ///
    /// The seed and the registration happen under the bus lock, so the seed is
    /// delivered strictly before any event published afterwards. The seed itself is
    /// not sequenced and not recorded in history.
    pub fn subscribe_seeded<F>(
        &self,
        topic: Topic,
        sink: Arc<dyn EventSink>,
        seed: F,
    ) -> Result<Subscription, SinkError>
    where
        F: FnOnce(u64) -> EventPayload,
    {
        let mut inner = self.inner.lock();
        let event = Event::new(seed(inner.last_seq));
        sink.seed(&event)?;
        let id = inner.attach(topic, sink);
        Ok(Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Explicitly end a subscription. Equivalent to dropping the handle.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().last_seq
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// The most recent `limit` retained events, optionally of one kind, oldest first.
    #[must_use]
    pub fn history(&self, kind: Option<EventKind>, limit: usize) -> Vec<Event> {
        let inner = self.inner.lock();
        let mut recent: Vec<Event> = inner
            .history
            .iter()
            .rev()
            .filter(|event| kind.map_or(true, |kind| event.kind() == kind))
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        recent
    }
}

/// Handle returned by `subscribe`; dropping it removes the subscription.
#[must_use = "dropping a subscription immediately unsubscribes it"]
pub struct Subscription {
    id: u64,
    bus: Weak<Mutex<BusInner>>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.lock().remove(self.id);
        }
    }
}

struct QueueState {
    /// Seed slot; read before `events` and exempt from eviction.
    head: Option<Event>,
    events: VecDeque<Event>,
    closed: bool,
}

impl QueueState {
    fn pop(&mut self) -> Option<Event> {
        self.head.take().or_else(|| self.events.pop_front())
    }
}

/// Bounded per-subscriber queue with drop-oldest back-pressure.
pub struct QueueSink {
    state: Mutex<QueueState>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl QueueSink {
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        Arc::new(Self {
            state: Mutex::new(QueueState {
                head: None,
                events: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            capacity,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        })
    }

    /// Wait for the next queued event. Returns `None` once closed and drained.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(event) = state.pop() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.state.lock().pop()
    }

    /// Stop accepting events and wake any waiting receiver.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.events.len() + usize::from(state.head.is_some())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for QueueSink {
    fn deliver(&self, event: &Event) -> Result<(), SinkError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SinkError::Closed);
            }
            if state.events.len() >= self.capacity {
                state.events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.events.push_back(event.clone());
        }
        self.notify.notify_one();
        Ok(())
    }

    fn seed(&self, event: &Event) -> Result<(), SinkError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(SinkError::Closed);
            }
            state.head = Some(event.clone());
        }
        self.notify.notify_one();
        Ok(())
    }
}
