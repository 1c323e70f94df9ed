//! Connection registry: the exclusive owner of every live client connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use helm_events::Subscription;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

/// Lifecycle of a registered connection. `Closed` entries are removed from the registry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why the registry asked a session to shut down.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// A newer connection registered with the same client id.
    Replaced,
    Shutdown,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection limit of {0} reached")]
    Full(usize),
}

/// Public view of one registered connection.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub generation: u64,
    pub state: ConnectionState,
    pub path: String,
    pub connected_at: DateTime<Utc>,
    pub last_pong_at: Option<DateTime<Utc>>,
    pub missed_pongs: u32,
}

/// Handle returned to the session that owns a registration.
#[derive(Debug)]
pub struct Registration {
    pub id: String,
    pub generation: u64,
    /// Resolves when the registry evicts this connection.
    pub close_rx: oneshot::Receiver<CloseReason>,
}

struct Entry {
    info: ConnectionInfo,
    close_tx: Option<oneshot::Sender<CloseReason>>,
    subscription: Option<Subscription>,
}

impl Entry {
    fn evict(&mut self, reason: CloseReason) -> Option<Subscription> {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(reason);
        }
        self.info.state = ConnectionState::Closing;
        self.subscription.take()
    }
}

#[derive(Default)]
struct RegistryInner {
    entries: BTreeMap<String, Entry>,
    next_generation: u64,
    next_anonymous: u64,
}

/// Tracks live connections by client id.
///
/// Every registration carries a generation. Mutations that name a stale generation are
/// ignored, so a session that was replaced can never tear down its successor.
/// Event bus subscriptions are owned here and dropped outside the registry lock.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
    max_clients: usize,
}

impl ConnectionRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner::default())),
            max_clients: max_clients.max(1),
        }
    }

    /// Resolve the id a client asked for, or allocate `client_{n}`.
    pub fn assign_id(&self, requested: Option<&str>) -> String {
        if let Some(id) = requested.filter(|id| valid_client_id(id)) {
            return id.to_string();
        }
        let mut inner = self.inner.lock();
        inner.next_anonymous += 1;
        format!("client_{}", inner.next_anonymous)
    }

    /// Register a connection in `Connecting` state.
    ///
    /// An existing connection with the same id is evicted with [`CloseReason::Replaced`].
    pub fn register(&self, id: &str, path: &str) -> Result<Registration, RegistryError> {
        let (registration, stale) = {
            let mut inner = self.inner.lock();
            let stale = match inner.entries.remove(id) {
                Some(mut previous) => previous.evict(CloseReason::Replaced),
                None if inner.entries.len() >= self.max_clients => {
                    return Err(RegistryError::Full(self.max_clients))
                }
                None => None,
            };
            inner.next_generation += 1;
            let generation = inner.next_generation;
            let (close_tx, close_rx) = oneshot::channel();
            inner.entries.insert(
                id.to_string(),
                Entry {
                    info: ConnectionInfo {
                        id: id.to_string(),
                        generation,
                        state: ConnectionState::Connecting,
                        path: path.to_string(),
                        connected_at: Utc::now(),
                        last_pong_at: None,
                        missed_pongs: 0,
                    },
                    close_tx: Some(close_tx),
                    subscription: None,
                },
            );
            (
                Registration {
                    id: id.to_string(),
                    generation,
                    close_rx,
                },
                stale,
            )
        };
        drop(stale);
        Ok(registration)
    }

    /// Hand the connection's bus subscription to the registry and mark it `Open`.
    ///
    /// Returns `false` (dropping the subscription) when the registration is stale.
    pub fn attach(&self, id: &str, generation: u64, subscription: Subscription) -> bool {
        let rejected = {
            let mut inner = self.inner.lock();
            match inner.entries.get_mut(id) {
                Some(entry)
                    if entry.info.generation == generation
                        && entry.info.state == ConnectionState::Connecting =>
                {
                    entry.subscription = Some(subscription);
                    entry.info.state = ConnectionState::Open;
                    None
                }
                _ => Some(subscription),
            }
        };
        rejected.is_none()
    }

    pub fn record_pong(&self, id: &str, generation: u64) {
        self.with_entry(id, generation, |entry| {
            entry.info.last_pong_at = Some(Utc::now());
            entry.info.missed_pongs = 0;
        });
    }

    pub fn record_missed_pong(&self, id: &str, generation: u64) {
        self.with_entry(id, generation, |entry| entry.info.missed_pongs += 1);
    }

    /// Move to `Closing` and stop fan-out to this connection.
    pub fn mark_closing(&self, id: &str, generation: u64) {
        let subscription = {
            let mut inner = self.inner.lock();
            inner
                .entries
                .get_mut(id)
                .filter(|entry| entry.info.generation == generation)
                .and_then(|entry| {
                    entry.info.state = ConnectionState::Closing;
                    entry.subscription.take()
                })
        };
        drop(subscription);
    }

    /// Remove the registration once the transport is torn down.
    ///
    /// Returns `false` when `generation` no longer owns the id.
    pub fn remove(&self, id: &str, generation: u64) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            match inner.entries.get(id) {
                Some(entry) if entry.info.generation == generation => inner.entries.remove(id),
                _ => None,
            }
        };
        match removed {
            Some(mut entry) => {
                entry.info.state = ConnectionState::Closed;
                drop(entry.subscription.take());
                true
            }
            None => false,
        }
    }

    /// Ask every session to close. Entries are removed by their sessions.
    pub fn close_all(&self, reason: CloseReason) {
        let subscriptions: Vec<_> = {
            let mut inner = self.inner.lock();
            inner
                .entries
                .values_mut()
                .filter_map(|entry| entry.evict(reason))
                .collect()
        };
        drop(subscriptions);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ConnectionInfo> {
        self.inner
            .lock()
            .entries
            .get(id)
            .map(|entry| entry.info.clone())
    }

    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .lock()
            .entries
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    fn with_entry(&self, id: &str, generation: u64, apply: impl FnOnce(&mut Entry)) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner
            .entries
            .get_mut(id)
            .filter(|entry| entry.info.generation == generation)
        {
            apply(entry);
        }
    }
}

fn valid_client_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::EventPayload;
    use helm_events::{EventBus, QueueSink, Topic};

    fn subscription(bus: &EventBus) -> (Subscription, Arc<QueueSink>) {
        let sink = QueueSink::new(8);
        (bus.subscribe(Topic::All, sink.clone()), sink)
    }

    #[test]
    fn anonymous_ids_are_sequential() {
        let registry = ConnectionRegistry::new(4);
        assert_eq!(registry.assign_id(None), "client_1");
        assert_eq!(registry.assign_id(Some("bad id!")), "client_2");
        assert_eq!(registry.assign_id(Some("ui-main")), "ui-main");
    }

    #[test]
    fn lifecycle_moves_through_states() {
        let bus = EventBus::default();
        let registry = ConnectionRegistry::new(4);
        let reg = registry.register("a", "/ws").unwrap();
        assert_eq!(registry.get("a").unwrap().state, ConnectionState::Connecting);
        let (sub, sink) = subscription(&bus);
        assert!(registry.attach("a", reg.generation, sub));
        assert_eq!(registry.get("a").unwrap().state, ConnectionState::Open);

        bus.publish(EventPayload::Ping);
        assert_eq!(sink.len(), 1);

        registry.mark_closing("a", reg.generation);
        assert_eq!(registry.get("a").unwrap().state, ConnectionState::Closing);
        bus.publish(EventPayload::Ping);
        assert_eq!(sink.len(), 1, "closing connections receive no fan-out");

        assert!(registry.remove("a", reg.generation));
        assert!(registry.is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn same_id_replaces_previous_connection() {
        let bus = EventBus::default();
        let registry = ConnectionRegistry::new(4);
        let mut first = registry.register("ui", "/ws").unwrap();
        let (sub, _) = subscription(&bus);
        assert!(registry.attach("ui", first.generation, sub));

        let second = registry.register("ui", "/ws").unwrap();
        assert_eq!(first.close_rx.try_recv(), Ok(CloseReason::Replaced));
        assert_eq!(bus.subscriber_count(), 0);

        // The stale session's teardown must not remove its successor.
        assert!(!registry.remove("ui", first.generation));
        assert!(registry.contains("ui"));
        assert_eq!(registry.get("ui").unwrap().generation, second.generation);
    }

    #[test]
    fn stale_attach_is_rejected() {
        let bus = EventBus::default();
        let registry = ConnectionRegistry::new(4);
        let first = registry.register("ui", "/ws").unwrap();
        let _second = registry.register("ui", "/ws").unwrap();
        let (sub, _) = subscription(&bus);
        assert!(!registry.attach("ui", first.generation, sub));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = ConnectionRegistry::new(1);
        let _a = registry.register("a", "/ws").unwrap();
        let err = registry.register("b", "/ws").unwrap_err();
        assert_eq!(err, RegistryError::Full(1));
        assert_eq!(err.to_string(), "connection limit of 1 reached");
        // Reconnecting an existing id is a replacement, not a new slot.
        assert!(registry.register("a", "/ws").is_ok());
    }

    #[test]
    fn close_all_signals_every_session() {
        let registry = ConnectionRegistry::new(4);
        let mut a = registry.register("a", "/ws").unwrap();
        let mut b = registry.register("b", "/ws").unwrap();
        registry.close_all(CloseReason::Shutdown);
        assert_eq!(a.close_rx.try_recv(), Ok(CloseReason::Shutdown));
        assert_eq!(b.close_rx.try_recv(), Ok(CloseReason::Shutdown));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn pong_bookkeeping_ignores_stale_generation() {
        let registry = ConnectionRegistry::new(4);
        let reg = registry.register("a", "/ws").unwrap();
        registry.record_missed_pong("a", reg.generation);
        registry.record_missed_pong("a", reg.generation + 1);
        assert_eq!(registry.get("a").unwrap().missed_pongs, 1);
        registry.record_pong("a", reg.generation);
        let info = registry.get("a").unwrap();
        assert_eq!(info.missed_pongs, 0);
        assert!(info.last_pong_at.is_some());
    }
}
