//! Authoritative in-memory view of the control plane, folded from the event stream.
//!
//! [`StateAggregator::apply`] is the only mutation path. Command handlers never write to
//! the aggregator directly; they publish events, and the aggregator (subscribed to
//! every topic) folds them in.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::NaiveDate;
use helm_core::{
    Balance, Event, EventPayload, ExchangeConnection, Order, OrderId, OrderStatus, Position,
    Price, PriceUpdate, StateSnapshot, StrategyChange, StrategyEvent, StrategyId,
    StrategyInstance, StrategyStatus, Symbol, Trade, VenueId,
};
use helm_core::{ConnectionChange, ConnectionEvent};
use helm_events::{EventSink, SinkError};
use parking_lot::RwLock;
use rust_decimal::Decimal;

mod repository;

pub use repository::{JsonStateRepository, StateError, StateRepository, StateResult};

/// Number of closed order ids and trade ids remembered for deduplication.
pub const DEDUP_WINDOW: usize = 10_000;

/// What `apply` did with an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ApplyOutcome {
    Applied,
    /// Already folded in (replayed sequence number or repeated trade id).
    Duplicate,
    /// Carries nothing the aggregator tracks, or would resurrect a closed order.
    Ignored,
}

/// Insertion-ordered set that forgets its oldest entries past a fixed size.
#[derive(Debug, Default)]
struct RecentIds {
    order: VecDeque<String>,
    members: HashSet<String>,
    limit: usize,
}

impl RecentIds {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            limit,
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    fn insert(&mut self, id: &str) -> bool {
        if !self.members.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

#[derive(Debug)]
struct AggregateState {
    strategies: BTreeMap<StrategyId, StrategyInstance>,
    orders: BTreeMap<OrderId, Order>,
    positions: BTreeMap<Symbol, Position>,
    balances: BTreeMap<String, Balance>,
    connections: BTreeMap<VenueId, ExchangeConnection>,
    prices: BTreeMap<Symbol, PriceUpdate>,
    engine_running: bool,
    total_trades: u64,
    realized_pnl: Price,
    /// Realized PnL of the most recent UTC trading day seen in a trade.
    daily_pnl: Option<(NaiveDate, Price)>,
    last_seq: u64,
    closed_orders: RecentIds,
    seen_trades: RecentIds,
}

impl Default for AggregateState {
    fn default() -> Self {
        Self {
            strategies: BTreeMap::new(),
            orders: BTreeMap::new(),
            positions: BTreeMap::new(),
            balances: BTreeMap::new(),
            connections: BTreeMap::new(),
            prices: BTreeMap::new(),
            engine_running: false,
            total_trades: 0,
            realized_pnl: Decimal::ZERO,
            daily_pnl: None,
            last_seq: 0,
            closed_orders: RecentIds::new(DEDUP_WINDOW),
            seen_trades: RecentIds::new(DEDUP_WINDOW),
        }
    }
}

impl AggregateState {
    fn fold(&mut self, payload: &EventPayload) -> ApplyOutcome {
        match payload {
            EventPayload::Snapshot(snapshot) => {
                self.replace(snapshot);
                ApplyOutcome::Applied
            }
            EventPayload::OrderUpdate(order) => self.fold_order(order),
            EventPayload::Trade(trade) => self.fold_trade(trade),
            EventPayload::Position(position) => {
                self.fold_position(position);
                ApplyOutcome::Applied
            }
            EventPayload::Balance(balance) => {
                self.balances.insert(balance.key(), balance.clone());
                ApplyOutcome::Applied
            }
            EventPayload::Price(update) => {
                self.fold_price(update);
                ApplyOutcome::Applied
            }
            EventPayload::Strategy(event) => {
                self.fold_strategy(event);
                ApplyOutcome::Applied
            }
            EventPayload::Connection(event) => {
                self.fold_connection(event);
                ApplyOutcome::Applied
            }
            EventPayload::Connected { .. } => {
                self.engine_running = true;
                ApplyOutcome::Applied
            }
            EventPayload::Disconnected { .. } => {
                self.engine_running = false;
                ApplyOutcome::Applied
            }
            EventPayload::Log(_)
            | EventPayload::Error(_)
            | EventPayload::SystemStatus(_)
            | EventPayload::Ping
            | EventPayload::Pong => ApplyOutcome::Ignored,
        }
    }

    fn replace(&mut self, snapshot: &StateSnapshot) {
        let last_seq = snapshot.last_seq;
        *self = Self::default();
        self.strategies = snapshot
            .strategies
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();
        self.orders = snapshot
            .orders
            .iter()
            .map(|o| (o.id.clone(), o.clone()))
            .collect();
        self.positions = snapshot
            .positions
            .iter()
            .map(|p| (p.symbol.clone(), p.clone()))
            .collect();
        self.balances = snapshot
            .balances
            .iter()
            .map(|b| (b.key(), b.clone()))
            .collect();
        self.connections = snapshot
            .connections
            .iter()
            .map(|c| (c.id.clone(), c.clone()))
            .collect();
        self.prices = snapshot
            .prices
            .iter()
            .map(|p| (p.symbol.clone(), p.clone()))
            .collect();
        self.engine_running = snapshot.engine_running;
        self.total_trades = snapshot.total_trades;
        self.realized_pnl = snapshot.realized_pnl;
        self.daily_pnl = None;
        self.last_seq = last_seq;
        self.closed_orders.clear();
        self.seen_trades.clear();
    }

    fn fold_order(&mut self, order: &Order) -> ApplyOutcome {
        if self.closed_orders.contains(&order.id) {
            return ApplyOutcome::Ignored;
        }
        let first_sighting = !self.orders.contains_key(&order.id);
        if first_sighting {
            if let Some(strategy) = order
                .strategy_id
                .as_ref()
                .and_then(|id| self.strategies.get_mut(id))
            {
                strategy.stats.total_orders += 1;
            }
        }
        if order.status.is_open() {
            self.orders.insert(order.id.clone(), order.clone());
        } else {
            self.orders.remove(&order.id);
            self.closed_orders.insert(&order.id);
        }
        ApplyOutcome::Applied
    }

    fn fold_trade(&mut self, trade: &Trade) -> ApplyOutcome {
        if !self.seen_trades.insert(&trade.trade_id) {
            return ApplyOutcome::Duplicate;
        }
        self.total_trades += 1;
        self.realized_pnl += trade.realized_pnl;
        let day = trade.executed_at.date_naive();
        match self.daily_pnl {
            Some((current, ref mut pnl)) if current == day => *pnl += trade.realized_pnl,
            Some((current, _)) if current > day => {}
            _ => self.daily_pnl = Some((day, trade.realized_pnl)),
        }
        if let Some(strategy) = trade
            .strategy_id
            .as_ref()
            .and_then(|id| self.strategies.get_mut(id))
        {
            strategy.stats.total_trades += 1;
            strategy.stats.realized_pnl += trade.realized_pnl;
        }
        ApplyOutcome::Applied
    }

    fn fold_position(&mut self, position: &Position) {
        let previous = if position.is_flat() {
            self.positions.remove(&position.symbol)
        } else {
            self.positions
                .insert(position.symbol.clone(), position.clone())
        };
        let mut touched: Vec<StrategyId> = Vec::new();
        touched.extend(previous.and_then(|p| p.strategy_id));
        touched.extend(position.strategy_id.clone());
        touched.dedup();
        for id in touched {
            self.refresh_unrealized(&id);
        }
    }

    fn fold_price(&mut self, update: &PriceUpdate) {
        self.prices.insert(update.symbol.clone(), update.clone());
        let mut touched = Vec::new();
        if let Some(position) = self.positions.get_mut(&update.symbol) {
            position.mark_price(update.price);
            touched.extend(position.strategy_id.clone());
        }
        for id in touched {
            self.refresh_unrealized(&id);
        }
    }

    fn refresh_unrealized(&mut self, strategy_id: &str) {
        let unrealized: Price = self
            .positions
            .values()
            .filter(|p| p.strategy_id.as_deref() == Some(strategy_id))
            .map(|p| p.unrealized_pnl)
            .sum();
        if let Some(strategy) = self.strategies.get_mut(strategy_id) {
            strategy.stats.unrealized_pnl = unrealized;
        }
    }

    fn fold_strategy(&mut self, event: &StrategyEvent) {
        let incoming = &event.strategy;
        if event.change == StrategyChange::Deleted {
            self.strategies.remove(&incoming.id);
            return;
        }
        let mut next = incoming.clone();
        if let Some(existing) = self.strategies.get(&incoming.id) {
            // Counters are derived from order/trade/position events, never from the
            // copy a command handler happened to read.
            next.stats = existing.stats.clone();
        }
        self.strategies.insert(next.id.clone(), next);
    }

    fn fold_connection(&mut self, event: &ConnectionEvent) {
        match event.change {
            ConnectionChange::Deleted => {
                self.connections.remove(&event.connection.id);
            }
            ConnectionChange::Created | ConnectionChange::Tested => {
                self.connections
                    .insert(event.connection.id.clone(), event.connection.clone());
            }
        }
    }

    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            strategies: self.strategies.values().cloned().collect(),
            orders: self.orders.values().cloned().collect(),
            positions: self.positions.values().cloned().collect(),
            balances: self.balances.values().cloned().collect(),
            connections: self.connections.values().cloned().collect(),
            prices: self.prices.values().cloned().collect(),
            engine_running: self.engine_running,
            total_trades: self.total_trades,
            realized_pnl: self.realized_pnl,
            last_seq: self.last_seq,
        }
    }
}

/// Filter accepted by [`StateAggregator::orders`].
#[derive(Clone, Debug, Default)]
pub struct OrderFilter {
    pub symbol: Option<String>,
    pub status: Option<OrderStatus>,
    pub strategy_id: Option<StrategyId>,
    pub venue: Option<VenueId>,
}

impl OrderFilter {
    fn matches(&self, order: &Order) -> bool {
        self.symbol.as_ref().map_or(true, |s| &order.symbol == s)
            && self.status.map_or(true, |s| order.status == s)
            && self
                .strategy_id
                .as_ref()
                .map_or(true, |id| order.strategy_id.as_ref() == Some(id))
            && self.venue.as_ref().map_or(true, |v| &order.venue == v)
    }
}

/// Engine-wide counters used by status reporting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Totals {
    pub strategies: usize,
    pub active_strategies: usize,
    pub total_trades: u64,
    pub realized_pnl: Price,
    pub engine_running: bool,
}

/// Explicitly owned aggregate of strategies, orders, positions, and balances.
#[derive(Debug, Default)]
pub struct StateAggregator {
    state: RwLock<AggregateState>,
}

impl StateAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the aggregate.
    ///
    /// Published events are deduplicated by sequence number; trades are additionally
    /// deduplicated by `trade_id`, so replaying a stream never double counts.
    pub fn apply(&self, event: &Event) -> ApplyOutcome {
        let mut state = self.state.write();
        if event.seq != 0 && event.seq <= state.last_seq {
            return ApplyOutcome::Duplicate;
        }
        let outcome = state.fold(&event.payload);
        if event.seq > state.last_seq && !matches!(event.payload, EventPayload::Snapshot(_)) {
            state.last_seq = event.seq;
        }
        outcome
    }

    /// Rebuild state from a persisted snapshot through the regular `apply` path.
    pub fn restore(&self, snapshot: StateSnapshot) -> ApplyOutcome {
        self.apply(&Event::new(EventPayload::Snapshot(snapshot)))
    }

    /// Deep point-in-time copy.
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.read().snapshot()
    }

    pub fn last_seq(&self) -> u64 {
        self.state.read().last_seq
    }

    pub fn strategy(&self, id: &str) -> Option<StrategyInstance> {
        self.state.read().strategies.get(id).cloned()
    }

    pub fn strategies(&self) -> Vec<StrategyInstance> {
        self.state.read().strategies.values().cloned().collect()
    }

    /// Strategies whose status is in `statuses`.
    pub fn strategies_in(&self, statuses: &[StrategyStatus]) -> Vec<StrategyInstance> {
        self.state
            .read()
            .strategies
            .values()
            .filter(|s| statuses.contains(&s.status))
            .cloned()
            .collect()
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.state.read().orders.get(id).cloned()
    }

    pub fn orders(&self, filter: &OrderFilter) -> Vec<Order> {
        self.state
            .read()
            .orders
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect()
    }

    pub fn positions(&self) -> Vec<Position> {
        self.state.read().positions.values().cloned().collect()
    }

    pub fn balances(&self) -> Vec<Balance> {
        self.state.read().balances.values().cloned().collect()
    }

    pub fn connection(&self, id: &str) -> Option<ExchangeConnection> {
        self.state.read().connections.get(id).cloned()
    }

    pub fn connections(&self) -> Vec<ExchangeConnection> {
        self.state.read().connections.values().cloned().collect()
    }

    pub fn last_price(&self, symbol: &str) -> Option<Price> {
        self.state.read().prices.get(symbol).map(|p| p.price)
    }

    /// Realized PnL of trades executed on `day` (UTC). Only the latest day is kept.
    pub fn realized_pnl_on(&self, day: NaiveDate) -> Price {
        match self.state.read().daily_pnl {
            Some((current, pnl)) if current == day => pnl,
            _ => Decimal::ZERO,
        }
    }

    pub fn totals(&self) -> Totals {
        let state = self.state.read();
        Totals {
            strategies: state.strategies.len(),
            active_strategies: state
                .strategies
                .values()
                .filter(|s| s.status == StrategyStatus::Running)
                .count(),
            total_trades: state.total_trades,
            realized_pnl: state.realized_pnl,
            engine_running: state.engine_running,
        }
    }
}

impl EventSink for StateAggregator {
    fn deliver(&self, event: &Event) -> Result<(), SinkError> {
        self.apply(event);
        Ok(())
    }
}

/// Prepare a persisted snapshot for restoring into a fresh process.
///
/// Only durable configuration survives a restart: strategies (active ones demoted to
/// `Stopped`, since nothing runs them yet) and the lifetime trade counters. Orders,
/// positions, balances, and exchange connections are re-learned from the venues.
#[must_use]
pub fn restorable(mut snapshot: StateSnapshot) -> StateSnapshot {
    for strategy in &mut snapshot.strategies {
        if strategy.status.is_active() {
            *strategy = strategy.with_status(StrategyStatus::Stopped);
        }
        strategy.stats.unrealized_pnl = Decimal::ZERO;
    }
    StateSnapshot {
        strategies: snapshot.strategies,
        total_trades: snapshot.total_trades,
        realized_pnl: snapshot.realized_pnl,
        last_seq: 0,
        ..StateSnapshot::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use helm_core::{OrderRequest, OrderType, Side, StrategyStats};
    use serde_json::Map;

    fn strategy(id: &str, status: StrategyStatus) -> StrategyInstance {
        let now = Utc::now();
        StrategyInstance {
            id: id.into(),
            name: format!("{id}-name"),
            kind: "pure_market_making".into(),
            exchange: "paper".into(),
            pair: "BTC-USDT".into(),
            status,
            config: Map::new(),
            stats: StrategyStats::default(),
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    fn order(id: &str, status: OrderStatus, strategy_id: Option<&str>) -> Order {
        let request = OrderRequest {
            symbol: "BTC-USDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            quantity: Decimal::ONE,
            price: Some(Decimal::from(100)),
            strategy_id: strategy_id.map(str::to_string),
            client_order_id: None,
        };
        Order::from_request(id.into(), "primary", &request).with_status(status)
    }

    fn trade(trade_id: &str, pnl: i64, strategy_id: &str) -> Trade {
        Trade {
            trade_id: trade_id.into(),
            order_id: "o-1".into(),
            symbol: "BTC-USDT".into(),
            side: Side::Sell,
            price: Decimal::from(101),
            quantity: Decimal::ONE,
            fee: Decimal::ZERO,
            realized_pnl: Decimal::from(pnl),
            strategy_id: Some(strategy_id.into()),
            executed_at: Utc::now(),
        }
    }

    fn sequenced(seq: u64, payload: EventPayload) -> Event {
        let mut event = Event::new(payload);
        event.seq = seq;
        event
    }

    fn created(instance: StrategyInstance) -> EventPayload {
        EventPayload::Strategy(StrategyEvent {
            change: StrategyChange::Created,
            strategy: instance,
        })
    }

    #[test]
    fn replayed_trade_counts_once() {
        let aggregator = StateAggregator::new();
        aggregator.apply(&sequenced(1, created(strategy("s1", StrategyStatus::Running))));
        let fill = EventPayload::Trade(trade("t-1", 5, "s1"));
        assert_eq!(
            aggregator.apply(&sequenced(2, fill.clone())),
            ApplyOutcome::Applied
        );
        // Same event redelivered.
        assert_eq!(
            aggregator.apply(&sequenced(2, fill.clone())),
            ApplyOutcome::Duplicate
        );
        // Same trade republished under a new sequence number.
        assert_eq!(
            aggregator.apply(&sequenced(3, fill)),
            ApplyOutcome::Duplicate
        );
        let stats = aggregator.strategy("s1").unwrap().stats;
        assert_eq!(stats.total_trades, 1);
        assert_eq!(stats.realized_pnl, Decimal::from(5));
        assert_eq!(aggregator.totals().total_trades, 1);
        assert_eq!(aggregator.last_seq(), 3);
    }

    #[test]
    fn daily_pnl_rolls_over_with_the_trade_date() {
        let aggregator = StateAggregator::new();
        let today = Utc::now();
        let yesterday = today - chrono::Duration::days(1);
        let mut old = trade("t-0", -7, "s1");
        old.executed_at = yesterday;
        aggregator.apply(&sequenced(1, EventPayload::Trade(old)));
        assert_eq!(
            aggregator.realized_pnl_on(yesterday.date_naive()),
            Decimal::from(-7)
        );

        aggregator.apply(&sequenced(2, EventPayload::Trade(trade("t-1", -3, "s1"))));
        aggregator.apply(&sequenced(3, EventPayload::Trade(trade("t-2", 1, "s1"))));
        assert_eq!(
            aggregator.realized_pnl_on(today.date_naive()),
            Decimal::from(-2)
        );
        assert_eq!(aggregator.realized_pnl_on(yesterday.date_naive()), Decimal::ZERO);
        assert_eq!(aggregator.totals().realized_pnl, Decimal::from(-9));
    }

    #[test]
    fn closed_orders_are_not_resurrected() {
        let aggregator = StateAggregator::new();
        aggregator.apply(&sequenced(1, created(strategy("s1", StrategyStatus::Running))));
        aggregator.apply(&sequenced(
            2,
            EventPayload::OrderUpdate(order("o-1", OrderStatus::New, Some("s1"))),
        ));
        assert_eq!(aggregator.orders(&OrderFilter::default()).len(), 1);
        aggregator.apply(&sequenced(
            3,
            EventPayload::OrderUpdate(order("o-1", OrderStatus::Cancelled, Some("s1"))),
        ));
        let late = aggregator.apply(&sequenced(
            4,
            EventPayload::OrderUpdate(order("o-1", OrderStatus::PartiallyFilled, Some("s1"))),
        ));
        assert_eq!(late, ApplyOutcome::Ignored);
        assert!(aggregator.order("o-1").is_none());
        assert_eq!(aggregator.strategy("s1").unwrap().stats.total_orders, 1);
    }

    #[test]
    fn strategy_updates_keep_derived_counters() {
        let aggregator = StateAggregator::new();
        let instance = strategy("s1", StrategyStatus::Created);
        aggregator.apply(&sequenced(1, created(instance.clone())));
        aggregator.apply(&sequenced(2, EventPayload::Trade(trade("t-1", 3, "s1"))));
        aggregator.apply(&sequenced(
            3,
            EventPayload::Strategy(StrategyEvent {
                change: StrategyChange::Started,
                strategy: instance.with_status(StrategyStatus::Running),
            }),
        ));
        let current = aggregator.strategy("s1").unwrap();
        assert_eq!(current.status, StrategyStatus::Running);
        assert_eq!(current.stats.total_trades, 1);
    }

    #[test]
    fn positions_drive_unrealized_pnl() {
        let aggregator = StateAggregator::new();
        aggregator.apply(&sequenced(1, created(strategy("s1", StrategyStatus::Running))));
        let position = Position {
            symbol: "BTC-USDT".into(),
            side: Some(Side::Buy),
            quantity: Decimal::from(2),
            entry_price: Some(Decimal::from(100)),
            unrealized_pnl: Decimal::ZERO,
            strategy_id: Some("s1".into()),
            updated_at: Utc::now(),
        };
        aggregator.apply(&sequenced(2, EventPayload::Position(position.clone())));
        aggregator.apply(&sequenced(
            3,
            EventPayload::Price(PriceUpdate {
                symbol: "BTC-USDT".into(),
                price: Decimal::from(110),
                bid: None,
                ask: None,
            }),
        ));
        assert_eq!(
            aggregator.strategy("s1").unwrap().stats.unrealized_pnl,
            Decimal::from(20)
        );
        let flat = Position {
            quantity: Decimal::ZERO,
            side: None,
            ..position
        };
        aggregator.apply(&sequenced(4, EventPayload::Position(flat)));
        assert!(aggregator.positions().is_empty());
        assert_eq!(
            aggregator.strategy("s1").unwrap().stats.unrealized_pnl,
            Decimal::ZERO
        );
    }

    #[test]
    fn snapshot_replaces_state_and_round_trips() {
        let source = StateAggregator::new();
        source.apply(&sequenced(1, created(strategy("s1", StrategyStatus::Paused))));
        source.apply(&sequenced(
            2,
            EventPayload::OrderUpdate(order("o-1", OrderStatus::New, Some("s1"))),
        ));
        source.apply(&sequenced(3, EventPayload::Connected { message: String::new() }));
        let snapshot = source.snapshot();
        assert_eq!(snapshot.last_seq, 3);

        let replica = StateAggregator::new();
        replica.apply(&sequenced(1, created(strategy("other", StrategyStatus::Created))));
        assert_eq!(replica.restore(snapshot.clone()), ApplyOutcome::Applied);
        assert_eq!(replica.snapshot(), snapshot);
        assert!(replica.strategy("other").is_none());
        assert!(replica.totals().engine_running);
    }

    #[test]
    fn restorable_keeps_configuration_only() {
        let source = StateAggregator::new();
        source.apply(&sequenced(1, created(strategy("s1", StrategyStatus::Running))));
        source.apply(&sequenced(
            2,
            EventPayload::OrderUpdate(order("o-1", OrderStatus::New, Some("s1"))),
        ));
        let restored = restorable(source.snapshot());
        assert_eq!(restored.strategies[0].status, StrategyStatus::Stopped);
        assert!(restored.orders.is_empty());
        assert_eq!(restored.last_seq, 0);
    }

    #[test]
    fn log_events_are_ignored_but_advance_sequence() {
        let aggregator = StateAggregator::new();
        let outcome = aggregator.apply(&sequenced(
            9,
            EventPayload::error("test", "nothing to fold"),
        ));
        assert_eq!(outcome, ApplyOutcome::Ignored);
        assert_eq!(aggregator.last_seq(), 9);
    }
}
