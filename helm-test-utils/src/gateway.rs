use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use helm_broker::{BrokerError, BrokerInfo, BrokerResult, ExchangeGateway};
use helm_core::{
    Balance, Order, OrderId, OrderRequest, OrderStatus, OrderType, Position, Price, VenueId,
    PRIMARY_VENUE,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::time::Duration;

/// Gateway operation that a scripted failure can target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GatewayOp {
    PlaceOrder,
    CancelOrder,
    OpenOrders,
    Balances,
    Positions,
    Ping,
    Close,
}

/// One recorded call against the mock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GatewayCall {
    pub op: GatewayOp,
    /// Order id or symbol the call was about, when it had one.
    pub target: Option<String>,
}

#[derive(Clone, Debug)]
struct ScriptedFailure {
    op: GatewayOp,
    target: Option<String>,
    error: String,
    sticky: bool,
}

impl ScriptedFailure {
    fn matches(&self, op: GatewayOp, target: Option<&str>) -> bool {
        self.op == op
            && self
                .target
                .as_deref()
                .map_or(true, |wanted| target == Some(wanted))
    }
}

#[derive(Default)]
struct MockBook {
    open: BTreeMap<OrderId, Order>,
    balances: Vec<Balance>,
    positions: Vec<Position>,
    prices: BTreeMap<String, Price>,
}

/// Deterministic exchange gateway with scripted failures and a call log.
pub struct MockGateway {
    venue: VenueId,
    book: Mutex<MockBook>,
    failures: Mutex<Vec<ScriptedFailure>>,
    calls: Mutex<Vec<GatewayCall>>,
    next_id: AtomicU64,
    delay: Mutex<Option<Duration>>,
}

impl MockGateway {
    pub fn new(venue: impl Into<VenueId>) -> Self {
        Self {
            venue: venue.into(),
            book: Mutex::new(MockBook::default()),
            failures: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            delay: Mutex::new(None),
        }
    }

    /// Gateway registered as the default venue.
    pub fn primary() -> Self {
        Self::new(PRIMARY_VENUE)
    }

    #[must_use]
    pub fn with_balance(self, currency: &str, amount: Decimal) -> Self {
        self.book.lock().balances.push(Balance {
            currency: currency.to_string(),
            free: amount,
            locked: Decimal::ZERO,
            total: amount,
            exchange: self.venue.clone(),
        });
        self
    }

    #[must_use]
    pub fn with_position(self, position: Position) -> Self {
        self.book.lock().positions.push(position);
        self
    }

    /// Price used to fill market orders for `symbol`.
    #[must_use]
    pub fn with_market_price(self, symbol: &str, price: Price) -> Self {
        self.book.lock().prices.insert(symbol.to_string(), price);
        self
    }

    /// Fail the next call of `op` once.
    pub fn fail_next(&self, op: GatewayOp, error: impl Into<String>) {
        self.failures.lock().push(ScriptedFailure {
            op,
            target: None,
            error: error.into(),
            sticky: false,
        });
    }

    /// Fail every call of `op` until [`MockGateway::clear_failures`].
    pub fn fail_always(&self, op: GatewayOp, error: impl Into<String>) {
        self.failures.lock().push(ScriptedFailure {
            op,
            target: None,
            error: error.into(),
            sticky: true,
        });
    }

    /// Reject every cancel of `order_id`.
    pub fn fail_cancel(&self, order_id: &str, error: impl Into<String>) {
        self.failures.lock().push(ScriptedFailure {
            op: GatewayOp::CancelOrder,
            target: Some(order_id.to_string()),
            error: error.into(),
            sticky: true,
        });
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Delay every call, for timeout tests.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, op: GatewayOp) -> usize {
        self.calls.lock().iter().filter(|call| call.op == op).count()
    }

    pub fn open_order_ids(&self) -> Vec<OrderId> {
        self.book.lock().open.keys().cloned().collect()
    }

    async fn enter(&self, op: GatewayOp, target: Option<&str>) -> BrokerResult<()> {
        self.calls.lock().push(GatewayCall {
            op,
            target: target.map(str::to_string),
        });
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut failures = self.failures.lock();
        match failures.iter().position(|f| f.matches(op, target)) {
            Some(idx) if failures[idx].sticky => {
                Err(BrokerError::Exchange(failures[idx].error.clone()))
            }
            Some(idx) => Err(BrokerError::Exchange(failures.remove(idx).error)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExchangeGateway for MockGateway {
    fn info(&self) -> BrokerInfo {
        BrokerInfo {
            name: format!("mock:{}", self.venue),
            markets: Vec::new(),
            supports_testnet: true,
        }
    }

    fn venue(&self) -> VenueId {
        self.venue.clone()
    }

    async fn place_order(&self, request: OrderRequest) -> BrokerResult<Order> {
        self.enter(GatewayOp::PlaceOrder, Some(&request.symbol))
            .await?;
        if request.order_type == OrderType::Limit && request.price.is_none() {
            return Err(BrokerError::InvalidRequest("limit order requires a price".into()));
        }
        let id = format!(
            "{}-{}",
            self.venue,
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        );
        let mut order = Order::from_request(id, self.venue.clone(), &request);
        let mut book = self.book.lock();
        match request.order_type {
            OrderType::Market => {
                order.price = book
                    .prices
                    .get(&request.symbol)
                    .copied()
                    .or(request.price);
                order.filled_quantity = order.quantity;
                order.status = OrderStatus::Filled;
            }
            OrderType::Limit => {
                book.open.insert(order.id.clone(), order.clone());
            }
        }
        order.updated_at = Utc::now();
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &OrderId, _symbol: &str) -> BrokerResult<()> {
        self.enter(GatewayOp::CancelOrder, Some(order_id)).await?;
        // Orders the mock never saw are treated as resting elsewhere.
        self.book.lock().open.remove(order_id);
        Ok(())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> BrokerResult<Vec<Order>> {
        self.enter(GatewayOp::OpenOrders, symbol).await?;
        Ok(self
            .book
            .lock()
            .open
            .values()
            .filter(|order| symbol.map_or(true, |s| order.symbol == s))
            .cloned()
            .collect())
    }

    async fn balances(&self) -> BrokerResult<Vec<Balance>> {
        self.enter(GatewayOp::Balances, None).await?;
        Ok(self.book.lock().balances.clone())
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        self.enter(GatewayOp::Positions, None).await?;
        Ok(self.book.lock().positions.clone())
    }

    async fn ping(&self) -> BrokerResult<bool> {
        self.enter(GatewayOp::Ping, None).await?;
        Ok(true)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.enter(GatewayOp::Close, None).await
    }
}
