//! In-process paper exchange and strategy driver used as the default collaborators.

mod strategy;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::Utc;
use helm_broker::{
    BrokerError, BrokerInfo, BrokerResult, ConnectorFactory, ExchangeCredentials,
    ExchangeGateway, VenueUpdate, VenueUpdateSender,
};
use helm_config::PaperConfig;
use helm_core::{
    Balance, Order, OrderId, OrderRequest, OrderStatus, OrderType, Position, Price, PriceUpdate,
    Quantity, Side, Symbol, Trade, VenueId,
};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use rust_decimal::{
    prelude::{FromPrimitive, ToPrimitive},
    Decimal,
};
use tokio::sync::oneshot;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use strategy::{PaperStrategyDriver, PAPER_STRATEGY_KINDS};

/// Exchange name answered by [`PaperConnectorFactory`].
pub const PAPER_EXCHANGE: &str = "paper";

#[derive(Default)]
struct Book {
    prices: HashMap<Symbol, Price>,
    resting: BTreeMap<OrderId, Order>,
    balances: BTreeMap<String, Balance>,
    positions: HashMap<Symbol, Position>,
}

/// Outcome of folding one fill into the book.
struct FillEffects {
    trade: Trade,
    position: Position,
    balance: Option<Balance>,
}

/// Simulated venue: random-walk prices, immediate market fills, resting limit orders.
pub struct PaperExchange {
    venue: VenueId,
    config: PaperConfig,
    fee_rate: Decimal,
    book: Mutex<Book>,
    updates: VenueUpdateSender,
    trade_seq: AtomicU64,
    closed: AtomicBool,
    market_task: Mutex<Option<oneshot::Sender<()>>>,
}

impl PaperExchange {
    pub fn new(venue: impl Into<VenueId>, config: PaperConfig, updates: VenueUpdateSender) -> Self {
        let venue = venue.into();
        let mut book = Book::default();
        for symbol in &config.symbols {
            book.prices.insert(symbol.clone(), config.start_price);
        }
        for (currency, amount) in &config.initial_balances {
            book.balances.insert(
                currency.clone(),
                Balance {
                    currency: currency.clone(),
                    free: *amount,
                    locked: Decimal::ZERO,
                    total: *amount,
                    exchange: venue.clone(),
                },
            );
        }
        let fee_rate = config.fee_bps.max(Decimal::ZERO) / Decimal::from(10_000);
        Self {
            venue,
            config,
            fee_rate,
            book: Mutex::new(book),
            updates,
            trade_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            market_task: Mutex::new(None),
        }
    }

    /// Spawn the random-walk price generator. It stops on `close` or when the exchange
    /// is dropped.
    pub fn start_market(self: &Arc<Self>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        if let Some(previous) = self.market_task.lock().replace(shutdown_tx) {
            let _ = previous.send(());
        }
        let weak = Arc::downgrade(self);
        let tick = Duration::from_millis(self.config.tick_interval_ms.max(10));
        let volatility = self.config.volatility;
        tokio::spawn(run_random_walk(weak, tick, volatility, shutdown_rx));
    }

    pub fn last_price(&self, symbol: &str) -> Option<Price> {
        self.book.lock().prices.get(symbol).copied()
    }

    /// Move the market for `symbol` and fill any resting order the new price crosses.
    pub fn set_price(&self, symbol: &str, price: Price) {
        let updates = {
            let mut book = self.book.lock();
            book.prices.insert(symbol.to_string(), price);
            let mut updates = vec![VenueUpdate::Price(PriceUpdate {
                symbol: symbol.to_string(),
                price,
                bid: None,
                ask: None,
            })];
            let crossed: Vec<OrderId> = book
                .resting
                .values()
                .filter(|order| order.symbol == symbol && limit_crosses(order, price))
                .map(|order| order.id.clone())
                .collect();
            for id in crossed {
                let Some(order) = book.resting.remove(&id) else {
                    continue;
                };
                let fill_price = order.price.unwrap_or(price);
                let filled = filled(&order);
                let mut effects = match self.apply_fill(&mut book, &filled, fill_price) {
                    Ok(effects) => effects,
                    Err(err) => {
                        warn!(venue = %self.venue, order_id = %id, error = %err, "resting order left open");
                        book.resting.insert(id, order);
                        continue;
                    }
                };
                self.release_lock(&mut book, &order);
                effects.balance = Some(self.quote_balance(&mut book).clone());
                updates.push(VenueUpdate::Order(filled));
                push_effects(&mut updates, effects);
            }
            updates
        };
        self.emit(updates);
    }

    fn emit(&self, updates: Vec<VenueUpdate>) {
        for update in updates {
            if self.updates.send(update).is_err() {
                debug!(venue = %self.venue, "venue update receiver dropped");
                break;
            }
        }
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport(format!(
                "paper session {} is closed",
                self.venue
            )));
        }
        Ok(())
    }

    fn next_trade_id(&self) -> String {
        let seq = self.trade_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-T{seq}", self.venue)
    }

    fn quote_balance<'a>(&self, book: &'a mut Book) -> &'a mut Balance {
        let currency = self.config.quote_currency.to_ascii_uppercase();
        book.balances
            .entry(currency.clone())
            .or_insert_with(|| Balance {
                currency,
                free: Decimal::ZERO,
                locked: Decimal::ZERO,
                total: Decimal::ZERO,
                exchange: self.venue.clone(),
            })
    }

    fn release_lock(&self, book: &mut Book, order: &Order) {
        if order.side != Side::Buy {
            return;
        }
        let reserved = order.price.unwrap_or_default() * order.remaining();
        let quote = self.quote_balance(book);
        quote.locked = (quote.locked - reserved).max(Decimal::ZERO);
        quote.free += reserved;
        quote.total = quote.free + quote.locked;
    }

    /// Settle cash, move the position, and compute realized PnL for one fill.
    ///
    /// Nothing in the book changes when an amount overflows.
    fn apply_fill(&self, book: &mut Book, order: &Order, price: Price) -> BrokerResult<FillEffects> {
        let quantity = order.quantity;
        let (notional, fee) = fill_amounts(price, quantity, self.fee_rate)?;
        let now = Utc::now();

        let mut position = book
            .positions
            .get(&order.symbol)
            .cloned()
            .unwrap_or_else(|| Position {
                symbol: order.symbol.clone(),
                side: None,
                quantity: Decimal::ZERO,
                entry_price: None,
                unrealized_pnl: Decimal::ZERO,
                strategy_id: None,
                updated_at: now,
            });
        let realized = fold_position(&mut position, order.side, price, quantity)?;
        let realized = realized.checked_sub(fee).ok_or_else(overflow)?;

        let quote = self.quote_balance(book);
        let free = match order.side {
            Side::Buy => quote.free.checked_sub(notional + fee),
            Side::Sell => quote.free.checked_add(notional - fee),
        }
        .ok_or_else(overflow)?;
        let total = free.checked_add(quote.locked).ok_or_else(overflow)?;
        quote.free = free;
        quote.total = total;
        let balance = Some(quote.clone());

        if order.strategy_id.is_some() {
            position.strategy_id = order.strategy_id.clone();
        }
        position.mark_price(price);
        if position.is_flat() {
            book.positions.remove(&order.symbol);
        } else {
            book.positions.insert(order.symbol.clone(), position.clone());
        }

        let trade = Trade {
            trade_id: self.next_trade_id(),
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            price,
            quantity,
            fee,
            realized_pnl: realized,
            strategy_id: order.strategy_id.clone(),
            executed_at: now,
        };
        Ok(FillEffects {
            trade,
            position,
            balance,
        })
    }
}

fn overflow() -> BrokerError {
    BrokerError::InvalidRequest("order amount is out of range".into())
}

/// Notional and fee of a fill. Their sum is guaranteed to fit.
fn fill_amounts(price: Price, quantity: Quantity, fee_rate: Decimal) -> BrokerResult<(Decimal, Decimal)> {
    let notional = price.checked_mul(quantity).ok_or_else(overflow)?;
    let fee = notional.checked_mul(fee_rate).ok_or_else(overflow)?;
    notional.checked_add(fee).ok_or_else(overflow)?;
    Ok((notional, fee))
}

/// Apply a fill to a position and return the gross realized PnL of the reduced part.
fn fold_position(
    position: &mut Position,
    side: Side,
    price: Price,
    quantity: Quantity,
) -> BrokerResult<Price> {
    match position.side {
        Some(current) if current == side => {
            let total = position.quantity.checked_add(quantity).ok_or_else(overflow)?;
            let cost = position
                .entry_price
                .unwrap_or(price)
                .checked_mul(position.quantity)
                .zip(price.checked_mul(quantity))
                .and_then(|(prev, added)| prev.checked_add(added))
                .ok_or_else(overflow)?;
            position.entry_price = Some(cost / total);
            position.quantity = total;
            Ok(Decimal::ZERO)
        }
        Some(current) => {
            let entry = position.entry_price.unwrap_or(price);
            let closed = quantity.min(position.quantity);
            let realized = match current {
                Side::Buy => price.checked_sub(entry),
                Side::Sell => entry.checked_sub(price),
            }
            .and_then(|diff| diff.checked_mul(closed))
            .ok_or_else(overflow)?;
            let remaining = position.quantity - quantity;
            if remaining > Decimal::ZERO {
                position.quantity = remaining;
            } else if remaining < Decimal::ZERO {
                position.side = Some(side);
                position.quantity = -remaining;
                position.entry_price = Some(price);
            } else {
                position.side = None;
                position.quantity = Decimal::ZERO;
                position.entry_price = None;
                position.unrealized_pnl = Decimal::ZERO;
            }
            Ok(realized)
        }
        None => {
            position.side = Some(side);
            position.quantity = quantity;
            position.entry_price = Some(price);
            Ok(Decimal::ZERO)
        }
    }
}

fn limit_crosses(order: &Order, market: Price) -> bool {
    match (order.side, order.price) {
        (Side::Buy, Some(limit)) => market <= limit,
        (Side::Sell, Some(limit)) => market >= limit,
        (_, None) => true,
    }
}

fn filled(order: &Order) -> Order {
    let mut next = order.with_status(OrderStatus::Filled);
    next.filled_quantity = order.quantity;
    next
}

fn push_effects(updates: &mut Vec<VenueUpdate>, effects: FillEffects) {
    updates.push(VenueUpdate::Trade(effects.trade));
    updates.push(VenueUpdate::Position(effects.position));
    if let Some(balance) = effects.balance {
        updates.push(VenueUpdate::Balance(balance));
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    fn info(&self) -> BrokerInfo {
        BrokerInfo {
            name: format!("{PAPER_EXCHANGE}:{}", self.venue),
            markets: self.config.symbols.clone(),
            supports_testnet: true,
        }
    }

    fn venue(&self) -> VenueId {
        self.venue.clone()
    }

    async fn place_order(&self, request: OrderRequest) -> BrokerResult<Order> {
        self.ensure_open()?;
        if request.quantity <= Decimal::ZERO {
            return Err(BrokerError::InvalidRequest(
                "order quantity must be positive".into(),
            ));
        }
        let order_id = request
            .client_order_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let order = Order::from_request(order_id, self.venue.clone(), &request);

        let mut updates = Vec::new();
        let acknowledged = {
            let mut book = self.book.lock();
            let market = book.prices.get(&request.symbol).copied();
            let limit = match request.order_type {
                OrderType::Limit => Some(request.price.ok_or_else(|| {
                    BrokerError::InvalidRequest("limit order requires price".into())
                })?),
                OrderType::Market => None,
            };
            let fill_price = match (limit, market) {
                (None, Some(market)) => Some(market),
                (None, None) => {
                    return Err(BrokerError::Exchange(format!(
                        "no market price for {}",
                        request.symbol
                    )))
                }
                // A marketable limit takes the current price, which is never worse.
                (Some(_), Some(market)) if limit_crosses(&order, market) => Some(market),
                (Some(_), _) => None,
            };
            let reference = fill_price.or(limit).unwrap_or_default();
            let (notional, fee) = fill_amounts(reference, request.quantity, self.fee_rate)?;
            if request.side == Side::Buy {
                let required = notional + fee;
                let available = self.quote_balance(&mut book).free;
                if required > available {
                    return Err(BrokerError::Exchange(format!(
                        "insufficient {} balance: required {required}, available {available}",
                        self.config.quote_currency
                    )));
                }
            }
            match fill_price {
                Some(price) => {
                    let done = filled(&order);
                    let effects = self.apply_fill(&mut book, &done, price)?;
                    push_effects(&mut updates, effects);
                    done
                }
                None => {
                    if order.side == Side::Buy {
                        let quote = self.quote_balance(&mut book);
                        quote.free -= notional;
                        quote.locked += notional;
                        updates.push(VenueUpdate::Balance(quote.clone()));
                    }
                    book.resting.insert(order.id.clone(), order.clone());
                    order
                }
            }
        };
        self.emit(updates);
        Ok(acknowledged)
    }

    async fn cancel_order(&self, order_id: &OrderId, _symbol: &str) -> BrokerResult<()> {
        self.ensure_open()?;
        let balance = {
            let mut book = self.book.lock();
            let order = book
                .resting
                .remove(order_id)
                .ok_or_else(|| BrokerError::NotFound(format!("order {order_id} is not open")))?;
            self.release_lock(&mut book, &order);
            (order.side == Side::Buy).then(|| self.quote_balance(&mut book).clone())
        };
        if let Some(balance) = balance {
            self.emit(vec![VenueUpdate::Balance(balance)]);
        }
        Ok(())
    }

    async fn open_orders(&self, symbol: Option<&str>) -> BrokerResult<Vec<Order>> {
        self.ensure_open()?;
        Ok(self
            .book
            .lock()
            .resting
            .values()
            .filter(|order| symbol.map_or(true, |s| order.symbol == s))
            .cloned()
            .collect())
    }

    async fn balances(&self) -> BrokerResult<Vec<Balance>> {
        self.ensure_open()?;
        Ok(self.book.lock().balances.values().cloned().collect())
    }

    async fn positions(&self) -> BrokerResult<Vec<Position>> {
        self.ensure_open()?;
        Ok(self
            .book
            .lock()
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .cloned()
            .collect())
    }

    async fn ping(&self) -> BrokerResult<bool> {
        Ok(!self.closed.load(Ordering::SeqCst))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(stop) = self.market_task.lock().take() {
            let _ = stop.send(());
        }
        info!(venue = %self.venue, "paper session closed");
        Ok(())
    }
}

async fn run_random_walk(
    exchange: Weak<PaperExchange>,
    tick: Duration,
    volatility: f64,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval(tick);
    loop {
        tokio::select! {
            _ = ticker.tick() => {},
            _ = &mut shutdown => break,
        }
        let Some(exchange) = exchange.upgrade() else {
            break;
        };
        for symbol in exchange.config.symbols.clone() {
            let Some(current) = exchange.last_price(&symbol).and_then(|p| p.to_f64()) else {
                continue;
            };
            let noise: f64 = rng.sample(StandardNormal);
            let next = (current * (1.0 + noise * volatility.clamp(0.0, 0.1))).max(0.01);
            match Decimal::from_f64(next) {
                Some(price) => exchange.set_price(&symbol, price.round_dp(8)),
                None => warn!(symbol = %symbol, "random walk produced an unrepresentable price"),
            }
        }
    }
    debug!("paper market generator stopped");
}

/// Builds [`PaperExchange`] sessions for `create_connection` with `exchange = "paper"`.
pub struct PaperConnectorFactory {
    config: PaperConfig,
}

impl PaperConnectorFactory {
    pub fn new(config: PaperConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectorFactory for PaperConnectorFactory {
    fn name(&self) -> &str {
        PAPER_EXCHANGE
    }

    async fn connect(
        &self,
        credentials: &ExchangeCredentials,
        updates: VenueUpdateSender,
    ) -> BrokerResult<Arc<dyn ExchangeGateway>> {
        if credentials.api_key.trim().is_empty() {
            return Err(BrokerError::Authentication("api_key must not be empty".into()));
        }
        let venue = format!("{PAPER_EXCHANGE}-{}", &Uuid::new_v4().simple().to_string()[..8]);
        let exchange = Arc::new(PaperExchange::new(venue, self.config.clone(), updates));
        exchange.start_market();
        Ok(exchange)
    }
}
