use std::sync::Arc;

use async_trait::async_trait;
use helm_core::{
    CommandError, CommandResultData, EventPayload, Order, OrderRequest, OrderStatus, OrderType,
    Params, Side,
};
use helm_state::OrderFilter;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::params::{data, to_json};
use super::{CommandHandler, CommandName, ControlContext};

const SYMBOL: &[&str] = &["symbol", "pair", "trading_pair"];
const SIZE: &[&str] = &["size", "quantity", "amount"];
const VENUE: &[&str] = &["connection", "connection_id", "venue"];

/// One action the operator asked for that did not go through.
#[derive(Clone, Debug, Serialize)]
pub struct ActionFailure {
    pub target: &'static str,
    pub id: String,
    pub error: String,
}

/// Outcome of cancelling a batch of orders one by one.
#[derive(Debug, Default)]
pub struct CancelReport {
    pub cancelled: Vec<String>,
    pub failures: Vec<ActionFailure>,
}

/// Cancel each order independently. A failure never stops the remaining cancels.
pub(crate) async fn cancel_orders(ctx: &ControlContext, orders: Vec<Order>) -> CancelReport {
    let mut report = CancelReport::default();
    for order in orders {
        match cancel_one(ctx, &order).await {
            Ok(()) => report.cancelled.push(order.id),
            Err(err) => {
                warn!(order_id = %order.id, error = %err, "failed to cancel order");
                report.failures.push(ActionFailure {
                    target: "order",
                    id: order.id,
                    error: err.to_string(),
                });
            }
        }
    }
    report
}

async fn cancel_one(ctx: &ControlContext, order: &Order) -> Result<(), CommandError> {
    let (_, gateway) = ctx.venues.resolve(Some(&order.venue))?;
    ctx.call(
        &format!("cancel order {}", order.id),
        gateway.cancel_order(&order.id, &order.symbol),
    )
    .await?;
    ctx.bus
        .publish(EventPayload::OrderUpdate(order.with_status(OrderStatus::Cancelled)));
    Ok(())
}

/// Order, position, and balance commands forwarded to exchange gateways.
pub struct OrderCommands {
    ctx: Arc<ControlContext>,
}

impl OrderCommands {
    pub fn new(ctx: Arc<ControlContext>) -> Self {
        Self { ctx }
    }

    fn request(&self, params: &Params) -> Result<OrderRequest, CommandError> {
        let symbol = params.require_str(SYMBOL)?;
        let side = params.require_parsed::<Side>(&["side"])?;
        let order_type = params.require_parsed::<OrderType>(&["type", "order_type"])?;
        let quantity = params.require_decimal(SIZE)?;
        if quantity <= Decimal::ZERO {
            return Err(CommandError::invalid("size", "must be positive"));
        }
        let price = params.decimal_opt(&["price"])?;
        match (order_type, price) {
            (OrderType::Limit, None) => return Err(CommandError::missing("price")),
            (_, Some(price)) if price <= Decimal::ZERO => {
                return Err(CommandError::invalid("price", "must be positive"))
            }
            _ => {}
        }
        let strategy_id = params.str_opt(&["strategy_id", "strategy"])?;
        if let Some(id) = &strategy_id {
            if self.ctx.state.strategy(id).is_none() {
                return Err(CommandError::NotFound(format!("Strategy not found: {id}")));
            }
        }
        let request = OrderRequest {
            symbol,
            side,
            order_type,
            quantity,
            price,
            strategy_id,
            client_order_id: params.str_opt(&["client_order_id"])?,
        };
        self.ctx.risk.check(&request, &self.ctx.state)?;
        Ok(request)
    }

    async fn place(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let request = self.request(params)?;
        let venue = params.str_opt(VENUE)?;
        let (venue, gateway) = self.ctx.venues.resolve(venue.as_deref())?;
        let order = self
            .ctx
            .call("place order", gateway.place_order(request))
            .await?;
        info!(
            order_id = %order.id,
            venue = %venue,
            symbol = %order.symbol,
            side = ?order.side,
            qty = %order.quantity,
            status = %order.status,
            "order placed"
        );
        self.ctx.bus.publish(EventPayload::OrderUpdate(order.clone()));
        Ok(data([
            ("order_id", Value::String(order.id.clone())),
            ("order", to_json(&order)?),
        ]))
    }

    async fn cancel(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let order_id = params.require_str(&["order_id", "id"])?;
        let order = self
            .ctx
            .state
            .order(&order_id)
            .ok_or_else(|| CommandError::NotFound(format!("Order not found: {order_id}")))?;
        cancel_one(&self.ctx, &order).await?;
        info!(order_id = %order_id, "order cancelled");
        Ok(data([
            ("order_id", Value::String(order_id)),
            ("status", json!(OrderStatus::Cancelled)),
        ]))
    }

    async fn cancel_all(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let filter = OrderFilter {
            symbol: params.str_opt(SYMBOL)?,
            venue: params.str_opt(VENUE)?,
            ..OrderFilter::default()
        };
        let targets = self.ctx.state.orders(&filter);
        let attempted = targets.len();
        let report = cancel_orders(&self.ctx, targets).await;
        if attempted > 0 && report.cancelled.is_empty() {
            let first = report
                .failures
                .first()
                .map(|failure| failure.error.clone())
                .unwrap_or_default();
            return Err(CommandError::External(format!(
                "Failed to cancel {attempted} order(s): {first}"
            )));
        }
        Ok(data([
            ("cancelled_count", json!(report.cancelled.len())),
            ("failed_count", json!(report.failures.len())),
            ("cancelled", to_json(&report.cancelled)?),
            ("failures", to_json(&report.failures)?),
        ]))
    }

    async fn list_orders(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let filter = OrderFilter {
            symbol: params.str_opt(SYMBOL)?,
            status: params.parsed_opt::<OrderStatus>(&["status"])?,
            strategy_id: params.str_opt(&["strategy", "strategy_id"])?,
            venue: params.str_opt(VENUE)?,
        };
        let orders = self.ctx.state.orders(&filter);
        Ok(data([
            ("count", json!(orders.len())),
            ("orders", to_json(&orders)?),
        ]))
    }

    async fn list_positions(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let symbol = params.str_opt(SYMBOL)?;
        let positions: Vec<_> = self
            .ctx
            .state
            .positions()
            .into_iter()
            .filter(|position| symbol.as_deref().map_or(true, |s| position.symbol == s))
            .collect();
        Ok(data([
            ("count", json!(positions.len())),
            ("positions", to_json(&positions)?),
        ]))
    }

    async fn list_balances(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let exchange = params.str_opt(&["exchange", "connection"])?;
        let balances: Vec<_> = self
            .ctx
            .state
            .balances()
            .into_iter()
            .filter(|balance| exchange.as_deref().map_or(true, |e| balance.exchange == e))
            .collect();
        Ok(data([
            ("count", json!(balances.len())),
            ("balances", to_json(&balances)?),
        ]))
    }

    /// Pull account state from the venue and publish it. Nothing is published unless
    /// every fetch succeeded.
    async fn sync_account(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let venue = params.str_opt(VENUE)?;
        let (venue, gateway) = self.ctx.venues.resolve(venue.as_deref())?;
        let balances = self.ctx.call("fetch balances", gateway.balances()).await?;
        let positions = self.ctx.call("fetch positions", gateway.positions()).await?;
        let orders = self
            .ctx
            .call("fetch open orders", gateway.open_orders(None))
            .await?;

        let counts = (balances.len(), positions.len(), orders.len());
        for balance in balances {
            self.ctx.bus.publish(EventPayload::Balance(balance));
        }
        for position in positions {
            self.ctx.bus.publish(EventPayload::Position(position));
        }
        for order in orders {
            self.ctx.bus.publish(EventPayload::OrderUpdate(order));
        }
        info!(venue = %venue, balances = counts.0, positions = counts.1, orders = counts.2, "account synchronized");
        Ok(data([
            ("connection", Value::String(venue)),
            ("balances", json!(counts.0)),
            ("positions", json!(counts.1)),
            ("orders", json!(counts.2)),
        ]))
    }
}

#[async_trait]
impl CommandHandler for OrderCommands {
    fn commands(&self) -> &'static [CommandName] {
        &[
            CommandName::PlaceOrder,
            CommandName::CancelOrder,
            CommandName::CancelAllOrders,
            CommandName::GetOrders,
            CommandName::GetPositions,
            CommandName::GetBalances,
            CommandName::SyncAccount,
        ]
    }

    async fn handle(
        &self,
        name: CommandName,
        params: &Params,
    ) -> Result<CommandResultData, CommandError> {
        match name {
            CommandName::PlaceOrder => self.place(params).await,
            CommandName::CancelOrder => self.cancel(params).await,
            CommandName::CancelAllOrders => self.cancel_all(params).await,
            CommandName::GetOrders => self.list_orders(params).await,
            CommandName::GetPositions => self.list_positions(params).await,
            CommandName::GetBalances => self.list_balances(params).await,
            CommandName::SyncAccount => self.sync_account(params).await,
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}
