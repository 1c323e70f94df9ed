//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod command;
pub mod event;
pub mod strategy;
pub mod wire;

pub use command::{Command, CommandError, CommandResult, CommandResultData, Params};
pub use event::{
    ConnectionChange, ConnectionEvent, ErrorReport, Event, EventKind, EventPayload, LogRecord,
    RiskReport, StateSnapshot, StrategyChange, StrategyEvent, SystemStatus,
};
pub use strategy::{LifecycleAction, StrategyInstance, StrategyStats, StrategyStatus};
pub use wire::{parse_frame, InboundFrame, ProtocolError};

/// Alias for price precision.
pub type Price = Decimal;
/// Alias for quantity precision.
pub type Quantity = Decimal;
/// Alias used for human-readable market symbols (e.g., `BTC-USDT`).
pub type Symbol = String;

/// Unique identifier assigned to orders (exchange or client provided).
pub type OrderId = String;
/// Identifier of a strategy instance managed by the control plane.
pub type StrategyId = String;
/// Identifier of an exchange connection (`primary` for the default venue).
pub type VenueId = String;

/// Venue identifier used when a request does not name a connection.
pub const PRIMARY_VENUE: &str = "primary";

/// The side of an order or position.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy the instrument.
    Buy,
    /// Sell the instrument.
    Sell,
}

impl Side {
    /// Returns the opposite side (buy <-> sell).
    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Signed multiplier applied to quantities (+1 buy, -1 sell).
    #[must_use]
    pub fn sign(self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "buy" | "bid" | "long" => Ok(Self::Buy),
            "sell" | "ask" | "short" => Ok(Self::Sell),
            other => Err(format!("unsupported side '{other}'")),
        }
    }
}

/// Order execution style.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Execute immediately at best available price.
    Market,
    /// Execute at the provided limit price.
    Limit,
}

impl FromStr for OrderType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "market" => Ok(Self::Market),
            "limit" => Ok(Self::Limit),
            other => Err(format!("unsupported order type '{other}'")),
        }
    }
}

/// High-level order status mirrored from the exchange.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Whether the order can still trade.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(self, Self::New | Self::PartiallyFilled)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "new" | "open" => Ok(Self::New),
            "partially_filled" | "partial" => Ok(Self::PartiallyFilled),
            "filled" => Ok(Self::Filled),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unsupported order status '{other}'")),
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Desired order placement parameters.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Quantity,
    pub price: Option<Price>,
    #[serde(default)]
    pub strategy_id: Option<StrategyId>,
    #[serde(default)]
    pub client_order_id: Option<String>,
}

/// Order representation that mirrors exchange state.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub venue: VenueId,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Option<Price>,
    pub quantity: Quantity,
    pub filled_quantity: Quantity,
    pub status: OrderStatus,
    #[serde(default)]
    pub strategy_id: Option<StrategyId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build a freshly acknowledged order from the request that produced it.
    #[must_use]
    pub fn from_request(id: OrderId, venue: impl Into<VenueId>, request: &OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            id,
            venue: venue.into(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            price: request.price,
            quantity: request.quantity,
            filled_quantity: Decimal::ZERO,
            status: OrderStatus::New,
            strategy_id: request.strategy_id.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn remaining(&self) -> Quantity {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }

    /// Copy of the order moved into `status`, stamped now.
    #[must_use]
    pub fn with_status(&self, status: OrderStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.updated_at = Utc::now();
        next
    }
}

/// Immutable execution record.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub quantity: Quantity,
    #[serde(default)]
    pub fee: Price,
    #[serde(default)]
    pub realized_pnl: Price,
    #[serde(default)]
    pub strategy_id: Option<StrategyId>,
    pub executed_at: DateTime<Utc>,
}

/// Snapshot of an open position.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: Option<Side>,
    pub quantity: Quantity,
    pub entry_price: Option<Price>,
    pub unrealized_pnl: Price,
    #[serde(default)]
    pub strategy_id: Option<StrategyId>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Update the mark price to refresh unrealized PnL.
    pub fn mark_price(&mut self, price: Price) {
        if let (Some(entry), Some(side)) = (self.entry_price, self.side) {
            let pnl = match side {
                Side::Buy => price.checked_sub(entry),
                Side::Sell => entry.checked_sub(price),
            }
            .and_then(|delta| delta.checked_mul(self.quantity));
            // Out-of-range marks keep the previous value.
            if let Some(pnl) = pnl {
                self.unrealized_pnl = pnl;
            }
        }
        self.updated_at = Utc::now();
    }

    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero() || self.side.is_none()
    }
}

/// Account balance for a single currency on one exchange.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Balance {
    pub currency: String,
    pub free: Quantity,
    pub locked: Quantity,
    pub total: Quantity,
    pub exchange: String,
}

impl Balance {
    /// Key used by the aggregator; balances from different venues never collide.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.exchange, self.currency)
    }
}

/// Latest observed price for a symbol.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PriceUpdate {
    pub symbol: Symbol,
    pub price: Price,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<Price>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<Price>,
}

/// Health of an exchange connection as last observed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Healthy,
    Failed,
}

/// Metadata describing an exchange connection created by an operator.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ExchangeConnection {
    pub id: VenueId,
    pub exchange: String,
    pub testnet: bool,
    /// First characters of the API key followed by an ellipsis.
    pub api_key_hint: String,
    pub status: LinkStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_tested_at: Option<DateTime<Utc>>,
}

/// Mask an API key so only a short prefix is ever surfaced to clients.
#[must_use]
pub fn mask_api_key(key: &str) -> String {
    let prefix: String = key.chars().take(8).collect();
    format!("{prefix}...")
}
