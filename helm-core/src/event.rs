//! Event model streamed to every connected client.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::strategy::StrategyInstance;
use crate::{Balance, ExchangeConnection, Order, Position, Price, PriceUpdate, Quantity, Trade};

/// Immutable fact published on the event bus.
///
/// On the wire an event is a single JSON object: the payload fields are flattened next
/// to `type`, `timestamp`, and `seq`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Event {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
    /// Bus sequence number, `0` for frames that never went through the bus.
    #[serde(default)]
    pub seq: u64,
}

impl Event {
    /// Wrap a payload stamped with the current time and no sequence number.
    #[must_use]
    pub fn new(payload: EventPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            seq: 0,
        }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    #[must_use]
    pub fn is_published(&self) -> bool {
        self.seq != 0
    }

    /// Serialize into the JSON text frame sent to clients.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Kind-specific body of an event. The serde tag doubles as the wire `type`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Connected {
        #[serde(default)]
        message: String,
    },
    Disconnected {
        #[serde(default)]
        message: String,
    },
    Price(PriceUpdate),
    OrderUpdate(Order),
    Trade(Trade),
    Position(Position),
    Balance(Balance),
    Strategy(StrategyEvent),
    Connection(ConnectionEvent),
    Log(LogRecord),
    Snapshot(StateSnapshot),
    Error(ErrorReport),
    SystemStatus(SystemStatus),
    Ping,
    Pong,
}

impl EventPayload {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected { .. } => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::Price(_) => EventKind::Price,
            Self::OrderUpdate(_) => EventKind::OrderUpdate,
            Self::Trade(_) => EventKind::Trade,
            Self::Position(_) => EventKind::Position,
            Self::Balance(_) => EventKind::Balance,
            Self::Strategy(_) => EventKind::Strategy,
            Self::Connection(_) => EventKind::Connection,
            Self::Log(_) => EventKind::Log,
            Self::Snapshot(_) => EventKind::Snapshot,
            Self::Error(_) => EventKind::Error,
            Self::SystemStatus(_) => EventKind::SystemStatus,
            Self::Ping => EventKind::Ping,
            Self::Pong => EventKind::Pong,
        }
    }

    pub fn error(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorReport {
            error_type: error_type.into(),
            message: message.into(),
            details: None,
        })
    }
}

/// Discriminant of [`EventPayload`], used as the bus topic.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Disconnected,
    Price,
    OrderUpdate,
    Trade,
    Position,
    Balance,
    Strategy,
    Connection,
    Log,
    Snapshot,
    Error,
    SystemStatus,
    Ping,
    Pong,
}

impl EventKind {
    pub const ALL: [EventKind; 15] = [
        Self::Connected,
        Self::Disconnected,
        Self::Price,
        Self::OrderUpdate,
        Self::Trade,
        Self::Position,
        Self::Balance,
        Self::Strategy,
        Self::Connection,
        Self::Log,
        Self::Snapshot,
        Self::Error,
        Self::SystemStatus,
        Self::Ping,
        Self::Pong,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Price => "price",
            Self::OrderUpdate => "order_update",
            Self::Trade => "trade",
            Self::Position => "position",
            Self::Balance => "balance",
            Self::Strategy => "strategy",
            Self::Connection => "connection",
            Self::Log => "log",
            Self::Snapshot => "snapshot",
            Self::Error => "error",
            Self::SystemStatus => "system_status",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| format!("unknown event kind '{value}'"))
    }
}

/// What happened to a strategy instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyChange {
    Created,
    Updated,
    Started,
    Paused,
    Resumed,
    Stopped,
    Failed,
    Deleted,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StrategyEvent {
    pub change: StrategyChange,
    pub strategy: StrategyInstance,
}

/// What happened to an exchange connection.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionChange {
    Created,
    Tested,
    Deleted,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ConnectionEvent {
    pub change: ConnectionChange,
    pub connection: ExchangeConnection,
}

/// Engine log line forwarded to clients.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub target: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ErrorReport {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Periodic health summary.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SystemStatus {
    pub uptime_secs: u64,
    pub engine_running: bool,
    pub active_strategies: usize,
    pub total_strategies: usize,
    pub total_trades: u64,
    pub total_profit: Price,
    pub connected_clients: usize,
    pub last_seq: u64,
    #[serde(default)]
    pub risk: RiskReport,
}

/// Configured pre-trade limits and where the engine stands against them.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RiskReport {
    pub max_order_size: Option<Quantity>,
    pub max_position_size: Option<Quantity>,
    pub max_daily_loss: Option<Price>,
    /// Realized PnL of the current UTC day.
    pub daily_pnl: Price,
    pub daily_loss_breached: bool,
}

/// Deep, point-in-time copy of aggregator state.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub strategies: Vec<StrategyInstance>,
    #[serde(default)]
    pub orders: Vec<Order>,
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub balances: Vec<Balance>,
    #[serde(default)]
    pub connections: Vec<ExchangeConnection>,
    #[serde(default)]
    pub prices: Vec<PriceUpdate>,
    #[serde(default)]
    pub engine_running: bool,
    #[serde(default)]
    pub total_trades: u64,
    #[serde(default)]
    pub realized_pnl: Price,
    /// Highest bus sequence number folded into this snapshot.
    #[serde(default)]
    pub last_seq: u64,
}
