//! Exchange- and strategy-agnostic collaborator traits used by the control plane.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use helm_core::{
    Balance, Order, OrderId, OrderRequest, Position, PriceUpdate, StrategyInstance, Trade,
    VenueId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by collaborator implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Represents transport-level failures (network, timeouts, etc.).
    #[error("transport error: {0}")]
    Transport(String),
    /// Returned when authentication fails or credentials are missing.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Returned when the request parameters are invalid for the target exchange.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Wraps serialization or parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Exchange responded with a business error (e.g., insufficient margin).
    #[error("exchange error: {0}")]
    Exchange(String),
    /// The referenced order, strategy, or connection does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Helper used by connectors when mapping any error type into a broker error.
    pub fn from_display(err: impl fmt::Display, kind: BrokerErrorKind) -> Self {
        match kind {
            BrokerErrorKind::Transport => Self::Transport(err.to_string()),
            BrokerErrorKind::Authentication => Self::Authentication(err.to_string()),
            BrokerErrorKind::InvalidRequest => Self::InvalidRequest(err.to_string()),
            BrokerErrorKind::Serialization => Self::Serialization(err.to_string()),
            BrokerErrorKind::Exchange => Self::Exchange(err.to_string()),
            BrokerErrorKind::NotFound => Self::NotFound(err.to_string()),
            BrokerErrorKind::Other => Self::Other(err.to_string()),
        }
    }
}

/// Enumerates the broad families of broker errors.
#[derive(Debug, Clone, Copy)]
pub enum BrokerErrorKind {
    Transport,
    Authentication,
    InvalidRequest,
    Serialization,
    Exchange,
    NotFound,
    Other,
}

/// Represents metadata describing the capabilities of a connector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub name: String,
    pub markets: Vec<String>,
    pub supports_testnet: bool,
}

/// State change pushed by an exchange outside of any request/response call.
#[derive(Clone, Debug, PartialEq)]
pub enum VenueUpdate {
    Order(Order),
    Trade(Trade),
    Position(Position),
    Balance(Balance),
    Price(PriceUpdate),
}

pub type VenueUpdateSender = mpsc::UnboundedSender<VenueUpdate>;
pub type VenueUpdateReceiver = mpsc::UnboundedReceiver<VenueUpdate>;

/// Order execution and account access against one venue.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Return metadata about the connector for telemetry.
    fn info(&self) -> BrokerInfo;

    /// Venue identifier stamped on every order this gateway acknowledges.
    fn venue(&self) -> VenueId;

    /// Place a new order on the exchange and return it as acknowledged.
    async fn place_order(&self, request: OrderRequest) -> BrokerResult<Order>;

    /// Cancel an existing order by identifier.
    async fn cancel_order(&self, order_id: &OrderId, symbol: &str) -> BrokerResult<()>;

    /// Get open orders, optionally restricted to one symbol.
    async fn open_orders(&self, symbol: Option<&str>) -> BrokerResult<Vec<Order>>;

    /// Retrieve the latest known account balances.
    async fn balances(&self) -> BrokerResult<Vec<Balance>>;

    /// Retrieve the current open positions.
    async fn positions(&self) -> BrokerResult<Vec<Position>>;

    /// Round-trip the venue to verify credentials and reachability.
    async fn ping(&self) -> BrokerResult<bool>;

    /// Release the session. Further calls may fail.
    async fn close(&self) -> BrokerResult<()> {
        Ok(())
    }
}

/// Credentials supplied by an operator when creating an exchange connection.
#[derive(Clone, Deserialize, Serialize)]
pub struct ExchangeCredentials {
    pub exchange: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub testnet: bool,
}

impl fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("exchange", &self.exchange)
            .field("api_key", &helm_core::mask_api_key(&self.api_key))
            .field("testnet", &self.testnet)
            .finish_non_exhaustive()
    }
}

/// Builds gateways for one exchange family.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    /// Exchange name matched against `create_connection`'s `exchange` parameter.
    fn name(&self) -> &str;

    async fn connect(
        &self,
        credentials: &ExchangeCredentials,
        updates: VenueUpdateSender,
    ) -> BrokerResult<Arc<dyn ExchangeGateway>>;
}

/// Explicitly constructed lookup of connector factories by exchange name.
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    factories: BTreeMap<String, Arc<dyn ConnectorFactory>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn ConnectorFactory>) {
        self.factories
            .insert(factory.name().to_ascii_lowercase(), factory);
    }

    #[must_use]
    pub fn with(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ConnectorFactory>> {
        self.factories.get(&name.to_ascii_lowercase()).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }
}

/// Runs strategy algorithms on behalf of the control plane.
///
/// Implementations own the algorithm; the control plane owns the lifecycle status and
/// only records a transition after the driver accepted it.
#[async_trait]
pub trait StrategyDriver: Send + Sync {
    /// Strategy kinds this driver can run.
    fn kinds(&self) -> Vec<String>;

    fn supports(&self, kind: &str) -> bool {
        self.kinds().iter().any(|known| known == kind)
    }

    async fn start(&self, strategy: &StrategyInstance) -> BrokerResult<()>;

    async fn stop(&self, strategy: &StrategyInstance) -> BrokerResult<()>;

    async fn pause(&self, strategy: &StrategyInstance) -> BrokerResult<()>;

    async fn resume(&self, strategy: &StrategyInstance) -> BrokerResult<()>;
}
