//! Command router: validates client commands and dispatches them to handler groups.

mod connections;
mod orders;
mod params;
mod strategies;
mod system;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use helm_broker::{BrokerResult, ConnectorRegistry, ExchangeGateway, StrategyDriver, VenueUpdateSender};
use helm_core::{
    Command, CommandError, CommandResult, CommandResultData, Params, SystemStatus, VenueId,
    PRIMARY_VENUE,
};
use helm_events::EventBus;
use helm_state::StateAggregator;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::registry::ConnectionRegistry;
use crate::risk::RiskGuard;
use crate::telemetry::ControlMetrics;

pub use connections::ConnectionCommands;
pub use orders::OrderCommands;
pub use strategies::StrategyCommands;
pub use system::SystemCommands;

/// Every command the router accepts.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CommandName {
    CreateStrategy,
    UpdateStrategy,
    DeleteStrategy,
    StartStrategy,
    StopStrategy,
    PauseStrategy,
    ResumeStrategy,
    GetStrategies,
    PlaceOrder,
    CancelOrder,
    CancelAllOrders,
    GetOrders,
    GetPositions,
    GetBalances,
    SyncAccount,
    CreateConnection,
    DeleteConnection,
    TestConnection,
    GetConnections,
    GetSystemStatus,
    GetState,
    GetEvents,
    StartEngine,
    StopEngine,
    KillSwitch,
}

impl CommandName {
    pub const ALL: [CommandName; 25] = [
        Self::CreateStrategy,
        Self::UpdateStrategy,
        Self::DeleteStrategy,
        Self::StartStrategy,
        Self::StopStrategy,
        Self::PauseStrategy,
        Self::ResumeStrategy,
        Self::GetStrategies,
        Self::PlaceOrder,
        Self::CancelOrder,
        Self::CancelAllOrders,
        Self::GetOrders,
        Self::GetPositions,
        Self::GetBalances,
        Self::SyncAccount,
        Self::CreateConnection,
        Self::DeleteConnection,
        Self::TestConnection,
        Self::GetConnections,
        Self::GetSystemStatus,
        Self::GetState,
        Self::GetEvents,
        Self::StartEngine,
        Self::StopEngine,
        Self::KillSwitch,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateStrategy => "create_strategy",
            Self::UpdateStrategy => "update_strategy",
            Self::DeleteStrategy => "delete_strategy",
            Self::StartStrategy => "start_strategy",
            Self::StopStrategy => "stop_strategy",
            Self::PauseStrategy => "pause_strategy",
            Self::ResumeStrategy => "resume_strategy",
            Self::GetStrategies => "get_strategies",
            Self::PlaceOrder => "place_order",
            Self::CancelOrder => "cancel_order",
            Self::CancelAllOrders => "cancel_all_orders",
            Self::GetOrders => "get_orders",
            Self::GetPositions => "get_positions",
            Self::GetBalances => "get_balances",
            Self::SyncAccount => "sync_account",
            Self::CreateConnection => "create_connection",
            Self::DeleteConnection => "delete_connection",
            Self::TestConnection => "test_connection",
            Self::GetConnections => "get_connections",
            Self::GetSystemStatus => "get_system_status",
            Self::GetState => "get_state",
            Self::GetEvents => "get_events",
            Self::StartEngine => "start_engine",
            Self::StopEngine => "stop_engine",
            Self::KillSwitch => "kill_switch",
        }
    }

    /// Commands that only read state and never publish.
    #[must_use]
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            Self::GetStrategies
                | Self::GetOrders
                | Self::GetPositions
                | Self::GetBalances
                | Self::GetConnections
                | Self::GetSystemStatus
                | Self::GetState
                | Self::GetEvents
        )
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandName {
    type Err = CommandError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == value)
            .ok_or_else(|| CommandError::UnknownCommand(value.to_string()))
    }
}

/// A group of commands sharing collaborators.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Commands this group answers.
    fn commands(&self) -> &'static [CommandName];

    async fn handle(
        &self,
        name: CommandName,
        params: &Params,
    ) -> Result<CommandResultData, CommandError>;
}

/// Connected exchange gateways keyed by venue id.
#[derive(Clone, Default)]
pub struct VenueBook {
    inner: Arc<RwLock<BTreeMap<VenueId, Arc<dyn ExchangeGateway>>>>,
}

impl VenueBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway under the venue it reports and return that id.
    pub fn insert(&self, gateway: Arc<dyn ExchangeGateway>) -> VenueId {
        let venue = gateway.venue();
        self.inner.write().insert(venue.clone(), gateway);
        venue
    }

    pub fn get(&self, venue: &str) -> Option<Arc<dyn ExchangeGateway>> {
        self.inner.read().get(venue).cloned()
    }

    pub fn remove(&self, venue: &str) -> Option<Arc<dyn ExchangeGateway>> {
        self.inner.write().remove(venue)
    }

    pub fn venues(&self) -> Vec<VenueId> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn gateways(&self) -> Vec<Arc<dyn ExchangeGateway>> {
        self.inner.read().values().cloned().collect()
    }

    /// Gateway for the requested connection, defaulting to the primary venue.
    pub fn resolve(
        &self,
        venue: Option<&str>,
    ) -> Result<(VenueId, Arc<dyn ExchangeGateway>), CommandError> {
        let venue = venue.unwrap_or(PRIMARY_VENUE);
        self.get(venue)
            .map(|gateway| (venue.to_string(), gateway))
            .ok_or_else(|| CommandError::NotFound(format!("Connection not found: {venue}")))
    }
}

/// Everything a command handler may touch, constructed once at startup.
pub struct ControlContext {
    pub bus: EventBus,
    pub state: Arc<StateAggregator>,
    pub registry: ConnectionRegistry,
    pub venues: VenueBook,
    pub connectors: ConnectorRegistry,
    pub strategies: Arc<dyn StrategyDriver>,
    pub risk: RiskGuard,
    /// Handed to gateways created by `create_connection`.
    pub updates: VenueUpdateSender,
    /// Upper bound for a single collaborator call.
    pub call_timeout: Duration,
    pub started_at: Instant,
}

impl ControlContext {
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn system_status(&self) -> SystemStatus {
        let totals = self.state.totals();
        SystemStatus {
            uptime_secs: self.uptime().as_secs(),
            engine_running: totals.engine_running,
            active_strategies: totals.active_strategies,
            total_strategies: totals.strategies,
            total_trades: totals.total_trades,
            total_profit: totals.realized_pnl,
            connected_clients: self.registry.len(),
            last_seq: self.bus.last_seq(),
            risk: self.risk.report(&self.state),
        }
    }

    /// Await a collaborator call, bounded by `call_timeout`.
    pub async fn call<T, F>(&self, what: &str, call: F) -> Result<T, CommandError>
    where
        F: Future<Output = BrokerResult<T>>,
    {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => result.map_err(|err| CommandError::External(err.to_string())),
            Err(_) => Err(CommandError::External(format!(
                "{what} timed out after {}ms",
                self.call_timeout.as_millis()
            ))),
        }
    }
}

/// Routes every [`Command`] to exactly one handler and always produces a result.
pub struct CommandRouter {
    handlers: BTreeMap<CommandName, Arc<dyn CommandHandler>>,
    timeout: Duration,
    metrics: Option<Arc<ControlMetrics>>,
}

impl CommandRouter {
    pub fn new(context: Arc<ControlContext>, timeout: Duration) -> Self {
        let groups: Vec<Arc<dyn CommandHandler>> = vec![
            Arc::new(StrategyCommands::new(context.clone())),
            Arc::new(OrderCommands::new(context.clone())),
            Arc::new(ConnectionCommands::new(context.clone())),
            Arc::new(SystemCommands::new(context)),
        ];
        let mut handlers = BTreeMap::new();
        for group in groups {
            for name in group.commands() {
                handlers.insert(*name, group.clone());
            }
        }
        Self {
            handlers,
            timeout,
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<ControlMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn handles(&self, name: CommandName) -> bool {
        self.handlers.contains_key(&name)
    }

    pub async fn handle(&self, command: Command) -> CommandResult {
        let Command {
            name,
            params,
            correlation_id,
        } = command;
        let started = Instant::now();
        let (label, outcome) = match name.parse::<CommandName>() {
            Ok(tag) => (tag.as_str(), self.dispatch(tag, &params).await),
            Err(err) => ("unknown", Err(err)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => debug!(cmd = %name, elapsed_ms, "command handled"),
            Err(err @ (CommandError::External(_) | CommandError::Internal(_))) => {
                warn!(cmd = %name, kind = err.kind(), error = %err, elapsed_ms, "command failed")
            }
            Err(err) => debug!(cmd = %name, kind = err.kind(), error = %err, "command rejected"),
        }
        if let Some(metrics) = &self.metrics {
            let result = match &outcome {
                Ok(_) => "ok",
                Err(err) => err.kind(),
            };
            metrics.inc_command(label, result);
        }
        CommandResult::new(name, correlation_id, outcome)
    }

    async fn dispatch(
        &self,
        name: CommandName,
        params: &Params,
    ) -> Result<CommandResultData, CommandError> {
        let handler = self
            .handlers
            .get(&name)
            .cloned()
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        let call = AssertUnwindSafe(handler.handle(name, params)).catch_unwind();
        // kill_switch bounds each collaborator call itself and must always finish.
        let guarded = if name == CommandName::KillSwitch {
            call.await
        } else {
            match tokio::time::timeout(self.timeout, call).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(CommandError::External(format!(
                        "{name} timed out after {}ms",
                        self.timeout.as_millis()
                    )))
                }
            }
        };
        guarded.unwrap_or_else(|panic| {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(cmd = %name, reason = %reason, "command handler panicked");
            Err(CommandError::Internal(format!("{name} failed unexpectedly")))
        })
    }
}

#[cfg(test)]
mod tests;
