//! Process wiring: builds the control plane from configuration and collaborators and
//! owns its background tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use helm_broker::{
    ConnectorFactory, ConnectorRegistry, ExchangeGateway, StrategyDriver, VenueUpdate,
    VenueUpdateReceiver, VenueUpdateSender,
};
use helm_config::{AppConfig, PaperConfig};
use helm_core::{
    ConnectionChange, ConnectionEvent, EventPayload, ExchangeConnection, LinkStatus,
    PRIMARY_VENUE,
};
use helm_events::{EventBus, EventSink, Subscription, Topic};
use helm_paper::{PaperConnectorFactory, PaperExchange, PaperStrategyDriver};
use helm_state::{restorable, JsonStateRepository, StateAggregator, StateRepository};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{CommandRouter, ControlContext, VenueBook};
use crate::http::spawn_http_server;
use crate::registry::{CloseReason, ConnectionRegistry};
use crate::risk::RiskGuard;
use crate::telemetry::ControlMetrics;
use crate::transport::{Transport, TransportSettings};

const TASK_GRACE: Duration = Duration::from_secs(2);

/// Cooperative shutdown flag shared by every task.
#[derive(Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    /// A signal that only fires when [`ShutdownSignal::trigger`] is called.
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// A signal that also fires on Ctrl-C.
    pub fn with_ctrl_c() -> Self {
        let signal = Self::new();
        let trigger = signal.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                trigger.trigger();
            }
        });
        signal
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once the signal has fired.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.triggered() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration`. Returns `false` when interrupted by shutdown.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.triggered(),
            _ = self.wait() => false,
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// External collaborators the control plane drives.
pub struct Collaborators {
    strategies: Arc<dyn StrategyDriver>,
    primary: Option<Arc<dyn ExchangeGateway>>,
    connectors: ConnectorRegistry,
    updates_tx: VenueUpdateSender,
    updates_rx: VenueUpdateReceiver,
}

impl Collaborators {
    pub fn new(strategies: Arc<dyn StrategyDriver>) -> Self {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            strategies,
            primary: None,
            connectors: ConnectorRegistry::new(),
            updates_tx,
            updates_rx,
        }
    }

    /// In-process paper venue as the primary connection plus the `paper` connector.
    pub fn paper(config: &PaperConfig) -> Self {
        let collaborators = Self::new(Arc::new(PaperStrategyDriver::new()));
        let exchange = Arc::new(PaperExchange::new(
            PRIMARY_VENUE,
            config.clone(),
            collaborators.updates(),
        ));
        exchange.start_market();
        collaborators
            .with_primary(exchange)
            .with_connector(Arc::new(PaperConnectorFactory::new(config.clone())))
    }

    /// Sender for gateways that push asynchronous venue updates.
    #[must_use]
    pub fn updates(&self) -> VenueUpdateSender {
        self.updates_tx.clone()
    }

    #[must_use]
    pub fn with_primary(mut self, gateway: Arc<dyn ExchangeGateway>) -> Self {
        self.primary = Some(gateway);
        self
    }

    #[must_use]
    pub fn with_connector(mut self, factory: Arc<dyn ConnectorFactory>) -> Self {
        self.connectors.register(factory);
        self
    }
}

/// A running control plane: WebSocket endpoint, HTTP surface, and background tasks.
pub struct ControlPlane {
    context: Arc<ControlContext>,
    aggregator: Arc<StateAggregator>,
    repository: JsonStateRepository,
    shutdown: ShutdownSignal,
    ws_addr: SocketAddr,
    http_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
    _subscriptions: Vec<Subscription>,
}

impl ControlPlane {
    pub async fn start(
        config: &AppConfig,
        collaborators: Collaborators,
        bus: EventBus,
        shutdown: ShutdownSignal,
    ) -> Result<Self> {
        let Collaborators {
            strategies,
            primary,
            connectors,
            updates_tx,
            updates_rx,
        } = collaborators;

        let aggregator = Arc::new(StateAggregator::new());
        let repository = JsonStateRepository::new(config.state.path.clone());
        restore_state(&repository, &aggregator).await?;

        let metrics = Arc::new(ControlMetrics::new().context("failed to register metrics")?);
        let subscriptions = vec![
            bus.subscribe(Topic::All, aggregator.clone() as Arc<dyn EventSink>),
            bus.subscribe(Topic::All, metrics.clone() as Arc<dyn EventSink>),
        ];

        let venues = VenueBook::new();
        if let Some(gateway) = primary {
            register_primary(&bus, &venues, gateway);
        }

        let command_timeout = config.server.command_timeout();
        let registry = ConnectionRegistry::new(config.server.max_clients);
        let context = Arc::new(ControlContext {
            bus: bus.clone(),
            state: aggregator.clone(),
            registry: registry.clone(),
            venues,
            connectors,
            strategies,
            risk: RiskGuard::new(config.risk.clone()),
            updates: updates_tx,
            call_timeout: command_timeout,
            started_at: Instant::now(),
        });
        let router = Arc::new(
            CommandRouter::new(context.clone(), command_timeout).with_metrics(metrics.clone()),
        );

        let listener = TcpListener::bind(&config.server.ws_addr)
            .await
            .with_context(|| format!("failed to bind websocket endpoint on {}", config.server.ws_addr))?;
        let ws_addr = listener.local_addr()?;
        let transport = Arc::new(Transport::new(
            registry,
            bus.clone(),
            aggregator.clone(),
            router,
            metrics.clone(),
            TransportSettings::from_config(config),
        ));
        info!(addr = %ws_addr, paths = ?config.server.ws_paths, "websocket endpoint listening");
        let mut tasks = vec![tokio::spawn(transport.serve(listener, shutdown.clone()))];

        let http_bind: SocketAddr = config
            .server
            .http_addr
            .parse()
            .with_context(|| format!("invalid server.http_addr '{}'", config.server.http_addr))?;
        let (http_addr, http_task) =
            spawn_http_server(http_bind, context.clone(), metrics, shutdown.clone())?;
        tasks.push(http_task);

        tasks.push(spawn_ingestion(bus.clone(), updates_rx, shutdown.clone()));
        if config.state.persist_interval_secs > 0 {
            tasks.push(spawn_persistence(
                aggregator.clone(),
                repository.clone(),
                Duration::from_secs(config.state.persist_interval_secs),
                shutdown.clone(),
            ));
        }
        if config.telemetry.status_interval_secs > 0 {
            tasks.push(spawn_status_reporter(
                context.clone(),
                Duration::from_secs(config.telemetry.status_interval_secs),
                shutdown.clone(),
            ));
        }

        Ok(Self {
            context,
            aggregator,
            repository,
            shutdown,
            ws_addr,
            http_addr,
            tasks,
            _subscriptions: subscriptions,
        })
    }

    #[must_use]
    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    #[must_use]
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ControlContext> {
        &self.context
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.context.registry
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.context.bus
    }

    #[must_use]
    pub fn aggregator(&self) -> &Arc<StateAggregator> {
        &self.aggregator
    }

    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Block until the shutdown signal fires, then stop.
    pub async fn run_until_shutdown(self) -> Result<()> {
        self.shutdown.wait().await;
        self.shutdown().await
    }

    /// Stop accepting clients, close every session, and persist the final state.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.trigger();
        self.context.registry.close_all(CloseReason::Shutdown);
        for task in self.tasks {
            if tokio::time::timeout(TASK_GRACE, task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
        for gateway in self.context.venues.gateways() {
            if let Err(err) = gateway.close().await {
                debug!(venue = %gateway.venue(), error = %err, "gateway close failed");
            }
        }
        persist(&self.aggregator, &self.repository).await?;
        info!(path = %self.repository.path().display(), "state persisted, control plane stopped");
        Ok(())
    }
}

async fn restore_state(repository: &JsonStateRepository, aggregator: &StateAggregator) -> Result<()> {
    let repo = repository.clone();
    let snapshot = tokio::task::spawn_blocking(move || repo.load())
        .await
        .map_err(|err| anyhow!("state restore task failed: {err}"))?
        .with_context(|| format!("failed to load state from {}", repository.path().display()))?;
    let snapshot = restorable(snapshot);
    let strategies = snapshot.strategies.len();
    aggregator.restore(snapshot);
    info!(strategies, path = %repository.path().display(), "state restored");
    Ok(())
}

async fn persist(aggregator: &StateAggregator, repository: &JsonStateRepository) -> Result<()> {
    let snapshot = aggregator.snapshot();
    let repo = repository.clone();
    tokio::task::spawn_blocking(move || repo.save(&snapshot))
        .await
        .map_err(|err| anyhow!("state persistence task failed: {err}"))?
        .with_context(|| format!("failed to persist state to {}", repository.path().display()))
}

fn register_primary(bus: &EventBus, venues: &VenueBook, gateway: Arc<dyn ExchangeGateway>) {
    let info = gateway.info();
    let id = venues.insert(gateway);
    if id != PRIMARY_VENUE {
        warn!(venue = %id, "primary gateway reports a non-primary venue id");
    }
    bus.publish(EventPayload::Connection(ConnectionEvent {
        change: ConnectionChange::Created,
        connection: ExchangeConnection {
            id: id.clone(),
            exchange: info.name,
            testnet: false,
            api_key_hint: String::new(),
            status: LinkStatus::Connected,
            created_at: Utc::now(),
            last_tested_at: None,
        },
    }));
    info!(venue = %id, "primary venue registered");
}

/// Republish asynchronous venue updates as bus events.
fn spawn_ingestion(
    bus: EventBus,
    mut updates: VenueUpdateReceiver,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let update = tokio::select! {
                _ = shutdown.wait() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };
            bus.publish(match update {
                VenueUpdate::Order(order) => EventPayload::OrderUpdate(order),
                VenueUpdate::Trade(trade) => EventPayload::Trade(trade),
                VenueUpdate::Position(position) => EventPayload::Position(position),
                VenueUpdate::Balance(balance) => EventPayload::Balance(balance),
                VenueUpdate::Price(price) => EventPayload::Price(price),
            });
        }
        debug!("venue update ingestion stopped");
    })
}

fn spawn_persistence(
    aggregator: Arc<StateAggregator>,
    repository: JsonStateRepository,
    interval: Duration,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while shutdown.sleep(interval).await {
            if let Err(err) = persist(&aggregator, &repository).await {
                warn!(error = %err, "periodic state persistence failed");
            }
        }
    })
}

fn spawn_status_reporter(
    context: Arc<ControlContext>,
    interval: Duration,
    shutdown: ShutdownSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while shutdown.sleep(interval).await {
            context
                .bus
                .publish(EventPayload::SystemStatus(context.system_status()));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_signal_wakes_waiters_and_interrupts_sleep() {
        let signal = ShutdownSignal::new();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.sleep(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        signal.trigger();
        assert!(!waiter.await.unwrap());
        signal.wait().await;
        assert!(!signal.sleep(Duration::from_millis(1)).await);
    }
}
