use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use helm_core::{Event, EventPayload, LogRecord};
use helm_events::{is_dispatching, EventBus, EventSink, SinkError};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::field::{Field, Visit};
use tracing::{Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::Context as LayerContext;
use tracing_subscriber::{fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Republish log records on the event bus at or above `level`.
pub struct LogForwarding {
    pub bus: EventBus,
    pub level: Level,
}

/// Parse `telemetry.forward_level`; `off` disables forwarding.
pub fn parse_forward_level(value: &str) -> Result<Option<Level>> {
    match value.trim().to_lowercase().as_str() {
        "off" | "none" | "" => Ok(None),
        other => other
            .parse::<Level>()
            .map(Some)
            .with_context(|| format!("invalid telemetry.forward_level '{value}'")),
    }
}

/// Install the global tracing subscriber with optional JSON file logging and log
/// forwarding to connected clients.
pub fn init_tracing(
    filter: &str,
    log_path: Option<&Path>,
    forward: Option<LogForwarding>,
) -> Result<()> {
    let stdout_layer = tfmt::layer()
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let file_layer = match log_path {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create log directory {dir:?}"))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let _ = FILE_GUARD.set(guard);
            Some(
                tfmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_target(true)
                    .with_writer(writer)
                    .with_filter(EnvFilter::new(filter)),
            )
        }
        None => None,
    };

    let forward_layer = forward.map(|forward| {
        BusLogLayer::new(forward.bus).with_filter(LevelFilter::from_level(forward.level))
    });

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .with(forward_layer)
        .try_init()?;
    Ok(())
}

/// Tracing layer that turns log records into `log` events.
///
/// Records emitted while the bus is dispatching are skipped so a failing sink cannot
/// feed its own warning back into the bus.
pub struct BusLogLayer {
    bus: EventBus,
}

impl BusLogLayer {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl<S: Subscriber> Layer<S> for BusLogLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: LayerContext<'_, S>) {
        if is_dispatching() {
            return;
        }
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.bus.publish(EventPayload::Log(LogRecord {
            level: metadata.level().as_str().to_lowercase(),
            message: visitor.finish(),
            target: metadata.target().to_string(),
        }));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }
}

/// Prometheus metrics exported by the control plane.
pub struct ControlMetrics {
    registry: Registry,
    connections_active: IntGauge,
    connections_total: IntCounter,
    commands_total: IntCounterVec,
    events_published: IntCounterVec,
    heartbeat_timeouts: IntCounter,
    protocol_errors: IntCounter,
}

impl ControlMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let connections_active = IntGauge::new(
            "helm_ws_connections_active",
            "Currently registered WebSocket clients",
        )?;
        let connections_total = IntCounter::new(
            "helm_ws_connections_total",
            "WebSocket clients accepted since start",
        )?;
        let commands_total = IntCounterVec::new(
            Opts::new("helm_commands_total", "Commands handled by outcome"),
            &["cmd", "outcome"],
        )?;
        let events_published = IntCounterVec::new(
            Opts::new("helm_events_published_total", "Events published on the bus"),
            &["kind"],
        )?;
        let heartbeat_timeouts = IntCounter::new(
            "helm_heartbeat_timeouts_total",
            "Connections closed for missing the pong deadline",
        )?;
        let protocol_errors = IntCounter::new(
            "helm_protocol_errors_total",
            "Inbound frames dropped as malformed",
        )?;

        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(commands_total.clone()))?;
        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(heartbeat_timeouts.clone()))?;
        registry.register(Box::new(protocol_errors.clone()))?;

        Ok(Self {
            registry,
            connections_active,
            connections_total,
            commands_total,
            events_published,
            heartbeat_timeouts,
            protocol_errors,
        })
    }

    pub fn connection_opened(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn connection_closed(&self) {
        self.connections_active.dec();
    }

    pub fn inc_command(&self, cmd: &str, outcome: &str) {
        self.commands_total.with_label_values(&[cmd, outcome]).inc();
    }

    pub fn inc_heartbeat_timeout(&self) {
        self.heartbeat_timeouts.inc();
    }

    pub fn inc_protocol_error(&self) {
        self.protocol_errors.inc();
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|err| prometheus::Error::Msg(err.to_string()))
    }
}

impl EventSink for ControlMetrics {
    fn deliver(&self, event: &Event) -> Result<(), SinkError> {
        self.events_published
            .with_label_values(&[event.kind().as_str()])
            .inc();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_events::Topic;
    use std::sync::Arc;

    #[test]
    fn forward_level_parses() {
        assert_eq!(parse_forward_level("off").unwrap(), None);
        assert_eq!(parse_forward_level("WARN").unwrap(), Some(Level::WARN));
        assert!(parse_forward_level("loud").is_err());
    }

    #[test]
    fn metrics_count_published_events() {
        let metrics = Arc::new(ControlMetrics::new().unwrap());
        let bus = EventBus::default();
        let _sub = bus.subscribe(Topic::All, metrics.clone());
        bus.publish(EventPayload::Ping);
        bus.publish(EventPayload::Ping);
        metrics.inc_command("get_state", "ok");
        metrics.connection_opened();

        let text = metrics.encode().unwrap();
        assert!(text.contains("helm_events_published_total{kind=\"ping\"} 2"));
        assert!(text.contains("helm_commands_total{cmd=\"get_state\",outcome=\"ok\"} 1"));
        assert!(text.contains("helm_ws_connections_active 1"));
    }

    #[test]
    fn log_layer_publishes_records() {
        let bus = EventBus::default();
        let subscriber = tracing_subscriber::registry()
            .with(BusLogLayer::new(bus.clone()).with_filter(LevelFilter::INFO));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(client = "client_1", "client connected");
            tracing::debug!("filtered out");
        });

        let history = bus.history(None, 10);
        assert_eq!(history.len(), 1);
        match &history[0].payload {
            EventPayload::Log(record) => {
                assert_eq!(record.level, "info");
                assert_eq!(record.message, "client connected client=client_1");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
