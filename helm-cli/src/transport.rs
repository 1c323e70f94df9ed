//! WebSocket endpoint: one session task per client connection.
//!
//! A session owns both halves of its socket. Events reach it through a bounded
//! [`QueueSink`] subscribed to the bus, command results through a per-connection
//! worker, and liveness through the [`Heartbeat`] state machine. Everything that writes
//! to the socket runs inside the session loop, so frames are never interleaved.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use helm_config::{AppConfig, HeartbeatConfig};
use helm_core::{
    parse_frame, Command, CommandError, CommandResult, Event, EventPayload, InboundFrame,
    ProtocolError,
};
use helm_events::{EventBus, EventSink, QueueSink, Topic};
use helm_state::StateAggregator;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::control::CommandRouter;
use crate::heartbeat::{Heartbeat, HeartbeatAction};
use crate::registry::{CloseReason, ConnectionRegistry};
use crate::runtime::ShutdownSignal;
use crate::telemetry::ControlMetrics;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Commands a single client may have queued before new ones are refused.
const COMMAND_BACKLOG: usize = 32;
const CLOSE_GRACE: Duration = Duration::from_millis(250);

#[derive(Clone, Debug)]
pub struct TransportSettings {
    /// Upgrade paths accepted; anything else is answered with `404`.
    pub paths: Vec<String>,
    pub queue_capacity: usize,
    pub heartbeat: HeartbeatConfig,
    pub command_backlog: usize,
}

impl TransportSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            paths: config.server.ws_paths.clone(),
            queue_capacity: config.server.outbound_queue_capacity,
            heartbeat: config.heartbeat.clone(),
            command_backlog: COMMAND_BACKLOG,
        }
    }

    /// Bound on a single socket write. A client that cannot drain one frame within a
    /// pong timeout is treated as dead.
    fn write_timeout(&self) -> Duration {
        self.heartbeat.pong_timeout()
    }
}

/// Why a session ended.
#[derive(Debug)]
enum Exit {
    ClientClosed,
    Replaced,
    Shutdown,
    HeartbeatExpired,
    WriteFailed(String),
}

impl Exit {
    fn close_frame(&self) -> Option<CloseFrame<'static>> {
        let (code, reason) = match self {
            Self::ClientClosed => (CloseCode::Normal, "bye"),
            Self::Replaced => (CloseCode::Policy, "replaced by a newer connection"),
            Self::Shutdown => (CloseCode::Away, "server shutting down"),
            Self::HeartbeatExpired => (CloseCode::Policy, "heartbeat timeout"),
            Self::WriteFailed(_) => return None,
        };
        Some(CloseFrame {
            code,
            reason: reason.into(),
        })
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::Replaced => f.write_str("replaced"),
            Self::Shutdown => f.write_str("shutdown"),
            Self::HeartbeatExpired => f.write_str("heartbeat expired"),
            Self::WriteFailed(err) => write!(f, "write failed: {err}"),
        }
    }
}

/// Accepts WebSocket clients and runs their sessions.
pub struct Transport {
    registry: ConnectionRegistry,
    bus: EventBus,
    state: Arc<StateAggregator>,
    router: Arc<CommandRouter>,
    metrics: Arc<ControlMetrics>,
    settings: TransportSettings,
}

impl Transport {
    pub fn new(
        registry: ConnectionRegistry,
        bus: EventBus,
        state: Arc<StateAggregator>,
        router: Arc<CommandRouter>,
        metrics: Arc<ControlMetrics>,
        settings: TransportSettings,
    ) -> Self {
        Self {
            registry,
            bus,
            state,
            router,
            metrics,
            settings,
        }
    }

    /// Accept connections until `shutdown` fires, then ask every session to close.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let transport = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = transport.handle_socket(stream, peer).await {
                                debug!(%peer, error = %err, "websocket connection ended with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "failed to accept websocket connection"),
                }
            }
        }
        info!("websocket endpoint stopped accepting connections");
        self.registry.close_all(CloseReason::Shutdown);
    }

    async fn handle_socket(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let captured: Arc<Mutex<Option<(String, Option<String>)>>> = Arc::new(Mutex::new(None));
        let capture = captured.clone();
        let paths = self.settings.paths.clone();
        let mut ws = accept_hdr_async(stream, move |req: &Request, resp: Response| {
            let path = req.uri().path().to_string();
            if !paths.iter().any(|allowed| *allowed == path) {
                let mut reject = ErrorResponse::new(Some(format!("no websocket endpoint at {path}")));
                *reject.status_mut() = StatusCode::NOT_FOUND;
                return Err(reject);
            }
            *capture.lock() = Some((path, req.uri().query().map(str::to_string)));
            Ok(resp)
        })
        .await
        .with_context(|| format!("websocket handshake with {peer} failed"))?;

        let (path, query) = captured.lock().take().unwrap_or_default();
        let client_id = self
            .registry
            .assign_id(query_param(query.as_deref(), "client_id"));
        let registration = match self.registry.register(&client_id, &path) {
            Ok(registration) => registration,
            Err(err) => {
                warn!(client = %client_id, %peer, error = %err, "rejecting websocket client");
                let frame = CloseFrame {
                    code: CloseCode::Again,
                    reason: err.to_string().into(),
                };
                let _ = timeout(CLOSE_GRACE, ws.close(Some(frame))).await;
                return Ok(());
            }
        };
        let generation = registration.generation;

        let queue = QueueSink::new(self.settings.queue_capacity);
        let state = self.state.clone();
        let seeded = self.bus.subscribe_seeded(
            Topic::All,
            queue.clone() as Arc<dyn EventSink>,
            move |last_seq| {
                let mut snapshot = state.snapshot();
                snapshot.last_seq = last_seq;
                EventPayload::Snapshot(snapshot)
            },
        );
        let subscription = match seeded {
            Ok(subscription) => subscription,
            Err(err) => {
                error!(client = %client_id, error = %err, "failed to subscribe client");
                self.registry.remove(&client_id, generation);
                return Ok(());
            }
        };
        if !self.registry.attach(&client_id, generation, subscription) {
            debug!(client = %client_id, "registration replaced before it opened");
            return Ok(());
        }
        self.metrics.connection_opened();
        info!(client = %client_id, %peer, path = %path, "client connected");

        let (sink, source) = ws.split();
        let mut session = Session {
            id: client_id.clone(),
            generation,
            sink,
            heartbeat: Heartbeat::new(&self.settings.heartbeat, Instant::now()),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            write_timeout: self.settings.write_timeout(),
        };

        let backlog = self.settings.command_backlog.max(1);
        let (command_tx, command_rx) = mpsc::channel(backlog);
        let (reply_tx, reply_rx) = mpsc::channel(backlog);
        let worker = spawn_command_worker(self.router.clone(), command_rx, reply_tx);

        let exit = match session.write_pending(&queue).await {
            Ok(()) => {
                session
                    .run(source, &queue, registration.close_rx, command_tx, reply_rx)
                    .await
            }
            Err(exit) => exit,
        };

        self.registry.mark_closing(&client_id, generation);
        if let Some(frame) = exit.close_frame() {
            let _ = timeout(CLOSE_GRACE, session.sink.send(Message::Close(Some(frame)))).await;
        }
        self.registry.remove(&client_id, generation);
        queue.close();
        self.metrics.connection_closed();
        // The worker finishes the command in flight and then stops.
        drop(worker);
        info!(client = %client_id, reason = %exit, "client disconnected");
        Ok(())
    }
}

struct Session {
    id: String,
    generation: u64,
    sink: WsSink,
    heartbeat: Heartbeat,
    registry: ConnectionRegistry,
    metrics: Arc<ControlMetrics>,
    write_timeout: Duration,
}

impl Session {
    async fn run(
        &mut self,
        mut source: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
        queue: &QueueSink,
        mut close_rx: oneshot::Receiver<CloseReason>,
        commands: mpsc::Sender<Command>,
        mut replies: mpsc::Receiver<CommandResult>,
    ) -> Exit {
        loop {
            let wakeup = tokio::time::Instant::from_std(self.heartbeat.next_wakeup());
            let step = tokio::select! {
                reason = &mut close_rx => Err(match reason {
                    Ok(CloseReason::Replaced) => Exit::Replaced,
                    Ok(CloseReason::Shutdown) | Err(_) => Exit::Shutdown,
                }),
                inbound = source.next() => match inbound {
                    Some(Ok(message)) => self.on_message(message, &commands).await,
                    Some(Err(err)) => {
                        debug!(client = %self.id, error = %err, "websocket read failed");
                        Err(Exit::ClientClosed)
                    }
                    None => Err(Exit::ClientClosed),
                },
                event = queue.recv() => match event {
                    Some(event) => self.send_event(&event).await,
                    None => Err(Exit::Shutdown),
                },
                Some(result) = replies.recv() => self.send_result(&result).await,
                _ = tokio::time::sleep_until(wakeup) => self.on_heartbeat().await,
            };
            if let Err(exit) = step {
                return exit;
            }
        }
    }

    /// Flush whatever is already queued, which always starts with the snapshot.
    async fn write_pending(&mut self, queue: &QueueSink) -> Result<(), Exit> {
        while let Some(event) = queue.try_recv() {
            self.send_event(&event).await?;
        }
        Ok(())
    }

    async fn on_message(
        &mut self,
        message: Message,
        commands: &mpsc::Sender<Command>,
    ) -> Result<(), Exit> {
        match message {
            Message::Text(text) => match parse_frame(&text) {
                Ok(InboundFrame::Ping) => self.send_event(&Event::new(EventPayload::Pong)).await,
                Ok(InboundFrame::Pong) => {
                    self.on_pong();
                    Ok(())
                }
                Ok(InboundFrame::Command(command)) => match commands.try_send(command) {
                    Ok(()) => Ok(()),
                    Err(TrySendError::Full(command) | TrySendError::Closed(command)) => {
                        warn!(client = %self.id, cmd = %command.name, "command backlog full");
                        let result = CommandResult::new(
                            command.name,
                            command.correlation_id,
                            Err(CommandError::External("too many pending commands".into())),
                        );
                        self.send_result(&result).await
                    }
                },
                Err(ProtocolError::InvalidCommand(err)) => {
                    self.metrics.inc_protocol_error();
                    debug!(client = %self.id, error = %err, "invalid command frame");
                    self.send_result(&CommandResult::new("", None, Err(err)))
                        .await
                }
                Err(err) => {
                    self.protocol_error(&err);
                    Ok(())
                }
            },
            Message::Binary(_) => {
                self.protocol_error(&ProtocolError::Binary);
                Ok(())
            }
            Message::Ping(payload) => self.write(Message::Pong(payload)).await,
            Message::Pong(_) => {
                self.on_pong();
                Ok(())
            }
            Message::Close(_) => Err(Exit::ClientClosed),
            Message::Frame(_) => Ok(()),
        }
    }

    async fn on_heartbeat(&mut self) -> Result<(), Exit> {
        match self.heartbeat.poll(Instant::now()) {
            Some(HeartbeatAction::SendPing) => {
                self.send_event(&Event::new(EventPayload::Ping)).await
            }
            Some(HeartbeatAction::Expired) => {
                self.registry.record_missed_pong(&self.id, self.generation);
                self.metrics.inc_heartbeat_timeout();
                warn!(client = %self.id, "no pong before deadline, dropping client");
                Err(Exit::HeartbeatExpired)
            }
            None => Ok(()),
        }
    }

    fn on_pong(&mut self) {
        self.heartbeat.on_pong(Instant::now());
        self.registry.record_pong(&self.id, self.generation);
    }

    fn protocol_error(&self, err: &ProtocolError) {
        self.metrics.inc_protocol_error();
        warn!(client = %self.id, error = %err, "dropping malformed frame");
    }

    async fn send_event(&mut self, event: &Event) -> Result<(), Exit> {
        match event.to_json() {
            Ok(text) => self.write(Message::Text(text)).await,
            Err(err) => {
                error!(kind = %event.kind(), seq = event.seq, error = %err, "failed to encode event");
                Ok(())
            }
        }
    }

    async fn send_result(&mut self, result: &CommandResult) -> Result<(), Exit> {
        match result.to_json() {
            Ok(text) => self.write(Message::Text(text)).await,
            Err(err) => {
                error!(cmd = %result.cmd, error = %err, "failed to encode command result");
                Ok(())
            }
        }
    }

    async fn write(&mut self, message: Message) -> Result<(), Exit> {
        match timeout(self.write_timeout, self.sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(Exit::WriteFailed(err.to_string())),
            Err(_) => Err(Exit::WriteFailed(format!(
                "write stalled for {}ms",
                self.write_timeout.as_millis()
            ))),
        }
    }
}

/// Executes one client's commands in arrival order.
fn spawn_command_worker(
    router: Arc<CommandRouter>,
    mut commands: mpsc::Receiver<Command>,
    replies: mpsc::Sender<CommandResult>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let result = router.handle(command).await;
            if replies.send(result).await.is_err() {
                break;
            }
        }
    })
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == key)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_is_read_from_the_query_string() {
        assert_eq!(query_param(Some("client_id=desk-1"), "client_id"), Some("desk-1"));
        assert_eq!(
            query_param(Some("token=x&client_id=ops"), "client_id"),
            Some("ops")
        );
        assert_eq!(query_param(Some("client_id="), "client_id"), None);
        assert_eq!(query_param(None, "client_id"), None);
    }

    #[test]
    fn only_orderly_exits_send_a_close_frame() {
        assert!(Exit::Replaced.close_frame().is_some());
        assert!(Exit::HeartbeatExpired.close_frame().is_some());
        assert!(Exit::WriteFailed("reset".into()).close_frame().is_none());
    }
}
