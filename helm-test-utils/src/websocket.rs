use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

enum Inbound {
    Json(Value),
    Closed,
}

/// WebSocket client speaking the control-plane JSON protocol.
///
/// Server `ping` frames are answered automatically unless disabled with
/// [`WsTestClient::set_auto_pong`], which lets a test play an unresponsive client.
/// Frames passed over while waiting for a command result stay buffered and are
/// returned by later reads.
pub struct WsTestClient {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    skipped: VecDeque<Value>,
    auto_pong: Arc<AtomicBool>,
    closed: bool,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WsTestClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let auto_pong = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let reply = out_tx.clone();
        let pong = auto_pong.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let Ok(value) = serde_json::from_str::<Value>(&text) else {
                            debug!(frame = %text, "ignoring non-JSON frame");
                            continue;
                        };
                        if value["type"] == "ping" && pong.load(Ordering::SeqCst) {
                            let _ = reply.send(Message::Text(json!({"type": "pong"}).to_string()));
                        }
                        if in_tx.send(Inbound::Json(value)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if pong.load(Ordering::SeqCst) {
                            let _ = reply.send(Message::Pong(payload));
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = in_tx.send(Inbound::Closed);
        });

        Ok(Self {
            outbound: out_tx,
            inbound: in_rx,
            skipped: VecDeque::new(),
            auto_pong,
            closed: false,
            reader,
            writer,
        })
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        self.auto_pong.store(enabled, Ordering::SeqCst);
    }

    pub fn send_message(&self, message: Message) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| anyhow!("websocket writer has stopped"))
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.send_message(Message::Text(text.into()))
    }

    pub fn send_json(&self, value: &Value) -> Result<()> {
        self.send_text(value.to_string())
    }

    /// Send `{"cmd": cmd, "params": params}`.
    pub fn command(&self, cmd: &str, params: Value) -> Result<()> {
        self.send_json(&json!({ "cmd": cmd, "params": params }))
    }

    /// Next JSON frame, failing on timeout or when the server closed the socket.
    pub async fn next_frame(&mut self, wait: Duration) -> Result<Value> {
        if let Some(frame) = self.skipped.pop_front() {
            return Ok(frame);
        }
        self.recv_frame(wait).await
    }

    async fn recv_frame(&mut self, wait: Duration) -> Result<Value> {
        if self.closed {
            bail!("connection closed");
        }
        match timeout(wait, self.inbound.recv()).await {
            Ok(Some(Inbound::Json(value))) => Ok(value),
            Ok(Some(Inbound::Closed)) | Ok(None) => {
                self.closed = true;
                bail!("connection closed")
            }
            Err(_) => bail!("no frame within {wait:?}"),
        }
    }

    /// Skip frames until one whose `type` is `kind`.
    pub async fn next_of_type(&mut self, kind: &str, wait: Duration) -> Result<Value> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self
                .next_frame(remaining)
                .await
                .with_context(|| format!("waiting for a '{kind}' frame"))?;
            if frame["type"] == kind {
                return Ok(frame);
            }
        }
    }

    /// Wait for the `command_result` answering `cmd`, buffering every other frame.
    pub async fn command_result(&mut self, cmd: &str, wait: Duration) -> Result<Value> {
        let answers = |frame: &Value| frame["type"] == "command_result" && frame["cmd"] == cmd;
        if let Some(idx) = self.skipped.iter().position(answers) {
            if let Some(frame) = self.skipped.remove(idx) {
                return Ok(frame);
            }
        }
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = self
                .recv_frame(remaining)
                .await
                .with_context(|| format!("waiting for the '{cmd}' result"))?;
            if answers(&frame) {
                return Ok(frame);
            }
            self.skipped.push_back(frame);
        }
    }

    /// Send a command and wait for its result.
    pub async fn call(&mut self, cmd: &str, params: Value, wait: Duration) -> Result<Value> {
        self.command(cmd, params)?;
        self.command_result(cmd, wait).await
    }

    /// True once the server closed the socket within `wait`.
    pub async fn wait_closed(&mut self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        while !self.closed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match timeout(remaining, self.inbound.recv()).await {
                Ok(Some(Inbound::Json(_))) => {}
                Ok(Some(Inbound::Closed)) | Ok(None) => self.closed = true,
                Err(_) => return false,
            }
        }
        true
    }

    pub fn close(&self) {
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl Drop for WsTestClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
