use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use helm_cli::{Collaborators, ControlPlane, ShutdownSignal};
use helm_config::AppConfig;
use helm_events::EventBus;
use helm_test_utils::{MockGateway, MockStrategyDriver, WsTestClient};
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const WAIT: Duration = Duration::from_secs(3);

struct Harness {
    plane: ControlPlane,
    gateway: Arc<MockGateway>,
}

impl Harness {
    async fn start(state_path: &Path) -> Result<Self> {
        Self::start_with(state_path, |_| {}).await
    }

    async fn start_with(state_path: &Path, tweak: impl FnOnce(&mut AppConfig)) -> Result<Self> {
        let mut config = AppConfig::default();
        config.server.ws_addr = "127.0.0.1:0".into();
        config.server.http_addr = "127.0.0.1:0".into();
        config.server.command_timeout_ms = 2_000;
        config.heartbeat.ping_interval_ms = 100;
        config.heartbeat.pong_timeout_ms = 400;
        config.state.path = state_path.to_path_buf();
        config.state.persist_interval_secs = 0;
        config.telemetry.status_interval_secs = 0;
        tweak(&mut config);

        let gateway = Arc::new(MockGateway::primary());
        let collaborators = Collaborators::new(Arc::new(MockStrategyDriver::default()))
            .with_primary(gateway.clone());
        let plane = ControlPlane::start(
            &config,
            collaborators,
            EventBus::new(config.bus.history_limit),
            ShutdownSignal::new(),
        )
        .await?;
        Ok(Self { plane, gateway })
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{path}", self.plane.ws_addr())
    }

    /// Connect and consume the initial snapshot.
    async fn client(&self) -> Result<(WsTestClient, Value)> {
        self.client_at("/ws").await
    }

    async fn client_at(&self, path: &str) -> Result<(WsTestClient, Value)> {
        let mut client = WsTestClient::connect(&self.url(path)).await?;
        let snapshot = client.next_frame(WAIT).await?;
        Ok((client, snapshot))
    }

    async fn wait_for_clients(&self, expected: usize) -> Result<()> {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.plane.registry().len() != expected {
            if tokio::time::Instant::now() >= deadline {
                bail!(
                    "expected {expected} client(s), registry holds {}",
                    self.plane.registry().len()
                );
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        Ok(())
    }
}

async fn http_get(addr: SocketAddr, path: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut raw = String::new();
    stream.read_to_string(&mut raw).await?;
    let (head, body) = raw.split_once("\r\n\r\n").context("malformed HTTP response")?;
    let status = head
        .split_whitespace()
        .nth(1)
        .context("missing status code")?
        .parse()?;
    Ok((status, body.to_string()))
}

#[tokio::test]
async fn snapshot_is_the_first_frame() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start(&dir.path().join("snapshot.json")).await?;
    let (_client, snapshot) = harness.client().await?;

    assert_eq!(snapshot["type"], "snapshot");
    assert_eq!(snapshot["connections"][0]["id"], "primary");
    assert_eq!(snapshot["last_seq"], json!(harness.plane.bus().last_seq()));
    assert!(snapshot["strategies"].as_array().unwrap().is_empty());

    harness.plane.shutdown().await
}

#[tokio::test]
async fn commands_echo_their_correlation_id() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start(&dir.path().join("snapshot.json")).await?;
    let (mut client, _) = harness.client().await?;

    client.send_json(&json!({"cmd": "get_system_status", "correlation_id": "req-7"}))?;
    let result = client.command_result("get_system_status", WAIT).await?;
    assert_eq!(result["success"], true);
    assert_eq!(result["correlation_id"], "req-7");
    assert_eq!(result["connected_clients"], 1);

    let unknown = client.call("warp_drive", json!({}), WAIT).await?;
    assert_eq!(unknown["success"], false);
    assert_eq!(unknown["error_kind"], "unknown_command");

    harness.plane.shutdown().await
}

#[tokio::test]
async fn top_level_params_keep_their_type() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start(&dir.path().join("snapshot.json")).await?;
    let (mut client, _) = harness.client().await?;

    client.send_json(&json!({
        "cmd": "create_strategy",
        "name": "grid-1",
        "type": "grid",
        "exchange": "primary",
        "pair": "BTC-USDT",
    }))?;
    let created = client.command_result("create_strategy", WAIT).await?;
    assert_eq!(created["success"], true, "{created}");
    assert_eq!(created["strategy"]["kind"], "grid");

    client.send_json(&json!({
        "cmd": "place_order",
        "symbol": "BTC-USDT",
        "side": "buy",
        "type": "limit",
        "size": 1,
        "price": 100,
        "correlation_id": 42,
    }))?;
    let placed = client.command_result("place_order", WAIT).await?;
    assert_eq!(placed["success"], true, "{placed}");
    assert_eq!(placed["correlation_id"], 42);
    assert_eq!(placed["order"]["order_type"], "limit");

    client.send_json(&json!({"type": "command", "cmd": "get_orders"}))?;
    let orders = client.command_result("get_orders", WAIT).await?;
    assert_eq!(orders["count"], 1);

    harness.plane.shutdown().await
}

#[tokio::test]
async fn application_ping_is_answered_with_pong() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start(&dir.path().join("snapshot.json")).await?;
    let (mut client, _) = harness.client().await?;

    client.send_json(&json!({"type": "ping"}))?;
    let pong = client.next_of_type("pong", WAIT).await?;
    assert_eq!(pong["seq"], 0);

    harness.plane.shutdown().await
}

#[tokio::test]
async fn malformed_frames_do_not_drop_the_connection() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start(&dir.path().join("snapshot.json")).await?;
    let (mut client, _) = harness.client().await?;

    client.send_text("{not json")?;
    client.send_json(&json!([1, 2, 3]))?;
    client.send_json(&json!({"hello": "world"}))?;
    let result = client.call("get_state", json!({}), WAIT).await?;
    assert_eq!(result["success"], true);
    assert_eq!(harness.plane.registry().len(), 1);

    harness.plane.shutdown().await
}

#[tokio::test]
async fn events_fan_out_to_every_client() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start(&dir.path().join("snapshot.json")).await?;
    let (mut actor, _) = harness.client().await?;
    let (mut observer, _) = harness.client_at("/api/stream").await?;

    let created = actor
        .call(
            "create_strategy",
            json!({"name": "grid-1", "type": "grid", "exchange": "primary", "pair": "BTC-USDT"}),
            WAIT,
        )
        .await?;
    assert_eq!(created["success"], true);

    let event = observer.next_of_type("strategy", WAIT).await?;
    assert_eq!(event["change"], "created");
    assert_eq!(event["strategy"]["id"], created["id"]);
    assert!(event["seq"].as_u64().unwrap() > 0);

    let echoed = actor.next_of_type("strategy", WAIT).await?;
    assert_eq!(echoed["seq"], event["seq"]);

    harness.plane.shutdown().await
}

#[tokio::test]
async fn unresponsive_clients_are_dropped_and_responsive_ones_kept() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start(&dir.path().join("snapshot.json")).await?;
    let (mut stalled, _) = harness.client().await?;
    let (mut healthy, _) = harness.client().await?;
    stalled.set_auto_pong(false);

    assert!(stalled.wait_closed(WAIT).await, "stalled client was not dropped");
    harness.wait_for_clients(1).await?;

    let result = healthy.call("get_system_status", json!({}), WAIT).await?;
    assert_eq!(result["connected_clients"], 1);

    harness.plane.shutdown().await
}

#[tokio::test]
async fn reconnecting_with_the_same_client_id_replaces_the_old_session() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start(&dir.path().join("snapshot.json")).await?;
    let (mut first, _) = harness.client_at("/ws?client_id=desk-1").await?;
    let (mut second, _) = harness.client_at("/ws?client_id=desk-1").await?;

    assert!(first.wait_closed(WAIT).await, "replaced session stayed open");
    harness.wait_for_clients(1).await?;
    let result = second.call("get_system_status", json!({}), WAIT).await?;
    assert_eq!(result["success"], true);

    harness.plane.shutdown().await
}

#[tokio::test]
async fn unknown_paths_and_excess_clients_are_rejected() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start_with(&dir.path().join("snapshot.json"), |config| {
        config.server.max_clients = 1;
    })
    .await?;

    assert!(WsTestClient::connect(&harness.url("/nope")).await.is_err());

    let (_admitted, _) = harness.client().await?;
    let mut excess = WsTestClient::connect(&harness.url("/ws")).await?;
    assert!(excess.wait_closed(WAIT).await, "client over the limit was admitted");
    assert_eq!(harness.plane.registry().len(), 1);

    harness.plane.shutdown().await
}

#[tokio::test]
async fn kill_switch_over_the_wire() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start(&dir.path().join("snapshot.json")).await?;
    let (mut client, _) = harness.client().await?;

    let created = client
        .call(
            "create_strategy",
            json!({"name": "mm", "type": "pure_market_making", "exchange": "primary", "pair": "ETH-USDT"}),
            WAIT,
        )
        .await?;
    let id = created["id"].clone();
    let started = client.call("start_strategy", json!({"id": id}), WAIT).await?;
    assert_eq!(started["success"], true);
    let placed = client
        .call(
            "place_order",
            json!({"symbol": "ETH-USDT", "side": "buy", "type": "limit", "size": 1, "price": 1500}),
            WAIT,
        )
        .await?;
    assert_eq!(placed["success"], true);

    let result = client.call("kill_switch", json!({}), WAIT).await?;
    assert_eq!(result["success"], true);
    assert_eq!(result["stopped_count"], 1);
    assert_eq!(result["cancelled_count"], 1);
    assert_eq!(result["failed_count"], 0);
    assert!(harness.gateway.open_order_ids().is_empty());

    let alert = client.next_of_type("error", WAIT).await?;
    assert_eq!(alert["error_type"], "kill_switch");

    let state = client.call("get_state", json!({}), WAIT).await?;
    assert_eq!(state["strategies"][0]["status"], "stopped");
    assert!(state["orders"].as_array().unwrap().is_empty());

    harness.plane.shutdown().await
}

#[tokio::test]
async fn http_surface_reports_health_and_state() -> Result<()> {
    let dir = tempdir()?;
    let harness = Harness::start(&dir.path().join("snapshot.json")).await?;
    let (_client, _) = harness.client().await?;
    harness.wait_for_clients(1).await?;

    let (status, body) = http_get(harness.plane.http_addr(), "/health").await?;
    assert_eq!(status, 200);
    let health: Value = serde_json::from_str(&body)?;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["connected_clients"], 1);
    assert_eq!(health["clients"][0]["state"], "open");

    let (status, body) = http_get(harness.plane.http_addr(), "/api/state").await?;
    assert_eq!(status, 200);
    let state: Value = serde_json::from_str(&body)?;
    assert_eq!(state["connections"][0]["id"], "primary");

    let (status, body) = http_get(harness.plane.http_addr(), "/metrics").await?;
    assert_eq!(status, 200);
    assert!(body.contains("helm_"));

    let (status, _) = http_get(harness.plane.http_addr(), "/missing").await?;
    assert_eq!(status, 404);

    harness.plane.shutdown().await
}

#[tokio::test]
async fn strategies_survive_a_restart_stopped() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("snapshot.json");
    let harness = Harness::start(&path).await?;
    let (mut client, _) = harness.client().await?;
    let created = client
        .call(
            "create_strategy",
            json!({"name": "grid-1", "type": "grid", "exchange": "primary", "pair": "BTC-USDT"}),
            WAIT,
        )
        .await?;
    client
        .call("start_strategy", json!({"id": created["id"]}), WAIT)
        .await?;
    drop(client);
    harness.plane.shutdown().await?;
    assert!(path.exists());

    let restarted = Harness::start(&path).await?;
    let (_client, snapshot) = restarted.client().await?;
    assert_eq!(snapshot["strategies"][0]["id"], created["id"]);
    assert_eq!(snapshot["strategies"][0]["status"], "stopped");

    restarted.plane.shutdown().await
}
