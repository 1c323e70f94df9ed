use std::sync::Arc;
use std::time::{Duration, Instant};

use helm_broker::ConnectorRegistry;
use helm_config::RiskConfig;
use helm_core::{
    Command, CommandResult, CommandResultData, EventKind, EventPayload, StrategyStatus,
};
use helm_events::{EventBus, EventSink, Subscription, Topic};
use helm_state::{OrderFilter, StateAggregator};
use helm_test_utils::{GatewayOp, MockGateway, MockStrategyDriver};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::*;
use crate::registry::ConnectionRegistry;
use crate::risk::RiskGuard;

struct Harness {
    router: CommandRouter,
    ctx: Arc<ControlContext>,
    gateway: Arc<MockGateway>,
    driver: Arc<MockStrategyDriver>,
    _state_sub: Subscription,
}

fn harness() -> Harness {
    harness_with(MockGateway::primary())
}

fn harness_with(gateway: MockGateway) -> Harness {
    harness_with_risk(gateway, RiskConfig::default())
}

fn harness_with_risk(gateway: MockGateway, limits: RiskConfig) -> Harness {
    let bus = EventBus::new(100);
    let state = Arc::new(StateAggregator::new());
    let state_sub = bus.subscribe(Topic::All, state.clone() as Arc<dyn EventSink>);
    let gateway = Arc::new(gateway);
    let driver = Arc::new(MockStrategyDriver::default());
    let venues = VenueBook::new();
    venues.insert(gateway.clone());
    let (updates, _) = mpsc::unbounded_channel();
    let ctx = Arc::new(ControlContext {
        bus,
        state,
        registry: ConnectionRegistry::new(8),
        venues,
        connectors: ConnectorRegistry::new(),
        strategies: driver.clone(),
        risk: RiskGuard::new(limits),
        updates,
        call_timeout: Duration::from_millis(200),
        started_at: Instant::now(),
    });
    Harness {
        router: CommandRouter::new(ctx.clone(), Duration::from_secs(2)),
        ctx,
        gateway,
        driver,
        _state_sub: state_sub,
    }
}

impl Harness {
    async fn run(&self, cmd: &str, params: Value) -> CommandResult {
        let Value::Object(params) = params else {
            panic!("params must be an object");
        };
        self.router.handle(Command::new(cmd, params)).await
    }

    async fn ok(&self, cmd: &str, params: Value) -> CommandResultData {
        match self.run(cmd, params).await.outcome {
            Ok(data) => data,
            Err(err) => panic!("{cmd} failed: {err}"),
        }
    }

    async fn err(&self, cmd: &str, params: Value) -> CommandError {
        match self.run(cmd, params).await.outcome {
            Ok(data) => panic!("{cmd} unexpectedly succeeded: {data:?}"),
            Err(err) => err,
        }
    }

    async fn running_strategy(&self, name: &str) -> String {
        let created = self
            .ok(
                "create_strategy",
                json!({"name": name, "type": "grid", "exchange": "primary", "pair": "BTC-USDT"}),
            )
            .await;
        let id = created["id"].as_str().unwrap().to_string();
        self.ok("start_strategy", json!({"id": id})).await;
        id
    }

    async fn limit_order(&self, price: i64) -> String {
        let placed = self
            .ok(
                "place_order",
                json!({"symbol": "BTC-USDT", "side": "buy", "type": "limit", "size": "0.5", "price": price}),
            )
            .await;
        placed["order_id"].as_str().unwrap().to_string()
    }

    fn status_of(&self, id: &str) -> StrategyStatus {
        self.ctx.state.strategy(id).unwrap().status
    }
}

#[test]
fn every_command_name_has_exactly_one_handler() {
    let h = harness();
    for name in CommandName::ALL {
        assert!(h.router.handles(name), "{name} has no handler");
        assert_eq!(name.as_str().parse::<CommandName>().unwrap(), name);
    }
}

#[tokio::test]
async fn unknown_command_is_answered_with_an_error() {
    let h = harness();
    let result = h.run("launch_rocket", json!({})).await;
    assert_eq!(result.cmd, "launch_rocket");
    assert_eq!(result.error().unwrap().kind(), "unknown_command");
    let wire: Value = serde_json::from_str(&result.to_json().unwrap()).unwrap();
    assert_eq!(wire["type"], "command_result");
    assert_eq!(wire["success"], false);
    assert_eq!(wire["error_kind"], "unknown_command");
}

#[tokio::test]
async fn missing_parameters_are_rejected_before_any_collaborator_call() {
    let h = harness();
    let err = h
        .err("place_order", json!({"side": "buy", "type": "market", "size": 1}))
        .await;
    assert_eq!(err.kind(), "invalid_params");
    assert!(err.to_string().contains("symbol"));

    let err = h
        .err(
            "place_order",
            json!({"symbol": "BTC-USDT", "side": "buy", "type": "limit", "size": 1}),
        )
        .await;
    assert_eq!(err.to_string(), "Missing required parameter: price");
    assert_eq!(h.gateway.call_count(GatewayOp::PlaceOrder), 0);
    assert_eq!(h.ctx.bus.last_seq(), 0);
}

#[tokio::test]
async fn strategy_lifecycle_follows_the_transition_table() {
    let h = harness();
    let id = h.running_strategy("grid-1").await;
    assert_eq!(h.status_of(&id), StrategyStatus::Running);

    h.ok("pause_strategy", json!({"id": id})).await;
    assert_eq!(h.status_of(&id), StrategyStatus::Paused);
    let err = h.err("pause_strategy", json!({"id": id})).await;
    assert_eq!(err.kind(), "invalid_state");

    h.ok("resume_strategy", json!({"strategy_id": id})).await;
    let err = h.err("delete_strategy", json!({"id": id})).await;
    assert_eq!(err.kind(), "invalid_state");

    h.ok("stop_strategy", json!({"id": id})).await;
    h.ok("delete_strategy", json!({"id": id})).await;
    assert!(h.ctx.state.strategy(&id).is_none());

    let err = h.err("start_strategy", json!({"id": id})).await;
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn driver_rejection_leaves_status_unchanged() {
    let h = harness();
    let created = h
        .ok(
            "create_strategy",
            json!({"name": "mm", "strategy_type": "pure_market_making", "exchange": "primary", "trading_pair": "ETH-USDT"}),
        )
        .await;
    let id = created["id"].as_str().unwrap().to_string();
    h.driver.fail_start(&id, "insufficient inventory");
    let seq = h.ctx.bus.last_seq();

    let err = h.err("start_strategy", json!({"id": id})).await;
    assert_eq!(err.kind(), "external");
    assert_eq!(h.status_of(&id), StrategyStatus::Created);
    assert_eq!(h.ctx.bus.last_seq(), seq);
}

#[tokio::test]
async fn unsupported_strategy_type_is_invalid() {
    let h = harness();
    let err = h
        .err(
            "create_strategy",
            json!({"name": "x", "type": "martingale", "exchange": "primary", "pair": "BTC-USDT"}),
        )
        .await;
    assert_eq!(err.kind(), "invalid_params");
    assert!(err.to_string().contains("grid"));
}

#[tokio::test]
async fn read_only_commands_never_publish() {
    let h = harness();
    h.running_strategy("grid-1").await;
    h.limit_order(100).await;
    let seq = h.ctx.bus.last_seq();

    for name in CommandName::ALL.into_iter().filter(|name| name.is_read_only()) {
        let result = h.run(name.as_str(), json!({})).await;
        assert!(result.success(), "{name} failed: {:?}", result.error());
    }
    assert_eq!(h.ctx.bus.last_seq(), seq);
}

#[tokio::test]
async fn market_orders_fill_and_leave_the_open_book() {
    let h = harness();
    let placed = h
        .ok(
            "place_order",
            json!({"symbol": "BTC-USDT", "side": "sell", "type": "market", "quantity": 2}),
        )
        .await;
    assert_eq!(placed["order"]["status"], "filled");
    assert!(h.ctx.state.orders(&OrderFilter::default()).is_empty());
}

#[tokio::test]
async fn slow_collaborators_time_out() {
    let h = harness();
    h.gateway.set_delay(Some(Duration::from_millis(500)));
    let err = h
        .err(
            "place_order",
            json!({"symbol": "BTC-USDT", "side": "buy", "type": "market", "size": 1}),
        )
        .await;
    assert_eq!(err.kind(), "external");
    assert!(err.to_string().contains("timed out"));
    assert!(h.ctx.state.orders(&OrderFilter::default()).is_empty());
}

#[tokio::test]
async fn cancel_all_reports_total_failure_as_an_error() {
    let h = harness();
    let order = h.limit_order(100).await;
    h.gateway.fail_cancel(&order, "order locked");

    let err = h.err("cancel_all_orders", json!({})).await;
    assert_eq!(err.kind(), "external");
    assert!(err.to_string().contains("order locked"));
    assert_eq!(h.ctx.state.orders(&OrderFilter::default()).len(), 1);
}

#[tokio::test]
async fn kill_switch_attempts_every_action_and_reports_failures() {
    let h = harness();
    let mut strategies = Vec::new();
    for name in ["a", "b", "c"] {
        strategies.push(h.running_strategy(name).await);
    }
    h.ok("pause_strategy", json!({"id": strategies[2]})).await;
    let kept = h.limit_order(100).await;
    let stuck = h.limit_order(101).await;
    h.gateway.fail_cancel(&stuck, "venue rejected cancel");

    let result = h.ok("kill_switch", json!({})).await;
    assert_eq!(result["stopped_count"], 3);
    assert_eq!(result["cancelled_count"], 1);
    assert_eq!(result["failed_count"], 1);
    assert_eq!(result["cancelled"], json!([kept]));
    assert_eq!(result["failures"][0]["id"], json!(stuck));

    for id in &strategies {
        assert_eq!(h.status_of(id), StrategyStatus::Stopped);
    }
    let open: Vec<_> = h
        .ctx
        .state
        .orders(&OrderFilter::default())
        .into_iter()
        .map(|order| order.id)
        .collect();
    assert_eq!(open, vec![stuck]);

    let alerts = h.ctx.bus.history(Some(EventKind::Error), 5);
    let EventPayload::Error(report) = &alerts.last().unwrap().payload else {
        panic!("expected an error event");
    };
    assert_eq!(report.error_type, "kill_switch");
}

#[tokio::test]
async fn kill_switch_survives_strategy_driver_failures() {
    let h = harness();
    let id = h.running_strategy("a").await;
    h.driver.fail_stop(&id, "driver crashed");

    let result = h.ok("kill_switch", json!({})).await;
    assert_eq!(result["stopped_count"], 0);
    assert_eq!(result["failed_count"], 1);
    assert_eq!(h.status_of(&id), StrategyStatus::Running);
}

#[tokio::test]
async fn primary_connection_cannot_be_deleted() {
    let h = harness();
    let err = h.err("delete_connection", json!({"id": "primary"})).await;
    assert_eq!(err.kind(), "invalid_state");
    let err = h.err("test_connection", json!({"id": "missing"})).await;
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn failed_probe_marks_the_connection_unhealthy() {
    let h = harness();
    h.gateway.fail_next(GatewayOp::Ping, "auth expired");
    let result = h.ok("test_connection", json!({"id": "primary"})).await;
    assert_eq!(result["healthy"], false);
    assert!(result["error_detail"].as_str().unwrap().contains("auth expired"));
    assert_eq!(result["connection"]["status"], "failed");
}

#[tokio::test]
async fn engine_toggle_publishes_only_on_change() {
    let h = harness();
    let first = h.ok("start_engine", json!({})).await;
    assert_eq!(first["changed"], true);
    let seq = h.ctx.bus.last_seq();
    let second = h.ok("start_engine", json!({})).await;
    assert_eq!(second["changed"], false);
    assert_eq!(h.ctx.bus.last_seq(), seq);
    assert!(h.ctx.state.totals().engine_running);
}

#[tokio::test]
async fn sync_account_publishes_only_after_every_fetch_succeeds() {
    let h = harness_with(MockGateway::primary().with_balance("USDT", Decimal::from(2_500)));
    h.gateway.fail_next(GatewayOp::Positions, "rate limited");
    let err = h.err("sync_account", json!({})).await;
    assert_eq!(err.kind(), "external");
    assert!(h.ctx.state.balances().is_empty());

    let synced = h.ok("sync_account", json!({})).await;
    assert_eq!(synced["balances"], 1);
    let balances = h.ctx.state.balances();
    assert_eq!(balances.len(), 1);
    assert_eq!(balances[0].total, Decimal::from(2_500));
}

#[tokio::test]
async fn risk_limits_reject_orders_before_the_venue() {
    let limits = RiskConfig {
        max_order_size: Some(Decimal::ONE),
        max_daily_loss: Some(Decimal::from(100)),
        ..RiskConfig::default()
    };
    let h = harness_with_risk(MockGateway::primary(), limits);
    let order = json!({"symbol": "BTC-USDT", "side": "buy", "type": "limit", "size": 2, "price": 100});
    let err = h.err("place_order", order).await;
    assert_eq!(err.kind(), "invalid_params");
    assert!(err.to_string().contains("exceeds limit 1"));
    assert_eq!(h.gateway.call_count(GatewayOp::PlaceOrder), 0);
    assert_eq!(h.ok("get_orders", json!({})).await["count"], 0);

    h.ctx.bus.publish(EventPayload::Trade(helm_core::Trade {
        trade_id: "t-1".into(),
        order_id: "o-1".into(),
        symbol: "BTC-USDT".into(),
        side: helm_core::Side::Sell,
        price: Decimal::from(90),
        quantity: Decimal::ONE,
        fee: Decimal::ZERO,
        realized_pnl: Decimal::from(-150),
        strategy_id: None,
        executed_at: chrono::Utc::now(),
    }));
    let err = h
        .err(
            "place_order",
            json!({"symbol": "BTC-USDT", "side": "buy", "type": "market", "size": 1}),
        )
        .await;
    assert_eq!(err.kind(), "invalid_state");
    assert_eq!(h.gateway.call_count(GatewayOp::PlaceOrder), 0);

    let status = h.ok("get_system_status", json!({})).await;
    assert_eq!(status["risk"]["daily_pnl"], json!(Decimal::from(-150)));
    assert_eq!(status["risk"]["daily_loss_breached"], true);
    assert_eq!(status["risk"]["max_order_size"], json!(Decimal::ONE));
}
