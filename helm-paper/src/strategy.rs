use std::collections::HashMap;

use async_trait::async_trait;
use helm_broker::{BrokerError, BrokerResult, StrategyDriver};
use helm_core::{StrategyId, StrategyInstance};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::info;

/// Strategy families the paper driver accepts.
pub const PAPER_STRATEGY_KINDS: [&str; 4] = [
    "market_maker",
    "pure_market_making",
    "perpetual_market_making",
    "spot_perpetual_arbitrage",
];

/// Numeric settings that must be positive when present.
const POSITIVE_SETTINGS: [&str; 4] = ["order_amount", "bid_spread", "ask_spread", "min_profitability"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RunState {
    Running,
    Paused,
}

/// Tracks which strategies are running without executing any algorithm.
#[derive(Default)]
pub struct PaperStrategyDriver {
    running: Mutex<HashMap<StrategyId, RunState>>,
}

impl PaperStrategyDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.lock().get(id) == Some(&RunState::Running)
    }

    fn validate(strategy: &StrategyInstance) -> BrokerResult<()> {
        if !PAPER_STRATEGY_KINDS.contains(&strategy.kind.as_str()) {
            return Err(BrokerError::InvalidRequest(format!(
                "unsupported strategy type '{}'",
                strategy.kind
            )));
        }
        for key in POSITIVE_SETTINGS {
            let Some(value) = strategy.config.get(key) else {
                continue;
            };
            let parsed = match value {
                Value::Number(num) => num.to_string().parse::<Decimal>().ok(),
                Value::String(text) => text.parse::<Decimal>().ok(),
                _ => None,
            };
            match parsed {
                Some(amount) if amount > Decimal::ZERO => {}
                _ => {
                    return Err(BrokerError::InvalidRequest(format!(
                        "{key} must be a positive number"
                    )))
                }
            }
        }
        Ok(())
    }

    fn transition(
        &self,
        strategy: &StrategyInstance,
        from: Option<RunState>,
        to: Option<RunState>,
    ) -> BrokerResult<()> {
        let mut running = self.running.lock();
        let current = running.get(&strategy.id).copied();
        if current != from {
            return Err(BrokerError::Other(format!(
                "strategy {} is {} in the driver",
                strategy.id,
                describe(current)
            )));
        }
        match to {
            Some(state) => running.insert(strategy.id.clone(), state),
            None => running.remove(&strategy.id),
        };
        Ok(())
    }
}

fn describe(state: Option<RunState>) -> &'static str {
    match state {
        Some(RunState::Running) => "running",
        Some(RunState::Paused) => "paused",
        None => "not running",
    }
}

#[async_trait]
impl StrategyDriver for PaperStrategyDriver {
    fn kinds(&self) -> Vec<String> {
        PAPER_STRATEGY_KINDS.iter().map(|k| k.to_string()).collect()
    }

    async fn start(&self, strategy: &StrategyInstance) -> BrokerResult<()> {
        Self::validate(strategy)?;
        self.transition(strategy, None, Some(RunState::Running))?;
        info!(strategy = %strategy.id, kind = %strategy.kind, pair = %strategy.pair, "paper strategy started");
        Ok(())
    }

    async fn stop(&self, strategy: &StrategyInstance) -> BrokerResult<()> {
        // Stopping an instance the driver never ran (e.g. `Created`) is a no-op.
        self.running.lock().remove(&strategy.id);
        info!(strategy = %strategy.id, "paper strategy stopped");
        Ok(())
    }

    async fn pause(&self, strategy: &StrategyInstance) -> BrokerResult<()> {
        self.transition(strategy, Some(RunState::Running), Some(RunState::Paused))
    }

    async fn resume(&self, strategy: &StrategyInstance) -> BrokerResult<()> {
        self.transition(strategy, Some(RunState::Paused), Some(RunState::Running))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use helm_core::{StrategyStats, StrategyStatus};
    use serde_json::{json, Map};

    fn instance(kind: &str, config: Value) -> StrategyInstance {
        let now = Utc::now();
        StrategyInstance {
            id: "s1".into(),
            name: "maker".into(),
            kind: kind.into(),
            exchange: "paper".into(),
            pair: "BTC-USDT".into(),
            status: StrategyStatus::Created,
            config: match config {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            stats: StrategyStats::default(),
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let driver = PaperStrategyDriver::new();
        let strategy = instance("pure_market_making", json!({"bid_spread": 0.01}));
        driver.start(&strategy).await.unwrap();
        assert!(driver.is_running("s1"));
        assert!(driver.start(&strategy).await.is_err());
        driver.pause(&strategy).await.unwrap();
        assert!(!driver.is_running("s1"));
        driver.resume(&strategy).await.unwrap();
        driver.stop(&strategy).await.unwrap();
        assert!(driver.resume(&strategy).await.is_err());
    }

    #[tokio::test]
    async fn rejects_unknown_kind_and_bad_settings() {
        let driver = PaperStrategyDriver::new();
        assert!(driver.start(&instance("grid", json!({}))).await.is_err());
        let err = driver
            .start(&instance("market_maker", json!({"order_amount": -1})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("order_amount"));
        assert!(driver.supports("spot_perpetual_arbitrage"));
    }
}
