use std::collections::HashMap;

use async_trait::async_trait;
use helm_broker::{BrokerError, BrokerResult, StrategyDriver};
use helm_core::{LifecycleAction, StrategyId, StrategyInstance};
use parking_lot::Mutex;

/// Strategy driver that accepts every lifecycle call unless told otherwise.
pub struct MockStrategyDriver {
    kinds: Vec<String>,
    failures: Mutex<HashMap<(StrategyId, &'static str), String>>,
    calls: Mutex<Vec<(LifecycleAction, StrategyId)>>,
}

impl Default for MockStrategyDriver {
    fn default() -> Self {
        Self::new(["pure_market_making", "grid"])
    }
}

impl MockStrategyDriver {
    pub fn new<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kinds: kinds.into_iter().map(Into::into).collect(),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_start(&self, id: &str, error: impl Into<String>) {
        self.fail(LifecycleAction::Start, id, error);
    }

    pub fn fail_stop(&self, id: &str, error: impl Into<String>) {
        self.fail(LifecycleAction::Stop, id, error);
    }

    /// Reject `action` on strategy `id` until cleared.
    pub fn fail(&self, action: LifecycleAction, id: &str, error: impl Into<String>) {
        self.failures
            .lock()
            .insert((id.to_string(), action.as_str()), error.into());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn calls(&self) -> Vec<(LifecycleAction, StrategyId)> {
        self.calls.lock().clone()
    }

    fn record(&self, action: LifecycleAction, strategy: &StrategyInstance) -> BrokerResult<()> {
        self.calls.lock().push((action, strategy.id.clone()));
        match self
            .failures
            .lock()
            .get(&(strategy.id.clone(), action.as_str()))
        {
            Some(error) => Err(BrokerError::Other(error.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StrategyDriver for MockStrategyDriver {
    fn kinds(&self) -> Vec<String> {
        self.kinds.clone()
    }

    async fn start(&self, strategy: &StrategyInstance) -> BrokerResult<()> {
        self.record(LifecycleAction::Start, strategy)
    }

    async fn stop(&self, strategy: &StrategyInstance) -> BrokerResult<()> {
        self.record(LifecycleAction::Stop, strategy)
    }

    async fn pause(&self, strategy: &StrategyInstance) -> BrokerResult<()> {
        self.record(LifecycleAction::Pause, strategy)
    }

    async fn resume(&self, strategy: &StrategyInstance) -> BrokerResult<()> {
        self.record(LifecycleAction::Resume, strategy)
    }
}
