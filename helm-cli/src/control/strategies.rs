use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use helm_core::{
    CommandError, CommandResultData, EventPayload, LifecycleAction, Params, StrategyChange,
    StrategyEvent, StrategyInstance, StrategyStats, StrategyStatus,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::params::{data, strategy_id, to_json};
use super::{CommandHandler, CommandName, ControlContext};

/// Strategy lifecycle commands.
///
/// Status changes are recorded only after the strategy driver accepted them, and always
/// by publishing a `strategy` event.
pub struct StrategyCommands {
    ctx: Arc<ControlContext>,
}

impl StrategyCommands {
    pub fn new(ctx: Arc<ControlContext>) -> Self {
        Self { ctx }
    }

    fn lookup(&self, id: &str) -> Result<StrategyInstance, CommandError> {
        self.ctx
            .state
            .strategy(id)
            .ok_or_else(|| CommandError::NotFound(format!("Strategy not found: {id}")))
    }

    fn publish(&self, change: StrategyChange, strategy: StrategyInstance) {
        self.ctx
            .bus
            .publish(EventPayload::Strategy(StrategyEvent { change, strategy }));
    }

    async fn create(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let name = params.require_str(&["name"])?;
        let kind = params.require_str(&["type", "strategy_type"])?;
        let exchange = params.require_str(&["exchange"])?;
        let pair = params.require_str(&["pair", "trading_pair", "symbol"])?;
        let config = params.object_opt(&["config"])?.unwrap_or_default();
        if !self.ctx.strategies.supports(&kind) {
            return Err(CommandError::invalid(
                "type",
                format!(
                    "unsupported strategy type '{kind}' (available: {})",
                    self.ctx.strategies.kinds().join(", ")
                ),
            ));
        }

        let now = Utc::now();
        let strategy = StrategyInstance {
            id: format!("strat_{}", &Uuid::new_v4().simple().to_string()[..8]),
            name,
            kind,
            exchange,
            pair,
            status: StrategyStatus::Created,
            config,
            stats: StrategyStats::default(),
            created_at: now,
            updated_at: now,
            last_error: None,
        };
        info!(strategy = %strategy.id, kind = %strategy.kind, pair = %strategy.pair, "strategy created");
        self.publish(StrategyChange::Created, strategy.clone());
        Ok(data([
            ("id", Value::String(strategy.id.clone())),
            ("strategy", to_json(&strategy)?),
        ]))
    }

    async fn update(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let id = strategy_id(params)?;
        let patch = params.object_opt(&["config"])?;
        let name = params.str_opt(&["name"])?;
        if patch.is_none() && name.is_none() {
            return Err(CommandError::missing("config"));
        }
        let mut strategy = self.lookup(&id)?;
        if let Some(patch) = patch {
            strategy.config.extend(patch);
        }
        if let Some(name) = name {
            strategy.name = name;
        }
        strategy.updated_at = Utc::now();
        self.publish(StrategyChange::Updated, strategy.clone());
        Ok(data([("strategy", to_json(&strategy)?)]))
    }

    async fn delete(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let id = strategy_id(params)?;
        let strategy = self.lookup(&id)?;
        if !strategy.status.is_deletable() {
            return Err(CommandError::InvalidState(format!(
                "Cannot delete strategy {id} while {}; stop it first",
                strategy.status
            )));
        }
        info!(strategy = %id, "strategy deleted");
        self.publish(StrategyChange::Deleted, strategy);
        Ok(data([("id", Value::String(id)), ("deleted", Value::Bool(true))]))
    }

    async fn transition(
        &self,
        params: &Params,
        action: LifecycleAction,
    ) -> Result<CommandResultData, CommandError> {
        let id = strategy_id(params)?;
        let strategy = self.lookup(&id)?;
        let next = strategy.status.transition(action).ok_or_else(|| {
            CommandError::InvalidState(format!(
                "Cannot {} strategy {id} while {}",
                action.as_str(),
                strategy.status
            ))
        })?;

        let driver = &self.ctx.strategies;
        let call = match action {
            LifecycleAction::Start => driver.start(&strategy),
            LifecycleAction::Pause => driver.pause(&strategy),
            LifecycleAction::Resume => driver.resume(&strategy),
            LifecycleAction::Stop => driver.stop(&strategy),
        };
        self.ctx
            .call(&format!("{} strategy {id}", action.as_str()), call)
            .await?;

        let updated = strategy.with_status(next);
        let change = match action {
            LifecycleAction::Start => StrategyChange::Started,
            LifecycleAction::Pause => StrategyChange::Paused,
            LifecycleAction::Resume => StrategyChange::Resumed,
            LifecycleAction::Stop => StrategyChange::Stopped,
        };
        info!(strategy = %id, status = %next, "strategy {}", action.as_str());
        self.publish(change, updated.clone());
        Ok(data([("strategy", to_json(&updated)?)]))
    }

    async fn list(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let status = params.parsed_opt::<StrategyStatus>(&["status"])?;
        let strategies = match status {
            Some(status) => self.ctx.state.strategies_in(&[status]),
            None => self.ctx.state.strategies(),
        };
        Ok(data([
            ("count", json!(strategies.len())),
            ("strategies", to_json(&strategies)?),
        ]))
    }
}

#[async_trait]
impl CommandHandler for StrategyCommands {
    fn commands(&self) -> &'static [CommandName] {
        &[
            CommandName::CreateStrategy,
            CommandName::UpdateStrategy,
            CommandName::DeleteStrategy,
            CommandName::StartStrategy,
            CommandName::StopStrategy,
            CommandName::PauseStrategy,
            CommandName::ResumeStrategy,
            CommandName::GetStrategies,
        ]
    }

    async fn handle(
        &self,
        name: CommandName,
        params: &Params,
    ) -> Result<CommandResultData, CommandError> {
        match name {
            CommandName::CreateStrategy => self.create(params).await,
            CommandName::UpdateStrategy => self.update(params).await,
            CommandName::DeleteStrategy => self.delete(params).await,
            CommandName::StartStrategy => self.transition(params, LifecycleAction::Start).await,
            CommandName::StopStrategy => self.transition(params, LifecycleAction::Stop).await,
            CommandName::PauseStrategy => self.transition(params, LifecycleAction::Pause).await,
            CommandName::ResumeStrategy => self.transition(params, LifecycleAction::Resume).await,
            CommandName::GetStrategies => self.list(params).await,
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}
