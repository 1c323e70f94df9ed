use std::sync::Arc;

use async_trait::async_trait;
use helm_core::{
    CommandError, CommandResultData, ErrorReport, EventKind, EventPayload, Params,
    StrategyChange, StrategyEvent, StrategyStatus,
};
use helm_state::OrderFilter;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::orders::{cancel_orders, ActionFailure};
use super::params::{data, to_data, to_json};
use super::{CommandHandler, CommandName, ControlContext};

const DEFAULT_EVENT_LIMIT: usize = 100;

/// Engine-wide queries and controls, including the kill switch.
pub struct SystemCommands {
    ctx: Arc<ControlContext>,
}

impl SystemCommands {
    pub fn new(ctx: Arc<ControlContext>) -> Self {
        Self { ctx }
    }

    fn status(&self) -> Result<CommandResultData, CommandError> {
        to_data(&self.ctx.system_status())
    }

    fn state(&self) -> Result<CommandResultData, CommandError> {
        to_data(&self.ctx.state.snapshot())
    }

    fn events(&self, params: &Params) -> Result<CommandResultData, CommandError> {
        let kind = params.parsed_opt::<EventKind>(&["kind", "type"])?;
        let limit = params.usize_opt(&["limit"])?.unwrap_or(DEFAULT_EVENT_LIMIT);
        let events = self.ctx.bus.history(kind, limit);
        Ok(data([
            ("count", json!(events.len())),
            ("events", to_json(&events)?),
        ]))
    }

    fn set_engine(&self, running: bool) -> Result<CommandResultData, CommandError> {
        let changed = self.ctx.state.totals().engine_running != running;
        if changed {
            let payload = if running {
                EventPayload::Connected {
                    message: "engine started".into(),
                }
            } else {
                EventPayload::Disconnected {
                    message: "engine stopped".into(),
                }
            };
            self.ctx.bus.publish(payload);
            info!(running, "engine state changed");
        }
        Ok(data([
            ("engine_running", Value::Bool(running)),
            ("changed", Value::Bool(changed)),
        ]))
    }

    /// Stop every active strategy and cancel every open order.
    ///
    /// Each action is attempted independently and failures are reported, never raised.
    async fn kill_switch(&self) -> Result<CommandResultData, CommandError> {
        warn!("kill switch engaged");
        let mut failures: Vec<ActionFailure> = Vec::new();

        let mut stopped = Vec::new();
        let active = self
            .ctx
            .state
            .strategies_in(&[StrategyStatus::Running, StrategyStatus::Paused]);
        for strategy in active {
            let call = self.ctx.strategies.stop(&strategy);
            match self
                .ctx
                .call(&format!("stop strategy {}", strategy.id), call)
                .await
            {
                Ok(()) => {
                    let updated = strategy.with_status(StrategyStatus::Stopped);
                    self.ctx.bus.publish(EventPayload::Strategy(StrategyEvent {
                        change: StrategyChange::Stopped,
                        strategy: updated,
                    }));
                    stopped.push(strategy.id);
                }
                Err(err) => {
                    warn!(strategy = %strategy.id, error = %err, "failed to stop strategy");
                    failures.push(ActionFailure {
                        target: "strategy",
                        id: strategy.id,
                        error: err.to_string(),
                    });
                }
            }
        }

        let open_orders = self.ctx.state.orders(&OrderFilter::default());
        let report = cancel_orders(&self.ctx, open_orders).await;
        failures.extend(report.failures);

        let stopped_count = stopped.len();
        let cancelled_count = report.cancelled.len();
        let message = format!(
            "Kill switch: stopped {stopped_count} strategies, cancelled {cancelled_count} orders, {} failure(s)",
            failures.len()
        );
        self.ctx.bus.publish(EventPayload::Error(ErrorReport {
            error_type: "kill_switch".into(),
            message: message.clone(),
            details: Some(json!({
                "stopped_count": stopped_count,
                "cancelled_count": cancelled_count,
                "failed_count": failures.len(),
            })),
        }));
        warn!(stopped_count, cancelled_count, failed = failures.len(), "kill switch completed");

        Ok(data([
            ("message", Value::String(message)),
            ("actions", json!(stopped_count + cancelled_count)),
            ("stopped_count", json!(stopped_count)),
            ("cancelled_count", json!(cancelled_count)),
            ("failed_count", json!(failures.len())),
            ("stopped", to_json(&stopped)?),
            ("cancelled", to_json(&report.cancelled)?),
            ("failures", to_json(&failures)?),
        ]))
    }
}

#[async_trait]
impl CommandHandler for SystemCommands {
    fn commands(&self) -> &'static [CommandName] {
        &[
            CommandName::GetSystemStatus,
            CommandName::GetState,
            CommandName::GetEvents,
            CommandName::StartEngine,
            CommandName::StopEngine,
            CommandName::KillSwitch,
        ]
    }

    async fn handle(
        &self,
        name: CommandName,
        params: &Params,
    ) -> Result<CommandResultData, CommandError> {
        match name {
            CommandName::GetSystemStatus => self.status(),
            CommandName::GetState => self.state(),
            CommandName::GetEvents => self.events(params),
            CommandName::StartEngine => self.set_engine(true),
            CommandName::StopEngine => self.set_engine(false),
            CommandName::KillSwitch => self.kill_switch().await,
            other => Err(CommandError::UnknownCommand(other.to_string())),
        }
    }
}
