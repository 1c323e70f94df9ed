//! Strategy instance model and its lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Price, StrategyId, Symbol};

/// Lifecycle status of a strategy instance.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Created,
    Running,
    Paused,
    Stopped,
    Error,
}

impl StrategyStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Whether the instance currently holds live trading activity.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Deletion is only allowed once an instance can no longer trade.
    #[must_use]
    pub fn is_deletable(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }

    /// Resolve the status reached by applying `action`, or `None` when illegal.
    #[must_use]
    pub fn transition(self, action: LifecycleAction) -> Option<Self> {
        use LifecycleAction::*;
        use StrategyStatus::*;
        match (action, self) {
            (Start, Created | Stopped | Error) => Some(Running),
            (Pause, Running) => Some(Paused),
            (Resume, Paused) => Some(Running),
            (Stop, Created | Running | Paused) => Some(Stopped),
            _ => None,
        }
    }
}

impl fmt::Display for StrategyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown strategy status '{other}'")),
        }
    }
}

/// Operator-initiated lifecycle actions.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LifecycleAction {
    Start,
    Pause,
    Resume,
    Stop,
}

impl LifecycleAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
        }
    }
}

/// Running counters attached to a strategy.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct StrategyStats {
    pub total_orders: u64,
    pub total_trades: u64,
    pub realized_pnl: Price,
    pub unrealized_pnl: Price,
}

impl StrategyStats {
    #[must_use]
    pub fn total_pnl(&self) -> Price {
        self.realized_pnl + self.unrealized_pnl
    }
}

/// A configured strategy managed by the control plane.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StrategyInstance {
    pub id: StrategyId,
    pub name: String,
    /// Algorithm family understood by the strategy driver (e.g. `pure_market_making`).
    pub kind: String,
    pub exchange: String,
    pub pair: Symbol,
    pub status: StrategyStatus,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub stats: StrategyStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StrategyInstance {
    /// Copy of this instance moved to `status`.
    #[must_use]
    pub fn with_status(&self, status: StrategyStatus) -> Self {
        let mut next = self.clone();
        next.status = status;
        next.updated_at = Utc::now();
        if status != StrategyStatus::Error {
            next.last_error = None;
        }
        next
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == StrategyStatus::Running
    }

    #[must_use]
    pub fn realized_pnl(&self) -> Decimal {
        self.stats.realized_pnl
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_transitions_follow_the_table() {
        use LifecycleAction::*;
        use StrategyStatus::*;
        assert_eq!(Created.transition(Start), Some(Running));
        assert_eq!(Stopped.transition(Start), Some(Running));
        assert_eq!(Error.transition(Start), Some(Running));
        assert_eq!(Running.transition(Start), None);
        assert_eq!(Running.transition(Pause), Some(Paused));
        assert_eq!(Paused.transition(Pause), None);
        assert_eq!(Paused.transition(Resume), Some(Running));
        assert_eq!(Running.transition(Resume), None);
        assert_eq!(Paused.transition(Stop), Some(Stopped));
        assert_eq!(Created.transition(Stop), Some(Stopped));
        assert_eq!(Stopped.transition(Stop), None);
    }

    #[test]
    fn only_terminal_statuses_are_deletable() {
        assert!(StrategyStatus::Stopped.is_deletable());
        assert!(StrategyStatus::Error.is_deletable());
        assert!(!StrategyStatus::Created.is_deletable());
        assert!(!StrategyStatus::Running.is_deletable());
        assert!(!StrategyStatus::Paused.is_deletable());
    }
}
