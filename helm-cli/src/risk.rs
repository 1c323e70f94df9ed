//! Pre-trade limits checked before an order reaches a venue.

use chrono::Utc;
use helm_config::RiskConfig;
use helm_core::{CommandError, OrderRequest, Position, Quantity, RiskReport, Side};
use helm_state::StateAggregator;
use rust_decimal::Decimal;
use tracing::warn;

#[derive(Clone, Debug, Default)]
pub struct RiskGuard {
    limits: RiskConfig,
}

impl RiskGuard {
    pub fn new(limits: RiskConfig) -> Self {
        Self { limits }
    }

    /// Reject `request` when it breaks a configured limit.
    pub fn check(&self, request: &OrderRequest, state: &StateAggregator) -> Result<(), CommandError> {
        if let Some(limit) = self.limits.max_order_size {
            if request.quantity > limit {
                warn!(symbol = %request.symbol, size = %request.quantity, %limit, "order size limit hit");
                return Err(CommandError::invalid(
                    "size",
                    format!("Order size {} exceeds limit {limit}", request.quantity),
                ));
            }
        }

        if let Some(limit) = self.limits.max_daily_loss {
            let pnl = daily_pnl(state);
            if breached(pnl, limit) {
                warn!(daily_pnl = %pnl, %limit, "daily loss limit hit");
                return Err(CommandError::InvalidState(format!(
                    "Daily loss {} exceeds limit {limit}",
                    -pnl
                )));
            }
        }

        if let Some(limit) = self.limits.max_position_size {
            let current = state
                .positions()
                .iter()
                .find(|position| position.symbol == request.symbol)
                .map(signed_quantity)
                .unwrap_or_default();
            let projected = match request.side {
                Side::Buy => current.checked_add(request.quantity),
                Side::Sell => current.checked_sub(request.quantity),
            }
            .map(|size| size.abs());
            if projected.map_or(true, |size| size > limit) {
                warn!(symbol = %request.symbol, current = %current, %limit, "position limit hit");
                return Err(CommandError::InvalidState(format!(
                    "Position size {} exceeds limit {limit}",
                    projected.map_or_else(|| "out of range".to_string(), |size| size.to_string())
                )));
            }
        }
        Ok(())
    }

    pub fn report(&self, state: &StateAggregator) -> RiskReport {
        let daily_pnl = daily_pnl(state);
        RiskReport {
            max_order_size: self.limits.max_order_size,
            max_position_size: self.limits.max_position_size,
            max_daily_loss: self.limits.max_daily_loss,
            daily_pnl,
            daily_loss_breached: self
                .limits
                .max_daily_loss
                .is_some_and(|limit| breached(daily_pnl, limit)),
        }
    }
}

fn daily_pnl(state: &StateAggregator) -> Decimal {
    state.realized_pnl_on(Utc::now().date_naive())
}

fn breached(pnl: Decimal, limit: Decimal) -> bool {
    pnl < Decimal::ZERO && -pnl > limit
}

fn signed_quantity(position: &Position) -> Quantity {
    match position.side {
        Some(Side::Buy) => position.quantity,
        Some(Side::Sell) => -position.quantity,
        None => Decimal::ZERO,
    }
}
