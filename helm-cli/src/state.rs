use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::SecondsFormat;
use helm_core::{Side, StateSnapshot};
use helm_state::{JsonStateRepository, StateRepository};
use serde_json::to_string_pretty;

const MAX_ORDER_ROWS: usize = 5;
const MAX_PRICE_ROWS: usize = 8;

pub async fn inspect_state(path: PathBuf, raw: bool) -> Result<()> {
    let repo = JsonStateRepository::new(path.clone());
    let snapshot = tokio::task::spawn_blocking(move || repo.load())
        .await
        .map_err(|err| anyhow!("state inspection task failed: {err}"))?
        .with_context(|| format!("failed to read {}", path.display()))?;
    if raw {
        println!("{}", to_string_pretty(&snapshot)?);
    } else {
        print_summary(&path, &snapshot);
    }
    Ok(())
}

fn print_summary(path: &Path, state: &StateSnapshot) {
    println!("State file: {}", path.display());
    println!("Last sequence: {}", state.last_seq);
    println!(
        "Engine running: {} | trades: {} | realized PnL: {}",
        state.engine_running, state.total_trades, state.realized_pnl
    );

    println!("Strategies ({} total):", state.strategies.len());
    if state.strategies.is_empty() {
        println!("  none");
    }
    for strategy in &state.strategies {
        println!(
            "  {:<14} {:<24} {:<10} {} {} orders={} trades={} pnl={} updated={}",
            strategy.id,
            strategy.name,
            strategy.status,
            strategy.kind,
            strategy.pair,
            strategy.stats.total_orders,
            strategy.stats.total_trades,
            strategy.stats.realized_pnl,
            strategy
                .updated_at
                .to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    }

    println!("Open orders ({} total):", state.orders.len());
    if state.orders.is_empty() {
        println!("  none");
    } else {
        for order in state.orders.iter().take(MAX_ORDER_ROWS) {
            println!(
                "  {} {} {} {} @ {:?} status={} filled={}",
                order.id,
                order.venue,
                order.symbol,
                format_side(Some(order.side)),
                order.price,
                order.status,
                order.filled_quantity
            );
        }
        if state.orders.len() > MAX_ORDER_ROWS {
            println!(
                "  ... {} additional order(s) omitted",
                state.orders.len() - MAX_ORDER_ROWS
            );
        }
    }

    if state.positions.is_empty() {
        println!("Positions: none");
    } else {
        println!("Positions:");
        for position in &state.positions {
            println!(
                "  {:<12} side={} qty={} entry={:?} unrealized={}",
                position.symbol,
                format_side(position.side),
                position.quantity,
                position.entry_price,
                position.unrealized_pnl
            );
        }
    }

    println!("Last price cache ({} symbol(s)):", state.prices.len());
    if state.prices.is_empty() {
        println!("  none");
    } else {
        let mut entries: Vec<_> = state.prices.iter().collect();
        entries.sort_by(|lhs, rhs| lhs.symbol.cmp(&rhs.symbol));
        for update in entries.into_iter().take(MAX_PRICE_ROWS) {
            println!("  {}: {}", update.symbol, update.price);
        }
        if state.prices.len() > MAX_PRICE_ROWS {
            println!(
                "  ... {} additional symbol(s) omitted",
                state.prices.len() - MAX_PRICE_ROWS
            );
        }
    }
}

fn format_side(side: Option<Side>) -> &'static str {
    match side {
        Some(Side::Buy) => "Buy",
        Some(Side::Sell) => "Sell",
        None => "Flat",
    }
}
