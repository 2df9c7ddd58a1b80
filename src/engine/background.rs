//! Background maintenance tick.
//!
//! One loop drives the slow housekeeping: daily market refresh (with a
//! validity sweep of open trades), the profitable auto-close of held or
//! stranded positions, and the throttled hub cross-check.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::{exit, Engine};
use crate::model::{EntryType, PositionType, Signal, SourceType};
use crate::store::SnapshotKey;
use crate::wallet::calculate_pnl;

pub(crate) async fn run(engine: Arc<Engine>) {
    let period = Duration::from_millis(engine.config.timing.background_interval_ms.max(1_000));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tick.tick().await;
        if !engine.meta.lock().await.is_operational {
            continue;
        }

        refresh_markets(&engine).await;
        if engine.config.trading.is_auto_close_enabled {
            auto_close_sweep(&engine).await;
        }
        engine.cross_check_strategies().await;

        {
            let mut meta = engine.meta.lock().await;
            meta.balance_history.prune(Utc::now().date_naive());
            engine.store.mark_dirty(SnapshotKey::BalanceHistory);
        }
    }
}

/// Reload markets older than a day and sweep open trades against them.
async fn refresh_markets(engine: &Arc<Engine>) {
    let stale = engine
        .gateway
        .markets_age()
        .await
        .map(|age| age >= chrono::Duration::hours(24))
        .unwrap_or(true);
    if !stale {
        return;
    }

    let markets = match engine.gateway.load_markets(true).await {
        Ok(markets) => markets,
        Err(e) => {
            warn!(error = %e, "Scheduled market refresh failed");
            return;
        }
    };

    let mut meta = engine.meta.lock().await;
    meta.markets = markets.as_ref().clone();
    meta.markets_loaded_at = Some(Utc::now());
    info!(count = meta.markets.len(), "Markets refreshed");

    // Positions whose market went away cannot be traded out normally any
    // more; freeze them for the operator.
    let frozen: Vec<String> = meta
        .trades_open
        .iter()
        .filter(|trade| !trade.is_stopped)
        .filter(|trade| {
            !meta
                .markets
                .get(&trade.symbol)
                .map(|m| m.active && trade.wallet.map(|w| m.supports(w)).unwrap_or(true))
                .unwrap_or(false)
        })
        .map(|trade| trade.id.clone())
        .collect();
    if !frozen.is_empty() {
        for id in &frozen {
            if let Some(trade) = meta.trade_by_id_mut(id) {
                trade.is_stopped = true;
                trade.time_updated = Utc::now();
            }
        }
        warn!(trades = ?frozen, "Open trades frozen: their market is gone or inactive");
        engine.store.mark_dirty(SnapshotKey::TradesOpen);
    }
}

/// Close held or stranded positions once the market pays for it.
async fn auto_close_sweep(engine: &Arc<Engine>) {
    let prices = match engine.gateway.load_prices(true).await {
        Ok(prices) => prices,
        Err(e) => {
            debug!(error = %e, "Price refresh for the auto-close sweep failed");
            return;
        }
    };
    let fee = engine.config.fees.taker_fee_percent;

    let exits: Vec<Signal> = {
        let meta = engine.meta.lock().await;
        meta.trades_open
            .iter()
            .filter(|t| t.is_executed && !t.is_stopped)
            .filter(|t| !meta.trades_closing.contains(&t.id))
            .filter(|t| {
                t.is_hodl
                    || meta
                        .strategies
                        .get(&t.strategy_id)
                        .map(|s| s.is_stopped)
                        .unwrap_or(false)
            })
            .filter_map(|t| {
                let current = *prices.get(&t.symbol)?;
                let profitable = match t.position_type {
                    PositionType::Long => {
                        calculate_pnl(t.price_buy?, current, fee) >= Decimal::ZERO
                    }
                    PositionType::Short => {
                        calculate_pnl(current, t.price_sell?, fee) >= Decimal::ZERO
                    }
                };
                profitable.then(|| Signal {
                    strategy_id: t.strategy_id.clone(),
                    strategy_name: t.strategy_name.clone(),
                    symbol: t.symbol.clone(),
                    entry_type: EntryType::Exit,
                    position_type: Some(t.position_type),
                    price: Some(current),
                    score: None,
                    timestamp: Utc::now(),
                })
            })
            .collect()
    };

    for signal in exits {
        info!(
            symbol = %signal.symbol,
            strategy = %signal.strategy_id,
            "Auto-closing a held trade in profit"
        );
        let position = signal.position_type.expect("set above");
        exit::close_trade_open(engine, &signal, position, SourceType::Auto).await;
    }
}
