//! Trade execution tasks.
//!
//! Each queued task is a straight-line borrow → order → repay procedure with
//! explicit compensation: a failed main step undoes the borrow and the
//! optimistic bookkeeping, a failed repay freezes the trade for the
//! operator.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use super::{ledger, Engine};
use crate::exchange::{Market, OrderResult, OrderSide};
use crate::model::{
    PositionType, SourceType, TradeOpen, TradingMode, Transaction, TransactionAction, WalletType,
};
use crate::notify::{Notification, NotifyLevel, TradeDetail};
use crate::store::SnapshotKey;
use crate::wallet::calculate_pnl;

/// A unit of work for the trade queue.
#[derive(Debug)]
pub enum Job {
    /// Execute a freshly created entry.
    Open {
        trade_id: String,
        source: SourceType,
        signal_time: DateTime<Utc>,
        ack_channel: String,
    },
    /// Execute a scheduled exit.
    Close {
        trade_id: String,
        source: SourceType,
        signal_time: DateTime<Utc>,
        ack_channel: String,
    },
    /// Sell a slice of a parent long to free quote balance. Never reported
    /// to the hub.
    RebalanceChild {
        child: TradeOpen,
        parent_id: String,
        planned_quantity: Decimal,
        planned_cost: Decimal,
    },
}

/// Run one job to completion. Never panics the worker; every failure path
/// ends in logging, notification and consistent meta-data.
pub(crate) async fn run(engine: Arc<Engine>, job: Job) {
    match job {
        Job::Open {
            trade_id,
            source,
            signal_time,
            ack_channel,
        } => run_open(&engine, &trade_id, source, signal_time, &ack_channel).await,
        Job::Close {
            trade_id,
            source,
            signal_time,
            ack_channel,
        } => run_close(&engine, &trade_id, source, signal_time, &ack_channel).await,
        Job::RebalanceChild {
            child,
            parent_id,
            planned_quantity,
            planned_cost,
        } => run_rebalance_child(&engine, child, &parent_id, planned_quantity, planned_cost).await,
    }
}

// ==================== Entry ====================

async fn run_open(
    engine: &Arc<Engine>,
    trade_id: &str,
    source: SourceType,
    signal_time: DateTime<Utc>,
    ack_channel: &str,
) {
    let Some((trade, market)) = snapshot_trade(engine, trade_id).await else {
        warn!(trade = %trade_id, "Entry task found no trade");
        return;
    };

    let side = match trade.position_type {
        PositionType::Long => OrderSide::Buy,
        PositionType::Short => OrderSide::Sell,
    };
    let borrow_asset = match trade.position_type {
        PositionType::Long => market.quote.clone(),
        PositionType::Short => market.base.clone(),
    };
    let wallet = trade.wallet.unwrap_or(WalletType::Margin);

    // Before: borrow.
    if trade.borrow > Decimal::ZERO {
        if let Err(e) = borrow(engine, &trade, &borrow_asset, trade.borrow).await {
            error!(trade = %trade.id, error = %e, "Borrow failed, entry abandoned");
            remove_trade(engine, &trade.id).await;
            notify_failure(engine, &trade, "entry borrow failed", &e).await;
            return;
        }
    }

    // Main: the market order.
    let order = match place_order(engine, &trade, &market, side, trade.quantity).await {
        Ok(order) if order.is_closed() => order,
        Ok(order) => {
            let e = anyhow!("order finished {:?} instead of filling", order.status);
            compensate_entry(engine, &trade, &borrow_asset).await;
            notify_failure(engine, &trade, "entry order not filled", &e).await;
            return;
        }
        Err(e) => {
            // Nothing was done on the venue: unwind the borrow and forget
            // the trade, the hub was never told about it.
            compensate_entry(engine, &trade, &borrow_asset).await;
            notify_failure(engine, &trade, "entry order failed", &e).await;
            return;
        }
    };

    // Reconcile slippage and flip the trade to executed.
    let trade = {
        let mut meta = engine.meta.lock().await;
        let Some(open) = meta.trade_by_id_mut(&trade.id) else {
            warn!(trade = %trade.id, "Trade vanished mid-entry");
            return;
        };
        match open.position_type {
            PositionType::Long => open.price_buy = Some(order.price),
            PositionType::Short => open.price_sell = Some(order.price),
        }
        if order.cost > Decimal::ZERO {
            open.cost = order.cost;
        }
        open.is_executed = true;
        open.time_updated = Utc::now();
        let trade = open.clone();

        meta.push_transaction(transaction(&trade, main_action(side), Some(order.price), order.cost, source));
        let _ = engine
            .store
            .append_transaction(meta.transactions.back().expect("just pushed"));
        engine.store.mark_dirty(SnapshotKey::TradesOpen);
        trade
    };

    if source != SourceType::Rebalance {
        engine.send_ack(ack_channel, &trade);
    }

    let elapsed = (Utc::now() - signal_time).num_milliseconds();
    engine
        .notifier
        .notify(
            Notification::new(
                NotifyLevel::Success,
                format!("{} {} opened", trade.symbol, trade.position_type),
                format!(
                    "bought {} for {} on the {} wallet",
                    trade.quantity, trade.cost, wallet
                ),
            )
            .with_detail(TradeDetail {
                action: Some(format!("{side:?}")),
                symbol: Some(trade.symbol.clone()),
                price: Some(order.price),
                cost: Some(trade.cost),
                wallet: Some(wallet),
                elapsed_ms: Some(elapsed),
            }),
        )
        .await;

    if trade.trading_mode == TradingMode::Real {
        engine.check_fee_reserve().await;
    }
}

/// Undo an entry whose main order did nothing: repay any borrow and drop the
/// never-acknowledged trade.
async fn compensate_entry(engine: &Arc<Engine>, trade: &TradeOpen, borrow_asset: &str) {
    if trade.borrow > Decimal::ZERO {
        match trade.trading_mode {
            TradingMode::Real => {
                if let Err(e) = engine.gateway.margin_repay(borrow_asset, trade.borrow).await {
                    // Borrow is live but the trade is gone from the venue's
                    // point of view: freeze it for the operator instead of
                    // dropping it.
                    error!(trade = %trade.id, error = %e, "Compensating repay failed");
                    force_stop(engine, &trade.id, "borrow could not be repaid after a failed entry")
                        .await;
                    return;
                }
                record_loan(engine, trade, TransactionAction::Repay, borrow_asset, trade.borrow)
                    .await;
            }
            TradingMode::Virtual => {
                let mut meta = engine.meta.lock().await;
                ledger::apply_loan(&mut meta, borrow_asset, -trade.borrow);
            }
        }
    }
    remove_trade(engine, &trade.id).await;
}

// ==================== Exit ====================

async fn run_close(
    engine: &Arc<Engine>,
    trade_id: &str,
    source: SourceType,
    signal_time: DateTime<Utc>,
    ack_channel: &str,
) {
    let Some((trade, market)) = snapshot_trade(engine, trade_id).await else {
        warn!(trade = %trade_id, "Close task found no trade");
        return;
    };

    let side = match trade.position_type {
        PositionType::Long => OrderSide::Sell,
        PositionType::Short => OrderSide::Buy,
    };
    let wallet = trade.wallet.unwrap_or(WalletType::Margin);

    // Main: the closing order.
    let order = match place_order(engine, &trade, &market, side, trade.quantity).await {
        Ok(order) if order.is_closed() => order,
        Ok(order) => {
            let e = anyhow!("order finished {:?} instead of filling", order.status);
            abandon_close(engine, &trade, &e).await;
            return;
        }
        Err(e) => {
            abandon_close(engine, &trade, &e).await;
            return;
        }
    };

    // Record the fill before attempting the repay.
    let trade = {
        let mut meta = engine.meta.lock().await;
        let Some(open) = meta.trade_by_id_mut(&trade.id) else {
            return;
        };
        match open.position_type {
            PositionType::Long => open.price_sell = Some(order.price),
            PositionType::Short => open.price_buy = Some(order.price),
        }
        open.time_updated = Utc::now();
        let trade = open.clone();
        meta.push_transaction(transaction(&trade, main_action(side), Some(order.price), order.cost, source));
        let _ = engine
            .store
            .append_transaction(meta.transactions.back().expect("just pushed"));
        engine.store.mark_dirty(SnapshotKey::TradesOpen);
        trade
    };

    // After: repay the borrow.
    if trade.borrow > Decimal::ZERO {
        let borrow_asset = match trade.position_type {
            PositionType::Long => market.quote.clone(),
            PositionType::Short => market.base.clone(),
        };
        let repaid = repay(engine, &trade, &borrow_asset).await;
        if let Err(e) = repaid {
            // The venue holds the proceeds but the loan is still open. The
            // trade is frozen in the open list until the operator cleans up.
            error!(trade = %trade.id, error = %e, "Repay failed after the closing order");
            force_stop(engine, &trade.id, "repay failed after the closing order").await;
            engine
                .notifier
                .notify(Notification::new(
                    NotifyLevel::Error,
                    format!("{} trade has been stopped", trade.symbol),
                    format!(
                        "trade {}: the closing order filled but repaying {} {} failed: {}",
                        trade.id, trade.borrow, borrow_asset, e
                    ),
                ))
                .await;
            return;
        }
    }

    // The position is gone; drop it and account for the result.
    let removed = {
        let mut meta = engine.meta.lock().await;
        let removed = meta.remove_trade(&trade.id);
        engine.store.mark_dirty(SnapshotKey::TradesOpen);
        removed
    };
    let Some(closed) = removed else { return };

    finish_close(engine, &closed, &market, &order, wallet, source).await;

    if source != SourceType::Rebalance {
        engine.send_ack(ack_channel, &closed);
    }

    let elapsed = (Utc::now() - signal_time).num_milliseconds();
    engine
        .notifier
        .notify(
            Notification::new(
                NotifyLevel::Success,
                format!("{} {} closed", closed.symbol, closed.position_type),
                format!(
                    "sold {} for {} on the {} wallet",
                    closed.quantity, order.cost, wallet
                ),
            )
            .with_detail(TradeDetail {
                action: Some(format!("{side:?}")),
                symbol: Some(closed.symbol.clone()),
                price: Some(order.price),
                cost: Some(order.cost),
                wallet: Some(wallet),
                elapsed_ms: Some(elapsed),
            }),
        )
        .await;

    if closed.trading_mode == TradingMode::Real {
        engine.check_fee_reserve().await;
    }
}

/// A close whose order did nothing: release the closing reservation and
/// leave the trade open for the next signal.
async fn abandon_close(engine: &Arc<Engine>, trade: &TradeOpen, error: &anyhow::Error) {
    {
        let mut meta = engine.meta.lock().await;
        meta.trades_closing.remove(&trade.id);
    }
    notify_failure(engine, trade, "closing order failed", error).await;
}

/// Post-close accounting: realized change, loss streaks, balance history.
async fn finish_close(
    engine: &Arc<Engine>,
    closed: &TradeOpen,
    market: &Market,
    order: &OrderResult,
    wallet: WalletType,
    source: SourceType,
) {
    let fee_percent = engine.config.fees.taker_fee_percent;
    let change = match (closed.price_buy, closed.price_sell) {
        (Some(buy), Some(sell)) => Some(closed.quantity * (sell - buy)),
        _ => None,
    };
    let fee = -(order.cost * fee_percent / Decimal::from(100));

    // Loss streaks count fee-adjusted round trips.
    let lost = match (closed.price_buy, closed.price_sell) {
        (Some(buy), Some(sell)) => calculate_pnl(buy, sell, fee_percent) < Decimal::ZERO,
        _ => false,
    };

    let quote_balance = match closed.trading_mode {
        TradingMode::Real => engine
            .gateway
            .fetch_balance(wallet)
            .await
            .map(|b| b.free(&market.quote))
            .unwrap_or(Decimal::ZERO),
        TradingMode::Virtual => {
            let meta = engine.meta.lock().await;
            meta.virtual_balance(wallet, &market.quote)
        }
    };

    let mut stopped_strategy = None;
    {
        let mut meta = engine.meta.lock().await;
        let open_count = meta.open_trades_for(&closed.strategy_id) as u32;
        meta.balance_history.record_close(
            closed.trading_mode,
            &market.quote,
            quote_balance,
            open_count,
            change.unwrap_or(Decimal::ZERO),
            fee,
        );
        engine.store.mark_dirty(SnapshotKey::BalanceHistory);

        let limit = engine.config.trading.strategy_loss_limit;
        if let Some(strategy) = meta.strategies.get_mut(&closed.strategy_id) {
            if source != SourceType::Rebalance && change.is_some() {
                if lost {
                    strategy.loss_trade_run += 1;
                    if limit > 0 && strategy.loss_trade_run >= limit && !strategy.is_stopped {
                        strategy.is_stopped = true;
                        stopped_strategy = Some(strategy.id.clone());
                    }
                } else {
                    strategy.loss_trade_run = 0;
                }
                engine.store.mark_dirty(SnapshotKey::Strategies);
            }
        }
    }

    if let Some(change) = change {
        info!(
            trade = %closed.id,
            symbol = %closed.symbol,
            %change,
            %fee,
            "Trade closed"
        );
    }

    // One notification per edge, not per trade.
    if let Some(strategy_id) = stopped_strategy {
        engine
            .notifier
            .notify(Notification::new(
                NotifyLevel::Warn,
                format!("strategy {strategy_id} stopped"),
                format!(
                    "{} consecutive losing trades reached the loss limit",
                    engine.config.trading.strategy_loss_limit
                ),
            ))
            .await;
    }
}

// ==================== Rebalance child ====================

async fn run_rebalance_child(
    engine: &Arc<Engine>,
    child: TradeOpen,
    parent_id: &str,
    planned_quantity: Decimal,
    planned_cost: Decimal,
) {
    let market = {
        let meta = engine.meta.lock().await;
        meta.markets.get(&child.symbol).cloned()
    };
    let Some(market) = market else {
        warn!(symbol = %child.symbol, "Rebalance child without a market");
        restore_parent(engine, parent_id, planned_quantity, planned_cost).await;
        return;
    };
    let wallet = child.wallet.unwrap_or(WalletType::Spot);

    let order = match place_order(engine, &child, &market, OrderSide::Sell, child.quantity).await {
        Ok(order) if order.is_closed() => order,
        Ok(order) => {
            warn!(parent = %parent_id, status = ?order.status, "Rebalance sale did not fill, restoring parent");
            restore_parent(engine, parent_id, planned_quantity, planned_cost).await;
            return;
        }
        Err(e) => {
            warn!(parent = %parent_id, error = %e, "Rebalance sale failed, restoring parent");
            restore_parent(engine, parent_id, planned_quantity, planned_cost).await;
            return;
        }
    };

    // Propagate the real sale back onto the parent: the freed quote is the
    // actual proceeds, not the planned slice.
    {
        let mut meta = engine.meta.lock().await;
        if let Some(parent) = meta.trade_by_id_mut(parent_id) {
            parent.price_sell = Some(order.price);
            parent.cost += planned_cost - order.cost;
            parent.time_updated = Utc::now();
        }
        let mut tx_trade = child.clone();
        tx_trade.quantity = order.quantity;
        meta.push_transaction(transaction(
            &tx_trade,
            TransactionAction::Sell,
            Some(order.price),
            order.cost,
            SourceType::Rebalance,
        ));
        let _ = engine
            .store
            .append_transaction(meta.transactions.back().expect("just pushed"));
        engine.store.mark_dirty(SnapshotKey::TradesOpen);
    }

    let quote_balance = match child.trading_mode {
        TradingMode::Real => engine
            .gateway
            .fetch_balance(wallet)
            .await
            .map(|b| b.free(&market.quote))
            .unwrap_or(Decimal::ZERO),
        TradingMode::Virtual => {
            let meta = engine.meta.lock().await;
            meta.virtual_balance(wallet, &market.quote)
        }
    };

    // The slice pays its fee into the book but is not a closed position.
    let fee = -(order.cost * engine.config.fees.taker_fee_percent / Decimal::from(100));
    {
        let mut meta = engine.meta.lock().await;
        meta.balance_history
            .record_fee(child.trading_mode, &market.quote, quote_balance, fee);
        engine.store.mark_dirty(SnapshotKey::BalanceHistory);
    }

    info!(
        parent = %parent_id,
        quantity = %order.quantity,
        proceeds = %order.cost,
        "Rebalance sale filled"
    );
}

async fn restore_parent(
    engine: &Arc<Engine>,
    parent_id: &str,
    quantity: Decimal,
    cost: Decimal,
) {
    let mut meta = engine.meta.lock().await;
    if let Some(parent) = meta.trade_by_id_mut(parent_id) {
        parent.quantity += quantity;
        parent.cost += cost;
        parent.time_updated = Utc::now();
        engine.store.mark_dirty(SnapshotKey::TradesOpen);
    }
}

// ==================== Fee-token top-up ====================

/// Buy fee tokens with the given quote asset until the free balance reaches
/// the configured float.
pub(crate) async fn top_up_fee_token(
    engine: &Arc<Engine>,
    quote: &str,
    wallet: WalletType,
) -> Result<()> {
    let symbol = format!("BNB{quote}");
    let markets = engine.gateway.load_markets(false).await?;
    let market = markets
        .get(&symbol)
        .ok_or_else(|| anyhow!("no market {symbol} to top up the fee token"))?;

    let balances = engine.gateway.fetch_balance(wallet).await?;
    let free = balances.free("BNB");
    let target = engine.config.fees.bnb_free_float;
    if free >= target {
        info!(%free, %target, "Fee-token balance already at its float");
        return Ok(());
    }

    let ticker = engine.gateway.fetch_ticker(&symbol).await?;
    let missing = target - free;
    let (quantity, _) = crate::wallet::legal_order(
        market,
        missing,
        ticker.ask,
        engine.config.fees.min_cost_buffer,
    );

    let order = engine
        .gateway
        .create_market_order(&symbol, OrderSide::Buy, quantity, wallet)
        .await?;
    anyhow::ensure!(order.is_closed(), "fee-token order did not fill");

    engine
        .notifier
        .notify(Notification::new(
            NotifyLevel::Success,
            "fee token topped up",
            format!("bought {} BNB for {} {}", order.quantity, order.cost, quote),
        ))
        .await;
    Ok(())
}

// ==================== Shared plumbing ====================

/// Clone the trade and its market for a task run.
async fn snapshot_trade(engine: &Arc<Engine>, trade_id: &str) -> Option<(TradeOpen, Market)> {
    let meta = engine.meta.lock().await;
    let trade = meta.trade_by_id(trade_id)?.clone();
    let market = meta.markets.get(&trade.symbol)?.clone();
    Some((trade, market))
}

/// Route an order to the venue or the virtual ledger.
async fn place_order(
    engine: &Arc<Engine>,
    trade: &TradeOpen,
    market: &Market,
    side: OrderSide,
    quantity: Decimal,
) -> Result<OrderResult> {
    let wallet = trade.wallet.unwrap_or(WalletType::Margin);
    match trade.trading_mode {
        TradingMode::Real => {
            engine
                .gateway
                .create_market_order(&trade.symbol, side, quantity, wallet)
                .await
        }
        TradingMode::Virtual => {
            let book = engine
                .gateway
                .fetch_ticker(&trade.symbol)
                .await
                .ok()
                .map(|t| (t.bid, t.ask));
            let fallback = match side {
                OrderSide::Buy => trade.price_buy,
                OrderSide::Sell => trade.price_sell,
            }
            .unwrap_or(Decimal::ZERO);
            let order = ledger::synthetic_order(side, quantity, book, fallback);
            anyhow::ensure!(order.price > Decimal::ZERO, "no price for a virtual fill");
            let mut meta = engine.meta.lock().await;
            ledger::apply_fill(&mut meta, wallet, market, side, &order);
            engine.store.mark_dirty(SnapshotKey::VirtualBalances);
            Ok(order)
        }
    }
}

/// Execute the borrow step and log its transaction.
async fn borrow(
    engine: &Arc<Engine>,
    trade: &TradeOpen,
    asset: &str,
    amount: Decimal,
) -> Result<()> {
    match trade.trading_mode {
        TradingMode::Real => {
            let tran_id = engine.gateway.margin_borrow(asset, amount).await?;
            info!(trade = %trade.id, %asset, %amount, tran_id, "Borrowed");
        }
        TradingMode::Virtual => {
            let mut meta = engine.meta.lock().await;
            ledger::apply_loan(&mut meta, asset, amount);
            engine.store.mark_dirty(SnapshotKey::VirtualBalances);
        }
    }
    record_loan(engine, trade, TransactionAction::Borrow, asset, amount).await;
    Ok(())
}

/// Execute the repay step (principal plus accrued interest when configured)
/// and log its transaction.
async fn repay(engine: &Arc<Engine>, trade: &TradeOpen, asset: &str) -> Result<()> {
    let mut amount = trade.borrow;
    match trade.trading_mode {
        TradingMode::Real => {
            if engine.config.trading.is_pay_interest_enabled {
                if let Ok(balances) = engine.gateway.fetch_balance(WalletType::Margin).await {
                    amount += balances.asset(asset).interest;
                }
            }
            let tran_id = engine.gateway.margin_repay(asset, amount).await?;
            info!(trade = %trade.id, %asset, %amount, tran_id, "Repaid");
        }
        TradingMode::Virtual => {
            let mut meta = engine.meta.lock().await;
            ledger::apply_loan(&mut meta, asset, -amount);
            engine.store.mark_dirty(SnapshotKey::VirtualBalances);
        }
    }
    // The log records the principal, matching the borrow row.
    record_loan(engine, trade, TransactionAction::Repay, asset, trade.borrow).await;
    Ok(())
}

async fn record_loan(
    engine: &Arc<Engine>,
    trade: &TradeOpen,
    action: TransactionAction,
    asset: &str,
    amount: Decimal,
) {
    let mut meta = engine.meta.lock().await;
    let tx = Transaction {
        time: Utc::now(),
        trade_id: trade.id.clone(),
        action,
        symbol: asset.to_string(),
        quantity: amount,
        price: None,
        cost: Decimal::ZERO,
        wallet: WalletType::Margin,
        trading_mode: trade.trading_mode,
        source: SourceType::Signal,
    };
    let _ = engine.store.append_transaction(&tx);
    meta.push_transaction(tx);
}

fn main_action(side: OrderSide) -> TransactionAction {
    match side {
        OrderSide::Buy => TransactionAction::Buy,
        OrderSide::Sell => TransactionAction::Sell,
    }
}

fn transaction(
    trade: &TradeOpen,
    action: TransactionAction,
    price: Option<Decimal>,
    cost: Decimal,
    source: SourceType,
) -> Transaction {
    Transaction {
        time: Utc::now(),
        trade_id: trade.id.clone(),
        action,
        symbol: trade.symbol.clone(),
        quantity: trade.quantity,
        price,
        cost,
        wallet: trade.wallet.unwrap_or(WalletType::Margin),
        trading_mode: trade.trading_mode,
        source,
    }
}

async fn remove_trade(engine: &Arc<Engine>, trade_id: &str) {
    let mut meta = engine.meta.lock().await;
    meta.remove_trade(trade_id);
    engine.store.mark_dirty(SnapshotKey::TradesOpen);
}

async fn force_stop(engine: &Arc<Engine>, trade_id: &str, reason: &str) {
    let mut meta = engine.meta.lock().await;
    if let Some(trade) = meta.trade_by_id_mut(trade_id) {
        trade.is_stopped = true;
        trade.time_updated = Utc::now();
        warn!(trade = %trade_id, reason, "Trade force-stopped");
    }
    meta.trades_closing.remove(trade_id);
    engine.store.mark_dirty(SnapshotKey::TradesOpen);
}

async fn notify_failure(
    engine: &Arc<Engine>,
    trade: &TradeOpen,
    what: &str,
    error: &anyhow::Error,
) {
    engine
        .notifier
        .notify(Notification::new(
            NotifyLevel::Error,
            format!("{} {what}", trade.symbol),
            format!("trade {}: {error}", trade.id),
        ))
        .await;
}
