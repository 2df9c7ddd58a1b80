//! Entry pipeline: wallet candidates, sizing, funding and trade creation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::execute::Job;
use super::{ledger, Engine};
use crate::error::RejectionKind;
use crate::funding::{plan_long_funding, FundingOutcome};
use crate::model::{
    LongFundsPolicy, PositionType, Signal, SourceType, TradeOpen, TradingMode, WalletType,
};
use crate::store::SnapshotKey;
use crate::wallet::{calculate_pnl, legal_order, plan_rebalance, WalletSnapshot};

/// Build, fund and enqueue a new trade for a validated enter signal.
pub(crate) async fn create_trade_open(
    engine: &Arc<Engine>,
    signal: Signal,
    position: PositionType,
) {
    match try_create(engine, &signal, position).await {
        Ok(()) => {}
        Err(rejection) => engine.reject_signal(&signal, rejection).await,
    }
}

async fn try_create(
    engine: &Arc<Engine>,
    signal: &Signal,
    position: PositionType,
) -> Result<(), RejectionKind> {
    let config = &engine.config;

    // Strategy and market facts, read under the lock.
    let (trade_amount, trading_mode, market) = {
        let meta = engine.meta.lock().await;
        let strategy = meta
            .strategies
            .get(&signal.strategy_id)
            .ok_or_else(|| RejectionKind::UnknownStrategy(signal.strategy_id.clone()))?;
        let market = meta
            .markets
            .get(&signal.symbol)
            .ok_or_else(|| RejectionKind::SymbolNotTradable(signal.symbol.clone()))?
            .clone();
        (strategy.trade_amount, strategy.trading_mode, market)
    };

    let price = signal.price.ok_or_else(|| RejectionKind::CostInvalid {
        symbol: signal.symbol.clone(),
        cost: "no signal price".to_string(),
    })?;
    if price <= Decimal::ZERO {
        return Err(RejectionKind::CostInvalid {
            symbol: signal.symbol.clone(),
            cost: price.to_string(),
        });
    }

    // Candidate wallets, preferred first.
    let candidates = candidate_wallets(engine, position, &market)?;

    // Reported free balance per candidate, venue or ledger.
    let mut reported: HashMap<WalletType, Decimal> = HashMap::new();
    for wallet in &candidates {
        let free = match trading_mode {
            TradingMode::Real => engine
                .gateway
                .fetch_balance(*wallet)
                .await
                .map_err(|e| {
                    warn!(error = %e, wallet = %wallet, "Balance fetch failed");
                    RejectionKind::InsufficientFunds {
                        symbol: signal.symbol.clone(),
                        needed: "balance".to_string(),
                        available: "unknown".to_string(),
                    }
                })?
                .free(&market.quote),
            TradingMode::Virtual => {
                let mut meta = engine.meta.lock().await;
                ledger::seeded_balance(&mut meta, config, *wallet, &market.quote)
            }
        };
        reported.insert(*wallet, free);
    }

    // Fresh prices for the no-loss filter, before taking the lock.
    let no_loss_prices = if config.trading.is_funds_no_loss
        && matches!(
            config.trading.long_funds,
            LongFundsPolicy::SellAll | LongFundsPolicy::SellLargest | LongFundsPolicy::SellLargestPnl
        ) {
        engine.gateway.load_prices(false).await.ok()
    } else {
        None
    };

    // Sizing and funding under the lock.
    let (mut trade, funding, ack) = {
        let meta = engine.meta.lock().await;

        // First wins: a duplicate delivered while we were fetching balances
        // is dropped here.
        if meta
            .find_trade(&signal.strategy_id, &signal.symbol, position)
            .is_some()
        {
            return Err(RejectionKind::DuplicateTrade {
                strategy_id: signal.strategy_id.clone(),
                symbol: signal.symbol.clone(),
                position,
            });
        }

        let mut snapshots: Vec<WalletSnapshot> = candidates
            .iter()
            .map(|wallet| {
                WalletSnapshot::build(
                    *wallet,
                    &market.quote,
                    reported.get(wallet).copied().unwrap_or(Decimal::ZERO),
                    &meta,
                    config.trading.wallet_buffer,
                )
            })
            .collect();

        // The strategy's amount, or its fraction of the primary wallet.
        let desired_cost = if config.trading.is_buy_qty_fraction {
            trade_amount * snapshots[0].total
        } else {
            trade_amount
        };
        let (initial_qty, initial_cost) = legal_order(
            &market,
            desired_cost / price,
            price,
            config.fees.min_cost_buffer,
        );

        let min_legal_cost = market.min_cost_with_buffer(config.fees.min_cost_buffer);
        let fee = config.fees.taker_fee_percent;

        let funding = match position {
            PositionType::Short => FundingOutcome {
                wallet: WalletType::Margin,
                cost: initial_cost,
                borrow: initial_qty,
                rebalances: Vec::new(),
                potential: initial_cost,
            },
            PositionType::Long => {
                // Trim the rebalance candidates to what the policy may sell.
                for snapshot in &mut snapshots {
                    snapshot.trades.retain(|t| {
                        let Some(own_market) = meta.markets.get(&t.symbol) else {
                            return false;
                        };
                        !t.is_stopped
                            && (!t.is_hodl || config.trading.is_funds_no_loss)
                            && t.quantity >= own_market.min_amount * Decimal::from(2)
                            && t.cost >= own_market.min_cost * Decimal::from(2)
                    });
                    if let Some(prices) = &no_loss_prices {
                        snapshot.trades.retain(|t| {
                            match (t.price_buy, prices.get(&t.symbol)) {
                                (Some(buy), Some(current)) => {
                                    calculate_pnl(buy, *current, fee) >= Decimal::ZERO
                                }
                                _ => false,
                            }
                        });
                    }
                }

                let pnl: HashMap<String, Decimal> = no_loss_prices
                    .as_deref()
                    .map(|prices| {
                        snapshots
                            .iter()
                            .flat_map(|s| &s.trades)
                            .filter_map(|t| {
                                let buy = t.price_buy?;
                                let current = prices.get(&t.symbol)?;
                                Some((t.id.clone(), calculate_pnl(buy, *current, fee)))
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                plan_long_funding(
                    config.trading.long_funds,
                    &snapshots,
                    initial_cost,
                    min_legal_cost,
                    &pnl,
                    &signal.symbol,
                )?
            }
        };

        // Final sizing from the affordable cost.
        let (quantity, cost) = legal_order(
            &market,
            funding.cost / price,
            price,
            config.fees.min_cost_buffer,
        );
        if cost <= Decimal::ZERO || cost < min_legal_cost {
            return Err(RejectionKind::CostInvalid {
                symbol: signal.symbol.clone(),
                cost: cost.to_string(),
            });
        }

        let mut trade = TradeOpen::new(signal, position, trading_mode, Utc::now());
        trade.wallet = Some(funding.wallet);
        trade.quantity = quantity;
        trade.cost = cost;
        trade.borrow = match position {
            PositionType::Short => quantity,
            PositionType::Long => match config.trading.long_funds {
                LongFundsPolicy::BorrowAll => cost,
                LongFundsPolicy::BorrowMin => {
                    let free = snapshots
                        .iter()
                        .find(|s| s.wallet == funding.wallet)
                        .map(|s| s.free)
                        .unwrap_or(Decimal::ZERO);
                    (cost - free).max(Decimal::ZERO)
                }
                _ => Decimal::ZERO,
            },
        };

        let ack = crate::hub::ack_channel(position == PositionType::Long).to_string();
        (trade, funding, ack)
    };

    // Rebalance the funding trades before the new entry consumes the quote.
    schedule_rebalances(engine, &funding, signal).await;

    // Push before enqueueing so overlapping signals see the reservation.
    {
        let mut meta = engine.meta.lock().await;
        let open_count = meta.open_trades_for(&signal.strategy_id) as u32 + 1;
        trade.time_updated = Utc::now();
        info!(
            trade = %trade.id,
            symbol = %trade.symbol,
            position = %trade.position_type,
            quantity = %trade.quantity,
            cost = %trade.cost,
            borrow = %trade.borrow,
            wallet = %funding.wallet,
            "Opening trade"
        );
        meta.trades_open.push(trade.clone());
        let balance = reported
            .get(&funding.wallet)
            .copied()
            .unwrap_or(Decimal::ZERO);
        meta.balance_history
            .record_open(trading_mode, &market.quote, balance, open_count);
        engine.store.mark_dirty(SnapshotKey::TradesOpen);
        engine.store.mark_dirty(SnapshotKey::BalanceHistory);
    }

    let job = Job::Open {
        trade_id: trade.id.clone(),
        source: SourceType::Signal,
        signal_time: signal.timestamp,
        ack_channel: ack,
    };
    let engine_for_task = Arc::clone(engine);
    engine.queue.push(format!("open {}", trade.id), async move {
        super::execute::run(engine_for_task, job).await;
    });

    Ok(())
}

/// Preferred-first wallet candidates for one entry.
fn candidate_wallets(
    engine: &Arc<Engine>,
    position: PositionType,
    market: &crate::exchange::Market,
) -> Result<Vec<WalletType>, RejectionKind> {
    let config = &engine.config.trading;
    match position {
        PositionType::Short => Ok(vec![WalletType::Margin]),
        PositionType::Long => {
            let ordered = match config.primary_wallet {
                WalletType::Margin => [WalletType::Margin, WalletType::Spot],
                WalletType::Spot => [WalletType::Spot, WalletType::Margin],
            };
            let candidates: Vec<WalletType> = ordered
                .into_iter()
                .filter(|w| market.supports(*w))
                .filter(|w| *w != WalletType::Margin || config.is_trade_margin_enabled)
                .collect();
            if candidates.is_empty() {
                return Err(RejectionKind::WalletUnsupported {
                    symbol: market.symbol.clone(),
                    wallet: config.primary_wallet,
                });
            }
            Ok(candidates)
        }
    }
}

/// Turn the funding plan's targets into child sells (or in-place cuts).
///
/// Each target is an open long of its own symbol (same quote); prices come
/// from that symbol's book, not the new entry's.
async fn schedule_rebalances(engine: &Arc<Engine>, funding: &FundingOutcome, signal: &Signal) {
    for target in &funding.rebalances {
        let parent_market = {
            let meta = engine.meta.lock().await;
            meta.trade_by_id(&target.trade_id)
                .and_then(|parent| meta.markets.get(&parent.symbol).cloned())
        };
        let Some(parent_market) = parent_market else {
            continue;
        };

        // The sale prices with a freshly read ticker; the cached book price
        // may be a minute old.
        let sell_price = match engine.gateway.fetch_ticker(&parent_market.symbol).await {
            Ok(ticker) => ticker.bid,
            Err(e) => {
                debug!(error = %e, "Ticker refresh failed, using the signal price");
                signal.price.unwrap_or(Decimal::ZERO)
            }
        };
        if sell_price <= Decimal::ZERO {
            warn!(trade = %target.trade_id, "No usable sell price, rebalance skipped");
            continue;
        }

        let mut meta = engine.meta.lock().await;
        let Some(parent) = meta.trade_by_id(&target.trade_id).cloned() else {
            continue;
        };
        let plan = match plan_rebalance(
            &parent,
            target.target_cost,
            sell_price,
            &parent_market,
            engine.config.fees.min_cost_buffer,
        ) {
            Ok(plan) => plan,
            Err(reason) => {
                debug!(trade = %target.trade_id, %reason, "Rebalance fenced off");
                continue;
            }
        };

        if !parent.is_executed {
            // Nothing on the venue yet: shrink the pending order in place.
            if let Some(pending) = meta.trade_by_id_mut(&target.trade_id) {
                pending.quantity = plan.remaining_quantity;
                pending.cost = plan.remaining_cost;
                pending.time_updated = Utc::now();
            }
            engine.store.mark_dirty(SnapshotKey::TradesOpen);
            continue;
        }

        // Optimistic cut; the child task restores it on failure.
        let mut child = parent.clone();
        child.id = crate::model::trade_id(
            &parent.strategy_id,
            &parent.symbol,
            parent.position_type,
            Utc::now(),
        );
        child.quantity = plan.sell_quantity;
        child.cost = plan.sell_cost;
        child.price_sell = Some(sell_price);

        if let Some(open) = meta.trade_by_id_mut(&target.trade_id) {
            open.quantity = plan.remaining_quantity;
            open.cost = plan.remaining_cost;
            open.time_updated = Utc::now();
        }
        engine.store.mark_dirty(SnapshotKey::TradesOpen);
        drop(meta);

        info!(
            parent = %parent.id,
            child = %child.id,
            quantity = %plan.sell_quantity,
            cost = %plan.sell_cost,
            "Scheduling rebalance sale"
        );

        let job = Job::RebalanceChild {
            child,
            parent_id: parent.id.clone(),
            planned_quantity: plan.sell_quantity,
            planned_cost: plan.sell_cost,
        };
        let engine_for_task = Arc::clone(engine);
        engine
            .queue
            .push(format!("rebalance {}", parent.id), async move {
                super::execute::run(engine_for_task, job).await;
            });
    }
}
