//! Startup state reconciliation.
//!
//! Runs once, on the first strategy-list callback. Persisted trades are the
//! source of truth for funding fields; the hub is authoritative for which
//! positions exist at all. Without persisted state, open positions are
//! rebuilt from live balances and loans.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};

use super::{ledger, Engine};
use crate::history::BalanceHistoryBook;
use crate::hub::HubTrade;
use crate::model::{
    MetaData, PositionType, PublicStrategy, Strategy, TradeOpen, TradingMode, WalletType,
};
use crate::notify::{Notification, NotifyLevel};
use crate::store::{SnapshotKey, STORE_VERSION};

pub(crate) async fn startup_reconcile(engine: &Arc<Engine>) -> Result<()> {
    // Markets are mandatory; nothing can be sized without them.
    let markets = engine
        .gateway
        .load_markets(true)
        .await
        .context("cannot load markets at startup")?;

    let hub_trades = engine
        .hub
        .list_user_trades()
        .await
        .context("cannot load the hub trade list at startup")?;

    let persisted = load_persisted(engine)?;
    let had_persisted_trades = !persisted.trades_open.is_empty();

    let mut discarded: Vec<String> = Vec::new();
    {
        let mut meta = engine.meta.lock().await;
        meta.markets = markets.as_ref().clone();
        meta.markets_loaded_at = Some(Utc::now());

        apply_persisted(&mut meta, &persisted);

        if had_persisted_trades {
            merge_persisted_trades(&mut meta, persisted.trades_open, &hub_trades, &mut discarded);
        }
    }

    // The balance-driven rebuild talks to the venue, so it runs without the
    // lock held and commits its result afterwards.
    if !had_persisted_trades {
        rebuild_from_balances(engine, &hub_trades, &mut discarded).await?;
    }

    {
        let mut meta = engine.meta.lock().await;
        if meta
            .trades_open
            .iter()
            .any(|t| t.trading_mode == TradingMode::Virtual)
            || !meta.virtual_balances.is_empty()
        {
            ledger::reseed(&mut meta, &engine.config, None);
        }
        engine.store.mark_dirty(SnapshotKey::TradesOpen);
        engine.store.mark_dirty(SnapshotKey::VirtualBalances);
        engine.store.mark_dirty(SnapshotKey::Strategies);
        engine.store.mark_dirty(SnapshotKey::Version);

        warn_fee_token_quotes(&meta);

        info!(
            trades = meta.trades_open.len(),
            discarded = discarded.len(),
            "Startup reconciliation finished"
        );
    }

    for reason in discarded {
        engine
            .notifier
            .notify(Notification::new(
                NotifyLevel::Warn,
                "trade discarded at startup",
                reason,
            ))
            .await;
    }

    Ok(())
}

/// Everything the store remembers from the previous run.
struct Persisted {
    strategies: HashMap<String, Strategy>,
    trades_open: Vec<TradeOpen>,
    virtual_balances: HashMap<WalletType, HashMap<String, Decimal>>,
    balance_history: BalanceHistoryBook,
    public_strategies: HashMap<String, PublicStrategy>,
}

fn load_persisted(engine: &Arc<Engine>) -> Result<Persisted> {
    let store = &engine.store;

    let version: u32 = store
        .load_snapshot(SnapshotKey::Version)?
        .unwrap_or(STORE_VERSION);
    if version < STORE_VERSION {
        // Older snapshots lack the fee column on history rows; the decoder
        // defaults it, we only note the upgrade.
        info!(from = version, to = STORE_VERSION, "Migrating persisted state");
    }

    Ok(Persisted {
        strategies: store.load_snapshot(SnapshotKey::Strategies)?.unwrap_or_default(),
        trades_open: store.load_snapshot(SnapshotKey::TradesOpen)?.unwrap_or_default(),
        virtual_balances: store
            .load_snapshot(SnapshotKey::VirtualBalances)?
            .unwrap_or_default(),
        balance_history: store
            .load_snapshot(SnapshotKey::BalanceHistory)?
            .unwrap_or_default(),
        public_strategies: store
            .load_snapshot(SnapshotKey::PublicStrategies)?
            .unwrap_or_default(),
    })
}

/// Fold the persisted snapshots into the fresh meta-data. The hub payload
/// applied just before wins on strategy facts; the persisted engine-owned
/// fields survive the restart.
fn apply_persisted(meta: &mut MetaData, persisted: &Persisted) {
    for (id, stored) in &persisted.strategies {
        if let Some(current) = meta.strategies.get_mut(id) {
            if current.is_active == stored.is_active {
                current.is_stopped = stored.is_stopped;
                current.loss_trade_run = stored.loss_trade_run;
            }
        }
    }
    meta.virtual_balances = persisted.virtual_balances.clone();
    meta.balance_history = persisted.balance_history.clone();
    meta.public_strategies = persisted.public_strategies.clone();
}

/// Persisted-first merge: the hub decides presence, the store decides
/// funding.
fn merge_persisted_trades(
    meta: &mut MetaData,
    persisted: Vec<TradeOpen>,
    hub_trades: &[HubTrade],
    discarded: &mut Vec<String>,
) {
    let mut kept: Vec<TradeOpen> = Vec::new();

    for hub_trade in hub_trades {
        let matched = persisted.iter().find(|t| {
            t.strategy_id == hub_trade.strategy_id
                && t.symbol == hub_trade.symbol
                && t.position_type == hub_trade.position_type
        });
        match matched {
            Some(stored) => {
                let mut trade = stored.clone();
                // The operator may have stopped it from the hub while this
                // trader was offline.
                if hub_trade.is_stopped && !trade.is_stopped {
                    trade.is_stopped = true;
                }
                kept.push(trade);
            }
            None => {
                discarded.push(format!(
                    "hub trade {} {} {} has no persisted funding and was discarded",
                    hub_trade.strategy_id, hub_trade.symbol, hub_trade.position_type
                ));
            }
        }
    }

    for stored in persisted {
        let in_hub = hub_trades.iter().any(|h| {
            h.strategy_id == stored.strategy_id
                && h.symbol == stored.symbol
                && h.position_type == stored.position_type
        });
        let already_kept = kept.iter().any(|t| t.id == stored.id);
        if in_hub || already_kept {
            continue;
        }
        if !stored.is_executed {
            discarded.push(format!(
                "persisted trade {} {} never executed and is gone from the hub",
                stored.id, stored.symbol
            ));
        } else {
            warn!(
                trade = %stored.id,
                symbol = %stored.symbol,
                "Persisted trade is unknown to the hub, keeping it until an exit signal"
            );
            kept.push(stored);
        }
    }

    meta.trades_open = kept;
}

/// No persisted trades: adopt the hub's list by attributing live balances
/// and loans. Shorts first (they are always margin, with a known borrow),
/// then longs greedily against free base coins.
async fn rebuild_from_balances(
    engine: &Arc<Engine>,
    hub_trades: &[HubTrade],
    discarded: &mut Vec<String>,
) -> Result<()> {
    if hub_trades.is_empty() {
        return Ok(());
    }

    // Split hub trades into valid real/virtual candidates under the lock.
    struct Candidate {
        hub: HubTrade,
        mode: TradingMode,
        quantity: Decimal,
    }
    let mut candidates: Vec<Candidate> = Vec::new();
    {
        let meta = engine.meta.lock().await;
        for hub_trade in hub_trades {
            let Some(strategy) = meta.strategies.get(&hub_trade.strategy_id) else {
                discarded.push(format!(
                    "hub trade {} {}: strategy is no longer known",
                    hub_trade.strategy_id, hub_trade.symbol
                ));
                continue;
            };
            let Some(market) = meta.markets.get(&hub_trade.symbol) else {
                discarded.push(format!(
                    "hub trade {} {}: symbol is no longer tradable",
                    hub_trade.strategy_id, hub_trade.symbol
                ));
                continue;
            };
            if !market.active {
                discarded.push(format!(
                    "hub trade {} {}: market is inactive",
                    hub_trade.strategy_id, hub_trade.symbol
                ));
                continue;
            }
            let entry_price = match hub_trade.position_type {
                PositionType::Long => hub_trade.price_buy,
                PositionType::Short => hub_trade.price_sell,
            };
            let (Some(_), Some(quantity)) = (entry_price, hub_trade.quantity) else {
                discarded.push(format!(
                    "hub trade {} {}: entry price or quantity missing",
                    hub_trade.strategy_id, hub_trade.symbol
                ));
                continue;
            };
            candidates.push(Candidate {
                hub: hub_trade.clone(),
                mode: strategy.trading_mode,
                quantity,
            });
        }
    }

    let needs_real = candidates.iter().any(|c| c.mode == TradingMode::Real);
    let mut free_spot: HashMap<String, Decimal> = HashMap::new();
    let mut free_margin: HashMap<String, Decimal> = HashMap::new();
    let mut borrowed: HashMap<String, Decimal> = HashMap::new();
    if needs_real {
        let spot = engine.gateway.fetch_balance(WalletType::Spot).await?;
        for (asset, balance) in &spot.assets {
            free_spot.insert(asset.clone(), balance.free);
        }
        let margin = engine.gateway.fetch_balance(WalletType::Margin).await?;
        for (asset, balance) in &margin.assets {
            free_margin.insert(asset.clone(), balance.free);
            if balance.borrowed > Decimal::ZERO {
                borrowed.insert(asset.clone(), balance.borrowed);
            }
        }
    }

    let mut meta = engine.meta.lock().await;
    let mut adopted: Vec<TradeOpen> = Vec::new();

    // Shorts first: their funding is fully determined.
    for candidate in candidates.iter().filter(|c| {
        c.hub.position_type == PositionType::Short
    }) {
        let market = meta.markets[&candidate.hub.symbol].clone();
        let price = candidate.hub.price_sell.unwrap_or(Decimal::ZERO);
        let mut trade = adopt(&candidate.hub, candidate.mode, candidate.quantity);
        trade.wallet = Some(WalletType::Margin);
        trade.cost = candidate.quantity * price;
        trade.borrow = candidate.quantity;

        if candidate.mode == TradingMode::Real {
            let entry = borrowed.entry(market.base.clone()).or_insert(Decimal::ZERO);
            *entry -= candidate.quantity;
            if *entry < Decimal::ZERO {
                // The venue owes less than this short sold; repay only what
                // is actually on loan.
                trade.borrow = candidate.quantity + *entry;
                *entry = Decimal::ZERO;
            }
            let quote_free = free_margin.entry(market.quote.clone()).or_insert(Decimal::ZERO);
            *quote_free -= trade.cost;
        }
        adopted.push(trade);
    }

    // Longs: find the wallet actually holding the coins.
    let long_candidates: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.hub.position_type == PositionType::Long)
        .collect();
    for candidate in &long_candidates {
        let market = meta.markets[&candidate.hub.symbol].clone();
        let price = candidate.hub.price_buy.unwrap_or(Decimal::ZERO);

        let wallet = if candidate.mode == TradingMode::Virtual {
            engine.config.trading.primary_wallet
        } else {
            let ordered: [WalletType; 2] = match engine.config.trading.primary_wallet {
                WalletType::Margin => [WalletType::Margin, WalletType::Spot],
                WalletType::Spot => [WalletType::Spot, WalletType::Margin],
            };
            let pick = ordered
                .into_iter()
                .filter(|w| market.supports(*w))
                .filter(|w| {
                    *w != WalletType::Margin || engine.config.trading.is_trade_margin_enabled
                })
                .max_by_key(|w| {
                    let pool = match w {
                        WalletType::Spot => &free_spot,
                        WalletType::Margin => &free_margin,
                    };
                    pool.get(&market.base).copied().unwrap_or(Decimal::ZERO)
                });
            match pick {
                Some(wallet) => wallet,
                None => {
                    discarded.push(format!(
                        "hub trade {} {}: no wallet can hold it",
                        candidate.hub.strategy_id, candidate.hub.symbol
                    ));
                    continue;
                }
            }
        };

        let mut trade = adopt(&candidate.hub, candidate.mode, candidate.quantity);
        trade.wallet = Some(wallet);
        trade.cost = candidate.quantity * price;
        if candidate.mode == TradingMode::Real {
            let pool = match wallet {
                WalletType::Spot => &mut free_spot,
                WalletType::Margin => &mut free_margin,
            };
            let entry = pool.entry(market.base.clone()).or_insert(Decimal::ZERO);
            *entry -= candidate.quantity;
        }
        adopted.push(trade);
    }

    // Overdrawn coin+wallet groups are leveled to an equal share; whatever
    // still does not fit is dropped.
    level_overdrawn_longs(&mut meta, &mut adopted, &mut free_spot, &mut free_margin, discarded);

    for (asset, amount) in borrowed {
        if amount > Decimal::ZERO {
            warn!(%asset, %amount, "Margin loan not attributable to any trade");
            engine
                .notifier
                .notify(Notification::new(
                    NotifyLevel::Warn,
                    "unmanaged loan",
                    format!("{amount} {asset} is borrowed but belongs to no known trade"),
                ))
                .await;
        }
    }

    meta.trades_open = adopted;
    Ok(())
}

fn adopt(hub: &HubTrade, mode: TradingMode, quantity: Decimal) -> TradeOpen {
    TradeOpen {
        id: crate::model::trade_id(&hub.strategy_id, &hub.symbol, hub.position_type, hub.timestamp),
        strategy_id: hub.strategy_id.clone(),
        strategy_name: hub.strategy_name.clone(),
        symbol: hub.symbol.clone(),
        position_type: hub.position_type,
        trading_mode: mode,
        wallet: None,
        quantity,
        cost: Decimal::ZERO,
        borrow: Decimal::ZERO,
        price_buy: hub.price_buy,
        price_sell: hub.price_sell,
        time_buy: (hub.position_type == PositionType::Long).then(|| hub.timestamp),
        time_sell: (hub.position_type == PositionType::Short).then(|| hub.timestamp),
        time_updated: Utc::now(),
        is_stopped: hub.is_stopped,
        is_hodl: false,
        is_executed: true,
    }
}

/// Rebalance same-coin same-wallet longs down to an equal share when their
/// combined quantity overruns the free balance.
fn level_overdrawn_longs(
    meta: &mut MetaData,
    adopted: &mut Vec<TradeOpen>,
    free_spot: &mut HashMap<String, Decimal>,
    free_margin: &mut HashMap<String, Decimal>,
    discarded: &mut Vec<String>,
) {
    let mut groups: HashMap<(String, WalletType), Vec<String>> = HashMap::new();
    for trade in adopted.iter() {
        if trade.position_type != PositionType::Long || trade.trading_mode != TradingMode::Real {
            continue;
        }
        let Some(market) = meta.markets.get(&trade.symbol) else { continue };
        let Some(wallet) = trade.wallet else { continue };
        groups
            .entry((market.base.clone(), wallet))
            .or_default()
            .push(trade.id.clone());
    }

    let mut dropped: Vec<String> = Vec::new();
    for ((base, wallet), ids) in groups {
        let pool = match wallet {
            WalletType::Spot => &mut *free_spot,
            WalletType::Margin => &mut *free_margin,
        };
        let overdraft = pool.get(&base).copied().unwrap_or(Decimal::ZERO);
        if overdraft >= Decimal::ZERO {
            continue;
        }
        let bound: Decimal = adopted
            .iter()
            .filter(|t| ids.contains(&t.id))
            .map(|t| t.quantity)
            .sum();
        let free = bound + overdraft;
        let share = free / Decimal::from(ids.len() as u64);

        for id in &ids {
            let Some(trade) = adopted.iter_mut().find(|t| t.id == *id) else { continue };
            let market = &meta.markets[&trade.symbol];
            let legal_share = market.amount_to_precision(share);
            if legal_share < market.min_amount {
                discarded.push(format!(
                    "trade {} {}: balance cannot cover it after leveling",
                    trade.id, trade.symbol
                ));
                dropped.push(trade.id.clone());
                continue;
            }
            if legal_share < trade.quantity {
                let price = trade.price_buy.unwrap_or(Decimal::ZERO);
                trade.quantity = legal_share;
                trade.cost = legal_share * price;
            }
        }
    }

    adopted.retain(|t| !dropped.contains(&t.id));
}

/// Strategies settling in the fee token have untested fee accounting; say so
/// once at startup.
fn warn_fee_token_quotes(meta: &MetaData) {
    let affected = meta
        .trades_open
        .iter()
        .filter_map(|t| meta.markets.get(&t.symbol))
        .any(|m| m.quote == "BNB");
    if affected {
        warn!("Open trades are quoted in the fee token; fee accounting for them is best-effort");
    }
}
