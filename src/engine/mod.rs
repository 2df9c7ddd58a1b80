//! Signal-driven trade lifecycle engine.
//!
//! All meta-data mutations flow through here: hub callbacks, the queue
//! worker, operator actions and the background tick serialize on the single
//! meta-data lock. Venue I/O happens outside the critical sections.

mod background;
mod entry;
mod execute;
mod exit;
mod ledger;
mod reconcile;

pub use execute::Job;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::RejectionKind;
use crate::exchange::Gateway;
use crate::hub::{HubAck, HubApi, SignalPayload, StrategyPayload, TradedPayload};
use crate::model::{
    EntryType, MetaData, PositionType, PublicStrategy, Signal, SourceType, Strategy, TradingMode,
    WalletType,
};
use crate::notify::{Notification, Notifier, NotifyLevel};
use crate::queue::TradeQueue;
use crate::store::{SnapshotKey, StateStore};
use crate::wallet::calculate_pnl;

/// Minimum interval between hub cross-checks of one strategy's open trades.
const STRATEGY_CHECK_INTERVAL: Duration = Duration::from_secs(120);

/// Fee-token reserve states. Transitions are edge-triggered: each boundary
/// crossing notifies once, and only a full recovery above the threshold
/// resets the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeeReserve {
    /// At or above the configured threshold.
    Ok,
    /// Below the threshold.
    Low,
    /// Below half the threshold.
    Critical,
    /// Nothing left; orders will start failing.
    Empty,
}

/// The trade lifecycle engine.
pub struct Engine {
    pub config: Arc<Config>,
    pub gateway: Arc<Gateway>,
    pub store: Arc<StateStore>,
    pub notifier: Arc<Notifier>,
    pub hub: Arc<dyn HubApi>,
    pub queue: TradeQueue,
    pub meta: Arc<Mutex<MetaData>>,
    fee_reserve: std::sync::Mutex<FeeReserve>,
    strategy_checks: std::sync::Mutex<HashMap<String, Instant>>,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        gateway: Arc<Gateway>,
        store: Arc<StateStore>,
        notifier: Arc<Notifier>,
        hub: Arc<dyn HubApi>,
        queue: TradeQueue,
    ) -> Arc<Self> {
        let meta = Arc::new(Mutex::new(MetaData::new(
            config.store.max_database_rows as usize,
        )));
        Arc::new(Self {
            config,
            gateway,
            store,
            notifier,
            hub,
            queue,
            meta,
            fee_reserve: std::sync::Mutex::new(FeeReserve::Ok),
            strategy_checks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Spawn the background maintenance tick.
    pub fn spawn_background(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(background::run(engine))
    }

    // ==================== Hub callbacks ====================

    /// Strategy-list refresh. The first successful call also reconciles the
    /// persisted state and flips the engine operational.
    pub async fn on_strategy_list(self: &Arc<Self>, payload: Vec<StrategyPayload>) -> Result<()> {
        let first_run = {
            let meta = self.meta.lock().await;
            !meta.is_operational
        };

        self.apply_strategy_list(&payload).await;

        if first_run {
            reconcile::startup_reconcile(self).await?;
            let mut meta = self.meta.lock().await;
            meta.is_operational = true;
            info!(strategies = payload.len(), "Trader is operational");
        } else {
            self.cross_check_strategies().await;
        }

        Ok(())
    }

    /// Merge a strategy-list payload, preserving engine-owned fields.
    async fn apply_strategy_list(&self, payload: &[StrategyPayload]) {
        let mut meta = self.meta.lock().await;

        let mut next: HashMap<String, Strategy> = HashMap::new();
        for row in payload {
            let incoming = Strategy {
                id: row.strategy_id.clone(),
                name: row.strategy_name.clone(),
                trade_amount: row.trade_amount,
                trading_mode: row.trading_mode,
                is_active: row.is_active,
                is_stopped: false,
                loss_trade_run: 0,
            };

            let merged = match meta.strategies.get(&row.strategy_id) {
                Some(existing) => {
                    if existing.trading_mode != incoming.trading_mode {
                        info!(
                            strategy = %row.strategy_id,
                            from = %existing.trading_mode,
                            to = %incoming.trading_mode,
                            "Strategy switched trading mode"
                        );
                    }
                    // The stopped flag and loss counter are ours; an active
                    // toggle resets both.
                    if existing.is_active == incoming.is_active {
                        Strategy {
                            is_stopped: existing.is_stopped,
                            loss_trade_run: existing.loss_trade_run,
                            ..incoming
                        }
                    } else {
                        incoming
                    }
                }
                None => incoming,
            };
            next.insert(merged.id.clone(), merged);
        }

        let gone: Vec<String> = meta
            .strategies
            .keys()
            .filter(|id| !next.contains_key(*id))
            .cloned()
            .collect();
        for id in &gone {
            warn!(strategy = %id, "Strategy disappeared from the hub, its open trades are paused");
            for trade in meta
                .trades_open
                .iter_mut()
                .filter(|t| &t.strategy_id == id)
            {
                trade.is_stopped = true;
                trade.time_updated = Utc::now();
            }
        }
        if !gone.is_empty() {
            self.store.mark_dirty(SnapshotKey::TradesOpen);
        }

        meta.strategies = next;
        self.store.mark_dirty(SnapshotKey::Strategies);
    }

    /// Buy-side signal: long enter or short exit.
    pub async fn on_buy_signal(self: &Arc<Self>, payload: SignalPayload) {
        self.on_trade_signal(payload, true).await;
    }

    /// Sell-side signal: short enter or long exit.
    pub async fn on_sell_signal(self: &Arc<Self>, payload: SignalPayload) {
        self.on_trade_signal(payload, false).await;
    }

    async fn on_trade_signal(self: &Arc<Self>, payload: SignalPayload, is_buy: bool) {
        let Some(entry_type) = payload.entry_type else {
            warn!(symbol = %payload.symbol, "Signal without entry type dropped");
            return;
        };
        // Buy opens longs and closes shorts; sell is the mirror.
        let position = match (is_buy, entry_type) {
            (true, EntryType::Enter) => PositionType::Long,
            (true, EntryType::Exit) => PositionType::Short,
            (false, EntryType::Enter) => PositionType::Short,
            (false, EntryType::Exit) => PositionType::Long,
        };
        let signal = Signal {
            strategy_id: payload.strategy_id,
            strategy_name: payload.strategy_name,
            symbol: payload.symbol,
            entry_type,
            position_type: Some(position),
            price: payload.price,
            score: payload.score,
            timestamp: payload.timestamp,
        };
        self.dispatch_signal(signal).await;
    }

    /// Close request: forced exit, position resolved from the open trade.
    pub async fn on_close_signal(self: &Arc<Self>, payload: SignalPayload) {
        let position = payload.position_type;
        let signal = Signal {
            strategy_id: payload.strategy_id,
            strategy_name: payload.strategy_name,
            symbol: payload.symbol,
            entry_type: EntryType::Exit,
            position_type: position,
            price: payload.price,
            score: payload.score,
            timestamp: payload.timestamp,
        };
        self.dispatch_signal(signal).await;
    }

    /// Stop request: pause the matching trade, no venue activity.
    pub async fn on_stop_signal(self: &Arc<Self>, payload: SignalPayload) {
        let mut meta = self.meta.lock().await;
        let position = match self.resolve_position(&meta, &payload) {
            Some(position) => position,
            None => {
                debug!(symbol = %payload.symbol, "Stop signal without a matching trade");
                return;
            }
        };
        if let Some(trade) = meta.find_trade_mut(&payload.strategy_id, &payload.symbol, position) {
            trade.is_stopped = true;
            trade.time_updated = Utc::now();
            info!(trade = %trade.id, symbol = %trade.symbol, "Trade stopped by hub signal");
            self.store.mark_dirty(SnapshotKey::TradesOpen);
        }
    }

    /// Resolve the position type of an exit-ish payload from the open list.
    fn resolve_position(&self, meta: &MetaData, payload: &SignalPayload) -> Option<PositionType> {
        payload.position_type.or_else(|| {
            [PositionType::Long, PositionType::Short]
                .into_iter()
                .find(|p| {
                    meta.find_trade(&payload.strategy_id, &payload.symbol, *p)
                        .is_some()
                })
        })
    }

    /// Validate and route one normalized signal.
    async fn dispatch_signal(self: &Arc<Self>, mut signal: Signal) {
        let verdict = {
            let meta = self.meta.lock().await;
            if signal.position_type.is_none() {
                signal.position_type = [PositionType::Long, PositionType::Short]
                    .into_iter()
                    .find(|p| {
                        meta.find_trade(&signal.strategy_id, &signal.symbol, *p)
                            .is_some()
                    });
            }
            match (signal.entry_type, signal.position_type) {
                (EntryType::Enter, Some(position)) => {
                    self.validate_enter(&meta, &signal, position).map(|_| position)
                }
                (EntryType::Exit, Some(position)) => self
                    .validate_exit(&meta, &signal, position, SourceType::Signal)
                    .map(|_| position),
                (_, None) => Err(RejectionKind::NoMatchingTrade),
            }
        };

        match verdict {
            Ok(position) => match signal.entry_type {
                EntryType::Enter => entry::create_trade_open(self, signal, position).await,
                EntryType::Exit => {
                    exit::close_trade_open(self, &signal, position, SourceType::Signal).await
                }
            },
            Err(rejection) => self.reject_signal(&signal, rejection).await,
        }
    }

    /// Log, count and (for error-class reasons) notify a dropped signal.
    async fn reject_signal(&self, signal: &Signal, rejection: RejectionKind) {
        match rejection.level() {
            NotifyLevel::Error => {
                warn!(symbol = %signal.symbol, strategy = %signal.strategy_id, %rejection, "Signal rejected");
                self.notifier
                    .notify(Notification::new(
                        NotifyLevel::Error,
                        format!("{} signal rejected", signal.symbol),
                        rejection.to_string(),
                    ))
                    .await;
            }
            _ => {
                debug!(symbol = %signal.symbol, strategy = %signal.strategy_id, %rejection, "Signal dropped");
            }
        }

        // Signals for strategies we do not follow still feed the public
        // counters shown on the diagnostics surface.
        if matches!(rejection, RejectionKind::UnknownStrategy(_)) {
            let mut meta = self.meta.lock().await;
            let entry = meta
                .public_strategies
                .entry(signal.strategy_id.clone())
                .or_insert_with(|| PublicStrategy {
                    id: signal.strategy_id.clone(),
                    name: signal.strategy_name.clone(),
                    ..Default::default()
                });
            match (signal.entry_type, signal.position_type) {
                (EntryType::Enter, Some(PositionType::Short)) => entry.short_opened += 1,
                (EntryType::Enter, _) => entry.long_opened += 1,
                (EntryType::Exit, _) => entry.closed += 1,
            }
            self.store.mark_dirty(SnapshotKey::PublicStrategies);
        }
    }

    // ==================== Validation ====================

    fn validate_enter(
        &self,
        meta: &MetaData,
        signal: &Signal,
        position: PositionType,
    ) -> Result<(), RejectionKind> {
        if !meta.is_operational {
            return Err(RejectionKind::NotOperational);
        }

        let strategy = meta
            .strategies
            .get(&signal.strategy_id)
            .ok_or_else(|| RejectionKind::UnknownStrategy(signal.strategy_id.clone()))?;
        if !strategy.is_active {
            return Err(RejectionKind::InactiveStrategy(signal.strategy_id.clone()));
        }
        if meta
            .find_trade(&signal.strategy_id, &signal.symbol, position)
            .is_some()
        {
            // A hub redelivery during reconnect lands here: first wins.
            return Err(RejectionKind::DuplicateTrade {
                strategy_id: signal.strategy_id.clone(),
                symbol: signal.symbol.clone(),
                position,
            });
        }
        if strategy.is_stopped {
            return Err(RejectionKind::StoppedStrategy(signal.strategy_id.clone()));
        }

        let limit = self.config.trading.strategy_loss_limit;
        if limit > 0 {
            let throttle_at = Decimal::from(limit) * self.config.trading.strategy_limit_threshold;
            let at_threshold = throttle_at > Decimal::ZERO
                && Decimal::from(strategy.loss_trade_run) >= throttle_at;
            let open = meta.open_trades_for(&signal.strategy_id) as u32;
            if at_threshold && open >= limit.saturating_sub(strategy.loss_trade_run) {
                return Err(RejectionKind::LossLimitThrottled {
                    strategy_id: signal.strategy_id.clone(),
                    loss_run: strategy.loss_trade_run,
                });
            }
        }

        if position == PositionType::Short && !self.config.trading.is_trade_short_enabled {
            return Err(RejectionKind::PositionTypeDisabled(position));
        }

        let market = meta
            .markets
            .get(&signal.symbol)
            .ok_or_else(|| RejectionKind::SymbolNotTradable(signal.symbol.clone()))?;
        if !market.active {
            return Err(RejectionKind::SymbolNotTradable(signal.symbol.clone()));
        }
        let excluded = self.config.excluded_coins();
        for coin in [&market.base, &market.quote] {
            if excluded.contains(coin) {
                return Err(RejectionKind::CoinExcluded(coin.clone()));
            }
        }

        match position {
            PositionType::Short => {
                if !self.config.trading.is_trade_margin_enabled {
                    return Err(RejectionKind::MarginDisabled);
                }
                if !market.margin {
                    return Err(RejectionKind::WalletUnsupported {
                        symbol: signal.symbol.clone(),
                        wallet: WalletType::Margin,
                    });
                }
                let max = self.config.trading.max_short_trades;
                if max > 0 && meta.count_position(PositionType::Short) as u32 >= max {
                    return Err(RejectionKind::MaxShortTrades(max));
                }
            }
            PositionType::Long => {
                let margin_ok =
                    self.config.trading.is_trade_margin_enabled && market.margin;
                if !market.spot && !margin_ok {
                    return Err(RejectionKind::WalletUnsupported {
                        symbol: signal.symbol.clone(),
                        wallet: self.config.trading.primary_wallet,
                    });
                }
                let max = self.config.trading.max_long_trades;
                if max > 0 && meta.count_position(PositionType::Long) as u32 >= max {
                    return Err(RejectionKind::MaxLongTrades(max));
                }
            }
        }

        Ok(())
    }

    fn validate_exit(
        &self,
        meta: &MetaData,
        signal: &Signal,
        position: PositionType,
        source: SourceType,
    ) -> Result<(), RejectionKind> {
        if !meta.is_operational {
            return Err(RejectionKind::NotOperational);
        }

        let trade = meta
            .find_trade(&signal.strategy_id, &signal.symbol, position)
            .ok_or(RejectionKind::NoMatchingTrade)?;
        if meta.trades_closing.contains(&trade.id) {
            return Err(RejectionKind::AlreadyClosing(trade.id.clone()));
        }

        let auto = matches!(source, SourceType::Signal | SourceType::Auto);
        if auto && trade.is_stopped {
            return Err(RejectionKind::TradeStopped(trade.id.clone()));
        }
        if auto && trade.is_hodl {
            // A held trade only leaves on profit.
            let fee = self.config.fees.taker_fee_percent;
            let pnl = match position {
                PositionType::Long => match (trade.price_buy, signal.price) {
                    (Some(buy), Some(sell)) => calculate_pnl(buy, sell, fee),
                    _ => Decimal::ZERO,
                },
                PositionType::Short => match (signal.price, trade.price_sell) {
                    (Some(buy), Some(sell)) => calculate_pnl(buy, sell, fee),
                    _ => Decimal::ZERO,
                },
            };
            if pnl < Decimal::ZERO {
                return Err(RejectionKind::HodlAtLoss(trade.id.clone()));
            }
        }

        Ok(())
    }

    // ==================== Operator actions ====================

    /// Stop or restart a strategy.
    pub async fn set_strategy_stopped(&self, strategy_id: &str, stopped: bool) -> Result<(), RejectionKind> {
        let mut meta = self.meta.lock().await;
        let strategy = meta
            .strategies
            .get_mut(strategy_id)
            .ok_or_else(|| RejectionKind::UnknownStrategy(strategy_id.to_string()))?;
        strategy.is_stopped = stopped;
        if !stopped {
            strategy.loss_trade_run = 0;
        }
        info!(strategy = %strategy_id, stopped, "Strategy stop flag changed");
        self.store.mark_dirty(SnapshotKey::Strategies);
        Ok(())
    }

    /// Flip a trade's HODL flag.
    pub async fn set_trade_hodl(&self, trade_id: &str, hodl: bool) -> Result<(), RejectionKind> {
        self.with_trade(trade_id, |trade| {
            trade.is_hodl = hodl;
            trade.time_updated = Utc::now();
        })
        .await
    }

    /// Flip a trade's stop flag.
    pub async fn set_trade_stopped(&self, trade_id: &str, stopped: bool) -> Result<(), RejectionKind> {
        self.with_trade(trade_id, |trade| {
            trade.is_stopped = stopped;
            trade.time_updated = Utc::now();
        })
        .await
    }

    async fn with_trade(
        &self,
        trade_id: &str,
        f: impl FnOnce(&mut crate::model::TradeOpen),
    ) -> Result<(), RejectionKind> {
        let mut meta = self.meta.lock().await;
        let trade = meta
            .trade_by_id_mut(trade_id)
            .ok_or(RejectionKind::NoMatchingTrade)?;
        f(trade);
        self.store.mark_dirty(SnapshotKey::TradesOpen);
        Ok(())
    }

    /// Operator close. Stopped or never-executed trades take the phantom
    /// path instead of the venue.
    pub async fn close_trade_manual(self: &Arc<Self>, trade_id: &str) -> Result<(), RejectionKind> {
        let (signal, position, phantom) = {
            let meta = self.meta.lock().await;
            let trade = meta
                .trade_by_id(trade_id)
                .ok_or(RejectionKind::NoMatchingTrade)?;
            if meta.trades_closing.contains(&trade.id) {
                return Err(RejectionKind::AlreadyClosing(trade.id.clone()));
            }
            let signal = Signal {
                strategy_id: trade.strategy_id.clone(),
                strategy_name: trade.strategy_name.clone(),
                symbol: trade.symbol.clone(),
                entry_type: EntryType::Exit,
                position_type: Some(trade.position_type),
                price: None,
                score: None,
                timestamp: Utc::now(),
            };
            (
                signal,
                trade.position_type,
                trade.is_stopped || !trade.is_executed,
            )
        };

        if phantom {
            self.drop_phantom_trade(trade_id).await?;
        } else {
            exit::close_trade_open(self, &signal, position, SourceType::Manual).await;
        }
        Ok(())
    }

    /// Delete a trade record without touching the venue, telling the hub to
    /// forget it as well.
    pub async fn delete_trade(&self, trade_id: &str) -> Result<(), RejectionKind> {
        let trade = {
            let mut meta = self.meta.lock().await;
            meta.remove_trade(trade_id)
                .ok_or(RejectionKind::NoMatchingTrade)?
        };
        self.store.mark_dirty(SnapshotKey::TradesOpen);
        self.send_phantom_acks(&trade);
        warn!(trade = %trade_id, symbol = %trade.symbol, "Trade deleted by operator");
        Ok(())
    }

    /// A close that cannot execute: acknowledge both sides so the hub drops
    /// the phantom, and drop never-executed records from the open list.
    async fn drop_phantom_trade(&self, trade_id: &str) -> Result<(), RejectionKind> {
        let (trade, remove) = {
            let meta = self.meta.lock().await;
            let trade = meta
                .trade_by_id(trade_id)
                .ok_or(RejectionKind::NoMatchingTrade)?
                .clone();
            let remove = !trade.is_executed;
            (trade, remove)
        };

        self.send_phantom_acks(&trade);

        if remove {
            let mut meta = self.meta.lock().await;
            meta.remove_trade(trade_id);
            self.store.mark_dirty(SnapshotKey::TradesOpen);
        }

        self.notifier
            .notify(Notification::new(
                NotifyLevel::Warn,
                format!("{} phantom close", trade.symbol),
                format!(
                    "trade {} could not be executed, the hub was told to drop it",
                    trade.id
                ),
            ))
            .await;
        Ok(())
    }

    fn send_phantom_acks(&self, trade: &crate::model::TradeOpen) {
        for channel in ["traded_buy_signal", "traded_sell_signal"] {
            self.hub.ack(HubAck {
                channel: channel.to_string(),
                payload: TradedPayload {
                    symbol: trade.symbol.clone(),
                    strategy_id: trade.strategy_id.clone(),
                    strategy_name: trade.strategy_name.clone(),
                    quantity: trade.quantity,
                    trading_mode: trade.trading_mode,
                },
            });
        }
    }

    /// Reset one PnL book.
    pub async fn reset_pnl(&self, quote: &str, mode: TradingMode) -> bool {
        let mut meta = self.meta.lock().await;
        let existed = meta.balance_history.reset(mode, quote);
        if existed {
            self.store.mark_dirty(SnapshotKey::BalanceHistory);
        }
        existed
    }

    /// Reseed the virtual ledger, optionally with an explicit amount.
    pub async fn reset_virtual(&self, funds: Option<Decimal>) {
        let mut meta = self.meta.lock().await;
        ledger::reseed(&mut meta, &self.config, funds);
        self.store.mark_dirty(SnapshotKey::VirtualBalances);
        info!("Virtual balances reseeded");
    }

    /// Buy fee tokens with the given quote asset up to the configured float.
    pub async fn top_up_fee_token(self: &Arc<Self>, quote: &str, wallet: WalletType) -> Result<()> {
        execute::top_up_fee_token(self, quote, wallet).await
    }

    // ==================== Fee-token reserve ====================

    /// Hysteresis check of the fee-token balance after real trades.
    pub(crate) async fn check_fee_reserve(self: &Arc<Self>) {
        let threshold = self.config.fees.bnb_free_threshold;
        if threshold <= Decimal::ZERO {
            return;
        }
        let free = match self.gateway.fetch_balance(WalletType::Spot).await {
            Ok(balances) => balances.free("BNB"),
            Err(e) => {
                debug!(error = %e, "Fee reserve check skipped");
                return;
            }
        };

        let next = if free >= threshold {
            FeeReserve::Ok
        } else if free <= Decimal::ZERO {
            FeeReserve::Empty
        } else if free < threshold / Decimal::from(2) {
            FeeReserve::Critical
        } else {
            FeeReserve::Low
        };

        let previous = {
            let mut state = self.fee_reserve.lock().expect("fee state poisoned");
            let previous = *state;
            *state = next;
            previous
        };
        if next == previous {
            return;
        }

        match next {
            FeeReserve::Ok => {
                info!(%free, "Fee-token reserve recovered");
            }
            FeeReserve::Low if previous == FeeReserve::Ok => {
                self.notifier
                    .notify(Notification::new(
                        NotifyLevel::Warn,
                        "fee reserve low",
                        format!("free fee-token balance {free} fell below {threshold}"),
                    ))
                    .await;
                self.auto_top_up().await;
            }
            FeeReserve::Critical if previous != FeeReserve::Empty => {
                self.notifier
                    .notify(Notification::new(
                        NotifyLevel::Warn,
                        "fee reserve critical",
                        format!("free fee-token balance {free} fell below half the threshold"),
                    ))
                    .await;
            }
            FeeReserve::Empty => {
                self.notifier
                    .notify(Notification::new(
                        NotifyLevel::Error,
                        "fee reserve empty",
                        "free fee-token balance is exhausted, orders will pay fees in kind",
                    ))
                    .await;
            }
            _ => {}
        }
    }

    async fn auto_top_up(self: &Arc<Self>) {
        let quote = self.config.fees.bnb_auto_top_up.clone();
        if quote.is_empty() {
            return;
        }
        if let Err(e) = execute::top_up_fee_token(self, &quote, WalletType::Spot).await {
            warn!(error = %e, "Automatic fee-token top-up failed");
        }
    }

    // ==================== Hub cross-check ====================

    /// Compare each active strategy's open trades against the hub, at most
    /// once per throttle window.
    pub(crate) async fn cross_check_strategies(self: &Arc<Self>) {
        let due: Vec<String> = {
            let meta = self.meta.lock().await;
            let mut checks = self.strategy_checks.lock().expect("checks poisoned");
            let due: Vec<String> = meta
                .strategies
                .values()
                .filter(|s| s.is_active)
                .filter(|s| {
                    checks
                        .get(&s.id)
                        .map(|at| at.elapsed() >= STRATEGY_CHECK_INTERVAL)
                        .unwrap_or(true)
                })
                .map(|s| s.id.clone())
                .collect();
            for id in &due {
                checks.insert(id.clone(), Instant::now());
            }
            due
        };

        for strategy_id in due {
            let hub_trades = match self.hub.list_strategy_trades(&strategy_id).await {
                Ok(trades) => trades,
                Err(e) => {
                    debug!(strategy = %strategy_id, error = %e, "Hub cross-check failed");
                    continue;
                }
            };
            let meta = self.meta.lock().await;
            for hub_trade in hub_trades {
                let known = meta
                    .find_trade(&strategy_id, &hub_trade.symbol, hub_trade.position_type)
                    .is_some();
                if !known {
                    warn!(
                        strategy = %strategy_id,
                        symbol = %hub_trade.symbol,
                        position = %hub_trade.position_type,
                        "Hub reports a trade this trader does not hold"
                    );
                }
            }
        }
    }

    // ==================== Shared helpers ====================

    /// Send a `traded_*` acknowledgement (empty channels stay local).
    pub(crate) fn send_ack(&self, channel: &str, trade: &crate::model::TradeOpen) {
        self.hub.ack(HubAck {
            channel: channel.to_string(),
            payload: TradedPayload {
                symbol: trade.symbol.clone(),
                strategy_id: trade.strategy_id.clone(),
                strategy_name: trade.strategy_name.clone(),
                quantity: trade.quantity,
                trading_mode: trade.trading_mode,
            },
        });
    }
}

#[cfg(test)]
pub(crate) mod testkit;
