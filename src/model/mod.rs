//! Core trading data model.
//!
//! `MetaData` groups everything the engine mutates: strategies, open trades,
//! the closing-set overlay used for sizing, market and price caches, virtual
//! balances and the capped transaction ring. All mutations go through the
//! signal engine; the state store observes via a dirty-set.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::Market;
use crate::history::BalanceHistoryBook;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionType {
    Long,
    Short,
}

impl fmt::Display for PositionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionType::Long => write!(f, "long"),
            PositionType::Short => write!(f, "short"),
        }
    }
}

/// Whether a trade hits the venue or only the internal ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Real,
    Virtual,
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradingMode::Real => write!(f, "real"),
            TradingMode::Virtual => write!(f, "virtual"),
        }
    }
}

/// Venue wallet. Margin is cross-margin with borrow/repay semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalletType {
    Spot,
    Margin,
}

impl fmt::Display for WalletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalletType::Spot => write!(f, "spot"),
            WalletType::Margin => write!(f, "margin"),
        }
    }
}

/// Enter opens (or grows) a position, exit closes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Enter,
    Exit,
}

/// Funding model used for long entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LongFundsPolicy {
    /// Spend free balance only, shrinking the trade when short.
    None,
    /// Margin wallet, borrow only what free balance cannot cover.
    BorrowMin,
    /// Margin wallet, borrow the full cost.
    BorrowAll,
    /// Rebalance every eligible open long down to a common average.
    SellAll,
    /// Rebalance only the largest open long.
    SellLargest,
    /// Rebalance the best-performing of the above-average open longs.
    SellLargestPnl,
}

impl fmt::Display for LongFundsPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LongFundsPolicy::None => "none",
            LongFundsPolicy::BorrowMin => "borrow-min",
            LongFundsPolicy::BorrowAll => "borrow-all",
            LongFundsPolicy::SellAll => "sell-all",
            LongFundsPolicy::SellLargest => "sell-largest",
            LongFundsPolicy::SellLargestPnl => "sell-largest-pnl",
        };
        write!(f, "{name}")
    }
}

/// What caused a queue task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A hub signal.
    Signal,
    /// An engine-initiated partial close freeing funds for a new entry.
    Rebalance,
    /// An operator action.
    Manual,
    /// The background auto-close sweep.
    Auto,
}

/// A strategy as followed by this trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub trade_amount: Decimal,
    pub trading_mode: TradingMode,
    pub is_active: bool,
    /// Engine-owned: set after too many consecutive losses, survives
    /// strategy-list refreshes until the active flag toggles.
    #[serde(default)]
    pub is_stopped: bool,
    /// Engine-owned consecutive-loss counter.
    #[serde(default)]
    pub loss_trade_run: u32,
}

/// A signal event, normalized from the hub payloads.
#[derive(Debug, Clone)]
pub struct Signal {
    pub strategy_id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub entry_type: EntryType,
    /// Absent on close/stop payloads; resolved from the matching open trade.
    pub position_type: Option<PositionType>,
    pub price: Option<Decimal>,
    pub score: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// The engine's record of a live position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeOpen {
    pub id: String,
    pub strategy_id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub position_type: PositionType,
    pub trading_mode: TradingMode,
    /// Chosen during funding; shorts are always margin.
    pub wallet: Option<WalletType>,
    /// Base quantity.
    pub quantity: Decimal,
    /// Quote cost.
    pub cost: Decimal,
    /// Borrowed amount: base asset for shorts, quote asset for longs.
    pub borrow: Decimal,
    pub price_buy: Option<Decimal>,
    pub price_sell: Option<Decimal>,
    pub time_buy: Option<DateTime<Utc>>,
    pub time_sell: Option<DateTime<Utc>>,
    pub time_updated: DateTime<Utc>,
    /// Paused by the operator or after a partial execution failure.
    #[serde(default)]
    pub is_stopped: bool,
    /// Held: auto exits are skipped unless they would realize a profit.
    #[serde(default)]
    pub is_hodl: bool,
    /// The entry order reached the venue with a closed status.
    #[serde(default)]
    pub is_executed: bool,
}

impl TradeOpen {
    /// Create a trade record for a validated enter signal.
    pub fn new(
        signal: &Signal,
        position_type: PositionType,
        trading_mode: TradingMode,
        now: DateTime<Utc>,
    ) -> Self {
        let id = trade_id(&signal.strategy_id, &signal.symbol, position_type, now);
        let (price_buy, price_sell, time_buy, time_sell) = match position_type {
            PositionType::Long => (signal.price, None, Some(now), None),
            PositionType::Short => (None, signal.price, None, Some(now)),
        };
        Self {
            id,
            strategy_id: signal.strategy_id.clone(),
            strategy_name: signal.strategy_name.clone(),
            symbol: signal.symbol.clone(),
            position_type,
            trading_mode,
            wallet: None,
            quantity: Decimal::ZERO,
            cost: Decimal::ZERO,
            borrow: Decimal::ZERO,
            price_buy,
            price_sell,
            time_buy,
            time_sell,
            time_updated: now,
            is_stopped: false,
            is_hodl: false,
            is_executed: false,
        }
    }

    /// Key identifying the position this trade holds.
    pub fn position_key(&self) -> (String, String, PositionType) {
        (
            self.strategy_id.clone(),
            self.symbol.clone(),
            self.position_type,
        )
    }
}

/// Short engine-generated trade id: first 12 hex chars of an md5 digest.
pub fn trade_id(
    strategy_id: &str,
    symbol: &str,
    position_type: PositionType,
    time: DateTime<Utc>,
) -> String {
    let mut hasher = Md5::new();
    hasher.update(strategy_id.as_bytes());
    hasher.update(symbol.as_bytes());
    hasher.update(position_type.to_string().as_bytes());
    hasher.update(time.timestamp_millis().to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)[..12].to_string()
}

/// Counters for strategies we observe on the hub but do not follow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublicStrategy {
    pub id: String,
    pub name: String,
    pub short_opened: u64,
    pub long_opened: u64,
    pub closed: u64,
}

/// One row of the append-only transaction log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub time: DateTime<Utc>,
    pub trade_id: String,
    pub action: TransactionAction,
    pub symbol: String,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub cost: Decimal,
    pub wallet: WalletType,
    pub trading_mode: TradingMode,
    pub source: SourceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionAction {
    Buy,
    Sell,
    Borrow,
    Repay,
}

impl fmt::Display for TransactionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionAction::Buy => write!(f, "buy"),
            TransactionAction::Sell => write!(f, "sell"),
            TransactionAction::Borrow => write!(f, "borrow"),
            TransactionAction::Repay => write!(f, "repay"),
        }
    }
}

/// Everything the engine knows, in one mutable container.
#[derive(Debug, Default)]
pub struct MetaData {
    pub strategies: HashMap<String, Strategy>,
    pub trades_open: Vec<TradeOpen>,
    /// Trades scheduled for exit but not yet executed. Their locked cost is
    /// treated as released by sizing decisions.
    pub trades_closing: HashSet<String>,
    pub markets: HashMap<String, Market>,
    pub markets_loaded_at: Option<DateTime<Utc>>,
    pub prices: HashMap<String, Decimal>,
    pub prices_loaded_at: Option<DateTime<Utc>>,
    /// wallet -> asset -> balance, for virtual trades.
    pub virtual_balances: HashMap<WalletType, HashMap<String, Decimal>>,
    pub balance_history: BalanceHistoryBook,
    pub public_strategies: HashMap<String, PublicStrategy>,
    pub transactions: VecDeque<Transaction>,
    /// Cap for the in-memory transaction ring.
    pub transactions_cap: usize,
    /// Set once startup reconciliation has finished.
    pub is_operational: bool,
}

impl MetaData {
    pub fn new(transactions_cap: usize) -> Self {
        Self {
            transactions_cap,
            ..Default::default()
        }
    }

    /// Find the open trade holding a (strategy, symbol, position) slot.
    pub fn find_trade(
        &self,
        strategy_id: &str,
        symbol: &str,
        position_type: PositionType,
    ) -> Option<&TradeOpen> {
        self.trades_open.iter().find(|t| {
            t.strategy_id == strategy_id
                && t.symbol == symbol
                && t.position_type == position_type
        })
    }

    pub fn find_trade_mut(
        &mut self,
        strategy_id: &str,
        symbol: &str,
        position_type: PositionType,
    ) -> Option<&mut TradeOpen> {
        self.trades_open.iter_mut().find(|t| {
            t.strategy_id == strategy_id
                && t.symbol == symbol
                && t.position_type == position_type
        })
    }

    pub fn trade_by_id(&self, id: &str) -> Option<&TradeOpen> {
        self.trades_open.iter().find(|t| t.id == id)
    }

    pub fn trade_by_id_mut(&mut self, id: &str) -> Option<&mut TradeOpen> {
        self.trades_open.iter_mut().find(|t| t.id == id)
    }

    /// Remove a trade from the open list, returning it.
    pub fn remove_trade(&mut self, id: &str) -> Option<TradeOpen> {
        let idx = self.trades_open.iter().position(|t| t.id == id)?;
        self.trades_closing.remove(id);
        Some(self.trades_open.remove(idx))
    }

    /// Open trades belonging to one strategy.
    pub fn open_trades_for(&self, strategy_id: &str) -> usize {
        self.trades_open
            .iter()
            .filter(|t| t.strategy_id == strategy_id)
            .count()
    }

    /// Count of open trades by position type.
    pub fn count_position(&self, position_type: PositionType) -> usize {
        self.trades_open
            .iter()
            .filter(|t| t.position_type == position_type)
            .count()
    }

    /// Append to the transaction ring, dropping the oldest rows past the cap.
    pub fn push_transaction(&mut self, tx: Transaction) {
        self.transactions.push_back(tx);
        while self.transactions_cap > 0 && self.transactions.len() > self.transactions_cap {
            self.transactions.pop_front();
        }
    }

    /// A virtual balance, zero when never seeded.
    pub fn virtual_balance(&self, wallet: WalletType, asset: &str) -> Decimal {
        self.virtual_balances
            .get(&wallet)
            .and_then(|assets| assets.get(asset))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Add to (or subtract from) a virtual balance.
    pub fn adjust_virtual_balance(&mut self, wallet: WalletType, asset: &str, delta: Decimal) {
        let entry = self
            .virtual_balances
            .entry(wallet)
            .or_default()
            .entry(asset.to_string())
            .or_insert(Decimal::ZERO);
        *entry += delta;
    }
}
