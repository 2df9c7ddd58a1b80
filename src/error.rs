//! Engine error taxonomy.
//!
//! Validation failures are values, not exceptions: every reason a signal can
//! be dropped is a `RejectionKind` variant with structured fields, consumed
//! uniformly by the log, notifier and hub-ack paths.

use thiserror::Error;

use crate::model::{PositionType, WalletType};
use crate::notify::NotifyLevel;

/// Why a signal (or operator request) was not acted upon.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionKind {
    #[error("trader is not operational yet")]
    NotOperational,

    #[error("unknown strategy {0}")]
    UnknownStrategy(String),

    #[error("strategy {0} is not active")]
    InactiveStrategy(String),

    #[error("strategy {0} has been stopped")]
    StoppedStrategy(String),

    #[error("strategy {strategy_id} already has an open {position} trade for {symbol}")]
    DuplicateTrade {
        strategy_id: String,
        symbol: String,
        position: PositionType,
    },

    #[error("strategy {strategy_id} is close to its loss limit ({loss_run} consecutive losses)")]
    LossLimitThrottled { strategy_id: String, loss_run: u32 },

    #[error("{0} trading is disabled")]
    PositionTypeDisabled(PositionType),

    #[error("coin {0} is excluded from trading")]
    CoinExcluded(String),

    #[error("symbol {0} is not tradable")]
    SymbolNotTradable(String),

    #[error("symbol {symbol} is not supported on the {wallet} wallet")]
    WalletUnsupported { symbol: String, wallet: WalletType },

    #[error("margin trading is disabled")]
    MarginDisabled,

    #[error("maximum of {0} concurrent short trades reached")]
    MaxShortTrades(u32),

    #[error("maximum of {0} concurrent long trades reached")]
    MaxLongTrades(u32),

    #[error("no open trade matches the signal")]
    NoMatchingTrade,

    #[error("trade {0} is already closing")]
    AlreadyClosing(String),

    #[error("trade {0} is stopped, close it manually")]
    TradeStopped(String),

    #[error("trade {0} is on HODL and would close at a loss")]
    HodlAtLoss(String),

    #[error("cost {cost} for {symbol} is invalid after sizing")]
    CostInvalid { symbol: String, cost: String },

    #[error("insufficient funds for {symbol}: needed {needed}, available {available}")]
    InsufficientFunds {
        symbol: String,
        needed: String,
        available: String,
    },

    #[error("rebalance of trade {0} rejected: {1}")]
    RebalanceRejected(String, String),

    #[error("trade {0} was modified while its task was queued")]
    TradeConflict(String),
}

impl RejectionKind {
    /// Notification level for this rejection. Only `Error`-class rejections
    /// reach the operator sinks; the rest are log-only.
    pub fn level(&self) -> NotifyLevel {
        match self {
            RejectionKind::NotOperational
            | RejectionKind::CostInvalid { .. }
            | RejectionKind::InsufficientFunds { .. }
            | RejectionKind::TradeConflict(_) => NotifyLevel::Error,
            RejectionKind::LossLimitThrottled { .. }
            | RejectionKind::StoppedStrategy(_)
            | RejectionKind::TradeStopped(_)
            | RejectionKind::HodlAtLoss(_) => NotifyLevel::Warn,
            _ => NotifyLevel::Info,
        }
    }
}

/// Failures raised by the trade lifecycle engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A signal failed validation and was dropped.
    #[error(transparent)]
    Rejected(#[from] RejectionKind),

    /// A venue call failed; the task fails and is not retried.
    #[error("exchange call failed: {0}")]
    Exchange(#[source] anyhow::Error),

    /// The main order went through but a follow-up step did not.
    #[error("trade {trade_id} partially executed: {detail}")]
    PartialSequence { trade_id: String, detail: String },

    /// The trader cannot come up in a usable state.
    #[error("startup failed: {0}")]
    Startup(String),
}
