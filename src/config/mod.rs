//! Configuration management for the signal trader.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::model::{LongFundsPolicy, WalletType};

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Exchange API credentials
    pub exchange: ExchangeConfig,
    /// Signal hub connection
    pub hub: HubConfig,
    /// Trading behavior
    pub trading: TradingConfig,
    /// Fee accounting and fee-token reserve
    pub fees: FeesConfig,
    /// Virtual (paper) trading ledger
    #[serde(rename = "virtual")]
    pub virtual_trading: VirtualConfig,
    /// Timing knobs
    pub timing: TimingConfig,
    /// State store
    pub store: StoreConfig,
    /// Operator HTTP surface
    pub ops: OpsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    pub api_key: String,
    /// Secret key for signing requests
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    /// Socket endpoint of the signal hub
    pub url: String,
    /// HTTP endpoint for trade-list lookups
    pub http_url: String,
    /// Hub API key
    pub api_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Wallet tried first when funding a long entry
    #[serde(default = "default_primary_wallet")]
    pub primary_wallet: WalletType,
    /// Funding model for long entries
    #[serde(default = "default_long_funds")]
    pub long_funds: LongFundsPolicy,
    /// Only free funds from trades currently in profit
    #[serde(default)]
    pub is_funds_no_loss: bool,
    /// Allow the margin wallet at all
    #[serde(default = "default_true")]
    pub is_trade_margin_enabled: bool,
    /// Allow short entries (margin only)
    #[serde(default)]
    pub is_trade_short_enabled: bool,
    /// Interpret a strategy's trade amount as a fraction of the wallet
    #[serde(default)]
    pub is_buy_qty_fraction: bool,
    /// Repay borrow interest together with principal
    #[serde(default = "default_true")]
    pub is_pay_interest_enabled: bool,
    /// Close HODL / stopped-strategy trades automatically once profitable
    #[serde(default)]
    pub is_auto_close_enabled: bool,
    /// Fraction of each wallet withheld from new trades (0.0-1.0)
    #[serde(default = "default_wallet_buffer")]
    pub wallet_buffer: Decimal,
    /// Maximum concurrent long trades (0 = unlimited)
    #[serde(default)]
    pub max_long_trades: u32,
    /// Maximum concurrent short trades (0 = unlimited)
    #[serde(default)]
    pub max_short_trades: u32,
    /// Consecutive losses before a strategy is stopped (0 = disabled)
    #[serde(default)]
    pub strategy_loss_limit: u32,
    /// Fraction of the loss limit at which new entries are throttled (0.0-1.0)
    #[serde(default)]
    pub strategy_limit_threshold: Decimal,
    /// Comma-separated coins never traded
    #[serde(default)]
    pub exclude_coins: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeesConfig {
    /// Taker fee per order leg, in percent
    #[serde(default = "default_taker_fee")]
    pub taker_fee_percent: Decimal,
    /// Safety margin applied on top of the venue minimum cost (fraction)
    #[serde(default = "default_min_cost_buffer")]
    pub min_cost_buffer: Decimal,
    /// Free fee-token balance below which the operator is warned
    #[serde(default = "default_bnb_threshold")]
    pub bnb_free_threshold: Decimal,
    /// Target free fee-token balance for automatic top-ups
    #[serde(default = "default_bnb_float")]
    pub bnb_free_float: Decimal,
    /// Quote asset used to buy fee tokens automatically (empty = disabled)
    #[serde(default)]
    pub bnb_auto_top_up: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualConfig {
    /// Seed balance per wallet for the reference quote asset
    #[serde(default = "default_virtual_funds")]
    pub wallet_funds: Decimal,
    /// Market used to scale seed balances across quote assets
    #[serde(default = "default_reference_symbol")]
    pub reference_symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    /// Wait after a mutating venue call before balances are refetched (ms)
    #[serde(default = "default_balance_sync_delay")]
    pub balance_sync_delay_ms: u64,
    /// Period of the background maintenance tick (ms)
    #[serde(default = "default_background_interval")]
    pub background_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Row cap for the append-only logs
    #[serde(default = "default_max_rows")]
    pub max_database_rows: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpsConfig {
    /// Bind address of the operator surface
    #[serde(default = "default_ops_bind")]
    pub bind: String,
    /// Optional password; empty disables the check
    #[serde(default)]
    pub password: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_primary_wallet() -> WalletType {
    WalletType::Margin
}

fn default_long_funds() -> LongFundsPolicy {
    LongFundsPolicy::None
}

fn default_wallet_buffer() -> Decimal {
    Decimal::ZERO
}

fn default_taker_fee() -> Decimal {
    Decimal::new(1, 1) // 0.1%
}

fn default_min_cost_buffer() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_bnb_threshold() -> Decimal {
    Decimal::new(2, 2) // 0.02 BNB
}

fn default_bnb_float() -> Decimal {
    Decimal::new(1, 1) // 0.1 BNB
}

fn default_virtual_funds() -> Decimal {
    Decimal::new(1, 1) // 0.1 of the reference quote
}

fn default_reference_symbol() -> String {
    "BNBBTC".to_string()
}

fn default_balance_sync_delay() -> u64 {
    3_000
}

fn default_background_interval() -> u64 {
    300_000
}

fn default_store_path() -> String {
    "trader.db".to_string()
}

fn default_max_rows() -> u32 {
    1_000
}

fn default_ops_bind() -> String {
    "0.0.0.0:8003".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("TRADER"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.trading.wallet_buffer >= Decimal::ZERO
                && self.trading.wallet_buffer < Decimal::ONE,
            "wallet_buffer must be in [0, 1)"
        );

        anyhow::ensure!(
            self.trading.strategy_limit_threshold >= Decimal::ZERO
                && self.trading.strategy_limit_threshold <= Decimal::ONE,
            "strategy_limit_threshold must be in [0, 1]"
        );

        anyhow::ensure!(
            self.fees.taker_fee_percent >= Decimal::ZERO,
            "taker_fee_percent must not be negative"
        );

        anyhow::ensure!(
            self.fees.min_cost_buffer >= Decimal::ZERO,
            "min_cost_buffer must not be negative"
        );

        anyhow::ensure!(
            self.virtual_trading.wallet_funds > Decimal::ZERO,
            "virtual wallet_funds must be positive"
        );

        if self.trading.is_trade_short_enabled {
            anyhow::ensure!(
                self.trading.is_trade_margin_enabled,
                "short trading requires the margin wallet"
            );
        }

        if self.trading.primary_wallet == WalletType::Margin {
            anyhow::ensure!(
                self.trading.is_trade_margin_enabled,
                "primary_wallet is margin but margin trading is disabled"
            );
        }

        Ok(())
    }

    /// Coins never traded, parsed from the comma list.
    pub fn excluded_coins(&self) -> Vec<String> {
        self.trading
            .exclude_coins
            .split(',')
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty())
            .collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig {
                api_key: String::new(),
                secret_key: String::new(),
                testnet: true,
            },
            hub: HubConfig {
                url: "wss://hub.example.com/socket".to_string(),
                http_url: "https://hub.example.com".to_string(),
                api_key: String::new(),
            },
            trading: TradingConfig {
                primary_wallet: default_primary_wallet(),
                long_funds: default_long_funds(),
                is_funds_no_loss: false,
                is_trade_margin_enabled: true,
                is_trade_short_enabled: false,
                is_buy_qty_fraction: false,
                is_pay_interest_enabled: true,
                is_auto_close_enabled: false,
                wallet_buffer: default_wallet_buffer(),
                max_long_trades: 0,
                max_short_trades: 0,
                strategy_loss_limit: 0,
                strategy_limit_threshold: Decimal::ZERO,
                exclude_coins: String::new(),
            },
            fees: FeesConfig {
                taker_fee_percent: default_taker_fee(),
                min_cost_buffer: default_min_cost_buffer(),
                bnb_free_threshold: default_bnb_threshold(),
                bnb_free_float: default_bnb_float(),
                bnb_auto_top_up: String::new(),
            },
            virtual_trading: VirtualConfig {
                wallet_funds: default_virtual_funds(),
                reference_symbol: default_reference_symbol(),
            },
            timing: TimingConfig {
                balance_sync_delay_ms: default_balance_sync_delay(),
                background_interval_ms: default_background_interval(),
            },
            store: StoreConfig {
                path: default_store_path(),
                max_database_rows: default_max_rows(),
            },
            ops: OpsConfig {
                bind: default_ops_bind(),
                password: String::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_excluded_coins_parsing() {
        let mut config = Config::default();
        config.trading.exclude_coins = "doge, shib,,pepe ".to_string();
        assert_eq!(config.excluded_coins(), vec!["DOGE", "SHIB", "PEPE"]);
    }

    #[test]
    fn test_short_requires_margin() {
        let mut config = Config::default();
        config.trading.is_trade_short_enabled = true;
        config.trading.is_trade_margin_enabled = false;
        config.trading.primary_wallet = WalletType::Spot;
        assert!(config.validate().is_err());
    }
}
