//! Venue-agnostic trait for the raw exchange operations.
//!
//! The gateway talks to the venue exclusively through this trait, so engine
//! tests can substitute a scripted in-memory venue.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::{Market, OrderResult, OrderSide, Ticker, WalletBalances};
use crate::model::WalletType;

/// Raw venue operations. All amounts are decimals; all symbols are the
/// venue's native concatenated form (e.g. "ETHBTC").
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// All markets, with the cross-margin flag already enriched.
    async fn fetch_markets(&self) -> anyhow::Result<Vec<Market>>;

    /// Latest price for every symbol.
    async fn fetch_prices(&self) -> anyhow::Result<HashMap<String, Decimal>>;

    /// Best bid/ask for one symbol.
    async fn fetch_ticker(&self, symbol: &str) -> anyhow::Result<Ticker>;

    /// Balance snapshot for one wallet.
    async fn fetch_balances(&self, wallet: WalletType) -> anyhow::Result<WalletBalances>;

    /// Place a market order. Success requires a closed status in the result.
    async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        wallet: WalletType,
    ) -> anyhow::Result<OrderResult>;

    /// Borrow on cross margin. Returns the venue transaction id.
    async fn margin_borrow(&self, asset: &str, amount: Decimal) -> anyhow::Result<u64>;

    /// Repay a cross-margin loan. Returns the venue transaction id.
    async fn margin_repay(&self, asset: &str, amount: Decimal) -> anyhow::Result<u64>;
}
