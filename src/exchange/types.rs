//! Type definitions for venue data and Binance API responses.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::WalletType;

/// A tradable market, normalized from the venue's exchange info.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub active: bool,
    pub spot: bool,
    /// Cross-margin trading allowed (enriched from a separate endpoint).
    pub margin: bool,
    /// Quantity step size from the lot filter.
    pub step_size: Decimal,
    pub min_amount: Decimal,
    pub max_amount: Option<Decimal>,
    /// Minimum order notional in quote terms.
    pub min_cost: Decimal,
    /// Cap for market orders, when tighter than `max_amount`.
    pub max_market_amount: Option<Decimal>,
}

impl Market {
    /// Does this market trade on the given wallet?
    pub fn supports(&self, wallet: WalletType) -> bool {
        match wallet {
            WalletType::Spot => self.spot,
            WalletType::Margin => self.margin,
        }
    }

    /// Snap a quantity down to the market's step size.
    ///
    /// Idempotent: snapping a snapped value returns it unchanged.
    pub fn amount_to_precision(&self, quantity: Decimal) -> Decimal {
        if self.step_size <= Decimal::ZERO {
            return quantity.normalize();
        }
        ((quantity / self.step_size).floor() * self.step_size).normalize()
    }

    /// Venue minimum notional inflated by the configured safety buffer.
    pub fn min_cost_with_buffer(&self, buffer: Decimal) -> Decimal {
        self.min_cost * (Decimal::ONE + buffer)
    }
}

/// Best bid/ask for a symbol.
#[derive(Debug, Clone, Copy)]
pub struct Ticker {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Per-asset balance line inside a wallet.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
    /// Margin wallet only.
    pub borrowed: Decimal,
    /// Accrued borrow interest, margin wallet only.
    pub interest: Decimal,
}

/// A wallet balance snapshot.
#[derive(Debug, Clone)]
pub struct WalletBalances {
    pub wallet: WalletType,
    pub assets: HashMap<String, AssetBalance>,
    pub fetched_at: DateTime<Utc>,
}

impl WalletBalances {
    pub fn asset(&self, asset: &str) -> AssetBalance {
        self.assets.get(asset).copied().unwrap_or_default()
    }

    pub fn free(&self, asset: &str) -> Decimal {
        self.asset(asset).free
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Normalized order lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    /// Fully filled.
    Closed,
    /// Accepted but not (fully) filled.
    Open,
    Canceled,
    Rejected,
}

/// Result of a market order, normalized.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub status: OrderStatus,
    /// Average fill price.
    pub price: Decimal,
    /// Filled base quantity.
    pub quantity: Decimal,
    /// Filled quote notional.
    pub cost: Decimal,
}

impl OrderResult {
    pub fn is_closed(&self) -> bool {
        self.status == OrderStatus::Closed
    }
}

// ==================== Binance wire types ====================

#[derive(Debug, Deserialize)]
pub struct ExchangeInfoResponse {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub is_spot_trading_allowed: bool,
    pub filters: Vec<SymbolFilter>,
}

/// Subset of the symbol filters the sizing math needs.
#[derive(Debug, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        #[serde(with = "rust_decimal::serde::str")]
        min_qty: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        max_qty: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        step_size: Decimal,
    },
    #[serde(rename = "MARKET_LOT_SIZE", rename_all = "camelCase")]
    MarketLotSize {
        #[serde(with = "rust_decimal::serde::str")]
        max_qty: Decimal,
    },
    #[serde(rename = "NOTIONAL", rename_all = "camelCase")]
    Notional {
        #[serde(with = "rust_decimal::serde::str")]
        min_notional: Decimal,
    },
    #[serde(rename = "MIN_NOTIONAL", rename_all = "camelCase")]
    MinNotional {
        #[serde(with = "rust_decimal::serde::str")]
        min_notional: Decimal,
    },
    #[serde(other)]
    Other,
}

impl SymbolInfo {
    /// Normalize into a `Market`; the cross-margin flag is enriched later.
    pub fn into_market(self) -> Market {
        let mut step_size = Decimal::ZERO;
        let mut min_amount = Decimal::ZERO;
        let mut max_amount = None;
        let mut min_cost = Decimal::ZERO;
        let mut max_market_amount = None;

        for filter in &self.filters {
            match filter {
                SymbolFilter::LotSize {
                    min_qty,
                    max_qty,
                    step_size: step,
                } => {
                    min_amount = *min_qty;
                    max_amount = Some(*max_qty);
                    step_size = *step;
                }
                SymbolFilter::MarketLotSize { max_qty } => {
                    max_market_amount = Some(*max_qty);
                }
                SymbolFilter::Notional { min_notional }
                | SymbolFilter::MinNotional { min_notional } => {
                    min_cost = *min_notional;
                }
                SymbolFilter::Other => {}
            }
        }

        Market {
            active: self.status == "TRADING",
            symbol: self.symbol,
            base: self.base_asset,
            quote: self.quote_asset,
            spot: self.is_spot_trading_allowed,
            margin: false,
            step_size,
            min_amount,
            max_amount,
            min_cost,
            max_market_amount,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginPair {
    pub symbol: String,
    #[serde(default)]
    pub is_margin_trade: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceTicker {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookTicker {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub bid_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub ask_price: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotAccountResponse {
    pub balances: Vec<SpotBalanceLine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotBalanceLine {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginAccountResponse {
    pub user_assets: Vec<MarginAssetLine>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginAssetLine {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub borrowed: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub interest: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub status: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    #[serde(rename = "cummulativeQuoteQty", with = "rust_decimal::serde::str")]
    pub cumulative_quote_qty: Decimal,
}

impl OrderResponse {
    /// Normalize the venue response. Average price falls back to zero when
    /// nothing filled.
    pub fn into_result(self) -> OrderResult {
        let status = match self.status.as_str() {
            "FILLED" => OrderStatus::Closed,
            "CANCELED" => OrderStatus::Canceled,
            "REJECTED" | "EXPIRED" => OrderStatus::Rejected,
            _ => OrderStatus::Open,
        };
        let price = if self.executed_qty > Decimal::ZERO {
            self.cumulative_quote_qty / self.executed_qty
        } else {
            Decimal::ZERO
        };
        OrderResult {
            status,
            price,
            quantity: self.executed_qty,
            cost: self.cumulative_quote_qty,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginTransactionResponse {
    pub tran_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market(step: Decimal) -> Market {
        Market {
            symbol: "ETHBTC".to_string(),
            base: "ETH".to_string(),
            quote: "BTC".to_string(),
            active: true,
            spot: true,
            margin: true,
            step_size: step,
            min_amount: dec!(0.001),
            max_amount: None,
            min_cost: dec!(0.0001),
            max_market_amount: None,
        }
    }

    #[test]
    fn test_amount_to_precision_floors_to_step() {
        let m = market(dec!(0.001));
        assert_eq!(m.amount_to_precision(dec!(1.23456)), dec!(1.234));
        assert_eq!(m.amount_to_precision(dec!(0.0009)), Decimal::ZERO);
    }

    #[test]
    fn test_amount_to_precision_is_idempotent() {
        let m = market(dec!(0.01));
        let once = m.amount_to_precision(dec!(5.5555));
        assert_eq!(m.amount_to_precision(once), once);
    }

    #[test]
    fn test_min_cost_buffer() {
        let m = market(dec!(0.001));
        assert_eq!(m.min_cost_with_buffer(dec!(0.02)), dec!(0.000102));
    }

    #[test]
    fn test_order_response_average_price() {
        let resp = OrderResponse {
            status: "FILLED".to_string(),
            executed_qty: dec!(2),
            cumulative_quote_qty: dec!(0.02),
        };
        let result = resp.into_result();
        assert!(result.is_closed());
        assert_eq!(result.price, dec!(0.01));
    }

    #[test]
    fn test_symbol_filters_parse() {
        let raw = serde_json::json!({
            "symbol": "ETHBTC",
            "status": "TRADING",
            "baseAsset": "ETH",
            "quoteAsset": "BTC",
            "isSpotTradingAllowed": true,
            "filters": [
                {"filterType": "LOT_SIZE", "minQty": "0.001", "maxQty": "100000", "stepSize": "0.001"},
                {"filterType": "NOTIONAL", "minNotional": "0.0001"},
                {"filterType": "PRICE_FILTER", "minPrice": "0.000001", "maxPrice": "1000", "tickSize": "0.000001"}
            ]
        });
        let info: SymbolInfo = serde_json::from_value(raw).unwrap();
        let market = info.into_market();
        assert!(market.active);
        assert_eq!(market.step_size, dec!(0.001));
        assert_eq!(market.min_cost, dec!(0.0001));
    }
}
