//! Virtual trading ledger.
//!
//! Trades in virtual mode never reach the venue: orders become ledger
//! movements on `virtual_balances` and a synthetic filled-order response is
//! fabricated from the live book.

use rust_decimal::Decimal;
use tracing::debug;

use crate::config::Config;
use crate::exchange::{Market, OrderResult, OrderSide, OrderStatus};
use crate::model::{MetaData, TradingMode, WalletType};

/// Balance for a (wallet, quote), seeding it on first touch.
///
/// The reference quote is seeded with the configured funds; other quotes
/// scale by the ratio of minimum notionals, so every book starts with a
/// comparable number of minimum trades.
pub(crate) fn seeded_balance(
    meta: &mut MetaData,
    config: &Config,
    wallet: WalletType,
    asset: &str,
) -> Decimal {
    if let Some(existing) = meta
        .virtual_balances
        .get(&wallet)
        .and_then(|assets| assets.get(asset))
    {
        return *existing;
    }
    let seed = seed_for(meta, config, asset);
    debug!(wallet = %wallet, %asset, %seed, "Seeding virtual balance");
    meta.adjust_virtual_balance(wallet, asset, seed);
    seed
}

fn seed_for(meta: &MetaData, config: &Config, quote: &str) -> Decimal {
    let funds = config.virtual_trading.wallet_funds;
    let Some(reference) = meta.markets.get(&config.virtual_trading.reference_symbol) else {
        return funds;
    };
    if reference.quote == quote {
        return funds;
    }
    // The sibling market quoted in the target asset carries the scale.
    let sibling = meta
        .markets
        .values()
        .find(|m| m.base == reference.base && m.quote == quote);
    match sibling {
        Some(sibling) if reference.min_cost > Decimal::ZERO => {
            funds * sibling.min_cost / reference.min_cost
        }
        _ => funds,
    }
}

/// Fabricate a filled market order from the book: buys at the ask, sells at
/// the bid, falling back to the provided price when no book is available.
pub(crate) fn synthetic_order(
    side: OrderSide,
    quantity: Decimal,
    book: Option<(Decimal, Decimal)>,
    fallback_price: Decimal,
) -> OrderResult {
    let price = match (side, book) {
        (OrderSide::Buy, Some((_, ask))) if ask > Decimal::ZERO => ask,
        (OrderSide::Sell, Some((bid, _))) if bid > Decimal::ZERO => bid,
        _ => fallback_price,
    };
    OrderResult {
        status: OrderStatus::Closed,
        price,
        quantity,
        cost: quantity * price,
    }
}

/// Apply a fill to the ledger: quote and base move in opposite directions.
pub(crate) fn apply_fill(
    meta: &mut MetaData,
    wallet: WalletType,
    market: &Market,
    side: OrderSide,
    order: &OrderResult,
) {
    match side {
        OrderSide::Buy => {
            meta.adjust_virtual_balance(wallet, &market.quote, -order.cost);
            meta.adjust_virtual_balance(wallet, &market.base, order.quantity);
        }
        OrderSide::Sell => {
            meta.adjust_virtual_balance(wallet, &market.quote, order.cost);
            meta.adjust_virtual_balance(wallet, &market.base, -order.quantity);
        }
    }
}

/// Move a borrowed (or repaid) amount on the margin ledger.
pub(crate) fn apply_loan(meta: &mut MetaData, asset: &str, amount: Decimal) {
    meta.adjust_virtual_balance(WalletType::Margin, asset, amount);
}

/// Wipe and reseed every book, optionally overriding the reference funds.
pub(crate) fn reseed(meta: &mut MetaData, config: &Config, funds: Option<Decimal>) {
    meta.virtual_balances.clear();
    let quotes: Vec<String> = meta
        .markets
        .values()
        .map(|m| m.quote.clone())
        .collect::<std::collections::HashSet<_>>()
        .into_iter()
        .collect();

    let scaled;
    let config = if let Some(funds) = funds {
        let mut overridden = config.clone();
        overridden.virtual_trading.wallet_funds = funds;
        scaled = overridden;
        &scaled
    } else {
        config
    };

    for wallet in [WalletType::Spot, WalletType::Margin] {
        for quote in &quotes {
            seeded_balance(meta, config, wallet, quote);
        }
    }

    // Open virtual trades keep their claim on the fresh books.
    for trade in meta.trades_open.clone() {
        if trade.trading_mode != TradingMode::Virtual || !trade.is_executed {
            continue;
        }
        let Some(wallet) = trade.wallet else { continue };
        let Some(market) = meta.markets.get(&trade.symbol).cloned() else {
            continue;
        };
        match trade.position_type {
            crate::model::PositionType::Long => {
                meta.adjust_virtual_balance(wallet, &market.quote, -trade.cost);
                meta.adjust_virtual_balance(wallet, &market.base, trade.quantity);
            }
            crate::model::PositionType::Short => {
                // Sale proceeds are in, the borrowed base is owed.
                meta.adjust_virtual_balance(wallet, &market.quote, trade.cost);
                meta.adjust_virtual_balance(wallet, &market.base, -trade.borrow);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn market(symbol: &str, base: &str, quote: &str, min_cost: Decimal) -> Market {
        Market {
            symbol: symbol.to_string(),
            base: base.to_string(),
            quote: quote.to_string(),
            active: true,
            spot: true,
            margin: true,
            step_size: dec!(0.001),
            min_amount: dec!(0.001),
            max_amount: None,
            min_cost,
            max_market_amount: None,
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.virtual_trading.wallet_funds = dec!(0.1);
        config.virtual_trading.reference_symbol = "BNBBTC".to_string();
        config
    }

    #[test]
    fn test_reference_quote_seeds_with_configured_funds() {
        let mut meta = MetaData::new(10);
        meta.markets
            .insert("BNBBTC".to_string(), market("BNBBTC", "BNB", "BTC", dec!(0.0001)));
        let balance = seeded_balance(&mut meta, &config(), WalletType::Spot, "BTC");
        assert_eq!(balance, dec!(0.1));
    }

    #[test]
    fn test_other_quote_scales_by_min_cost_ratio() {
        let mut meta = MetaData::new(10);
        meta.markets
            .insert("BNBBTC".to_string(), market("BNBBTC", "BNB", "BTC", dec!(0.0001)));
        meta.markets
            .insert("BNBETH".to_string(), market("BNBETH", "BNB", "ETH", dec!(0.001)));
        let balance = seeded_balance(&mut meta, &config(), WalletType::Spot, "ETH");
        // 0.1 * 0.001 / 0.0001 = 1 ETH
        assert_eq!(balance, dec!(1.0));
    }

    #[test]
    fn test_seed_happens_once() {
        let mut meta = MetaData::new(10);
        meta.markets
            .insert("BNBBTC".to_string(), market("BNBBTC", "BNB", "BTC", dec!(0.0001)));
        seeded_balance(&mut meta, &config(), WalletType::Spot, "BTC");
        meta.adjust_virtual_balance(WalletType::Spot, "BTC", dec!(-0.04));
        let balance = seeded_balance(&mut meta, &config(), WalletType::Spot, "BTC");
        assert_eq!(balance, dec!(0.06));
    }

    #[test]
    fn test_synthetic_order_uses_book_side() {
        let buy = synthetic_order(OrderSide::Buy, dec!(1), Some((dec!(9), dec!(11))), dec!(10));
        assert_eq!(buy.price, dec!(11));
        let sell = synthetic_order(OrderSide::Sell, dec!(1), Some((dec!(9), dec!(11))), dec!(10));
        assert_eq!(sell.price, dec!(9));
        let fallback = synthetic_order(OrderSide::Sell, dec!(1), None, dec!(10));
        assert_eq!(fallback.price, dec!(10));
    }

    #[test]
    fn test_apply_fill_moves_both_assets() {
        let mut meta = MetaData::new(10);
        let m = market("ETHBTC", "ETH", "BTC", dec!(0.0001));
        meta.adjust_virtual_balance(WalletType::Spot, "BTC", dec!(1));

        let order = OrderResult {
            status: OrderStatus::Closed,
            price: dec!(0.05),
            quantity: dec!(2),
            cost: dec!(0.1),
        };
        apply_fill(&mut meta, WalletType::Spot, &m, OrderSide::Buy, &order);
        assert_eq!(meta.virtual_balance(WalletType::Spot, "BTC"), dec!(0.9));
        assert_eq!(meta.virtual_balance(WalletType::Spot, "ETH"), dec!(2));
    }
}
