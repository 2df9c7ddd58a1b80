//! Wallet snapshot math and trade sizing.
//!
//! A snapshot aggregates free/locked/potential per wallet for one quote
//! asset from live balances plus the open-trade ledger. All arithmetic is
//! decimal; quantities are snapped to the market's legal step before any
//! order leaves the engine.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::exchange::Market;
use crate::model::{MetaData, PositionType, TradeOpen, WalletType};

/// Transient per-wallet view used while sizing one entry.
#[derive(Debug, Clone)]
pub struct WalletSnapshot {
    pub wallet: WalletType,
    /// Spendable quote balance after reservations and the wallet buffer.
    pub free: Decimal,
    /// Σ cost of open, non-closing, executed long trades in this wallet+quote.
    pub locked: Decimal,
    pub total: Decimal,
    /// Scratch field set by the funding policies.
    pub potential: Option<Decimal>,
    /// Rebalance candidates: open, non-closing, executed longs here.
    pub trades: Vec<TradeOpen>,
}

impl WalletSnapshot {
    /// Build the sizing view for one wallet and quote asset.
    ///
    /// Starting from the venue-reported (or virtual) free balance:
    /// - short-trade costs are subtracted (their sale proceeds inflate the
    ///   balance until the short is closed);
    /// - quantities of executed longs whose base is this quote are
    ///   subtracted (those coins will be sold on exit);
    /// - costs of not-yet-executed longs here are subtracted (reservations);
    /// - costs of closing longs here are added back (about to be released).
    pub fn build(
        wallet: WalletType,
        quote: &str,
        reported_free: Decimal,
        meta: &MetaData,
        buffer: Decimal,
    ) -> Self {
        let mut free = reported_free;
        let mut locked = Decimal::ZERO;
        let mut trades = Vec::new();

        for trade in &meta.trades_open {
            if trade.wallet != Some(wallet) {
                continue;
            }
            let market_quote = meta
                .markets
                .get(&trade.symbol)
                .map(|m| m.quote.as_str())
                .unwrap_or("");
            let market_base = meta
                .markets
                .get(&trade.symbol)
                .map(|m| m.base.as_str())
                .unwrap_or("");
            let closing = meta.trades_closing.contains(&trade.id);

            match trade.position_type {
                PositionType::Short => {
                    if trade.is_executed && market_quote == quote {
                        free -= trade.cost;
                    }
                }
                PositionType::Long => {
                    if trade.is_executed && market_base == quote {
                        free -= trade.quantity;
                    }
                    if market_quote == quote {
                        if !trade.is_executed {
                            free -= trade.cost;
                        } else if closing {
                            free += trade.cost;
                        } else {
                            locked += trade.cost;
                            trades.push(trade.clone());
                        }
                    }
                }
            }
        }

        let total = free + locked;
        let reserve = total * buffer;

        Self {
            wallet,
            free: free - reserve,
            locked,
            total: total - reserve,
            potential: None,
            trades,
        }
    }

    /// The largest rebalance candidate by cost.
    pub fn largest_trade(&self) -> Option<&TradeOpen> {
        self.trades.iter().max_by_key(|t| t.cost)
    }
}

/// Round-trip PnL in percent, with the taker fee charged on both legs.
///
/// At a flat price this is exactly the negative round-trip fee.
pub fn calculate_pnl(price_buy: Decimal, price_sell: Decimal, fee_percent: Decimal) -> Decimal {
    let f = fee_percent / dec!(100);
    let paid = price_buy * (Decimal::ONE + f);
    if paid == Decimal::ZERO {
        return Decimal::ZERO;
    }
    let received = price_sell * (Decimal::ONE - f);
    (received - paid) / paid * dec!(100)
}

/// Snap a desired quantity to a legal order for the market.
///
/// Floors to the step size, then raises to the venue minimums: the lot
/// minimum and the buffered minimum notional. Returns `(quantity, cost)`.
pub fn legal_order(
    market: &Market,
    desired_quantity: Decimal,
    price: Decimal,
    min_cost_buffer: Decimal,
) -> (Decimal, Decimal) {
    let mut quantity = market.amount_to_precision(desired_quantity);

    if quantity < market.min_amount {
        quantity = snap_up(market, market.min_amount);
    }

    let min_cost = market.min_cost_with_buffer(min_cost_buffer);
    if price > Decimal::ZERO && quantity * price < min_cost {
        quantity = snap_up(market, min_cost / price);
    }

    let cap = match (market.max_amount, market.max_market_amount) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    };
    if let Some(cap) = cap {
        if quantity > cap {
            quantity = market.amount_to_precision(cap);
        }
    }

    (quantity, quantity * price)
}

fn snap_up(market: &Market, quantity: Decimal) -> Decimal {
    if market.step_size <= Decimal::ZERO {
        return quantity.normalize();
    }
    ((quantity / market.step_size).ceil() * market.step_size).normalize()
}

/// A planned partial close of an existing long trade.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    pub trade_id: String,
    pub sell_quantity: Decimal,
    pub sell_cost: Decimal,
    pub remaining_quantity: Decimal,
    pub remaining_cost: Decimal,
}

/// Plan a partial close reducing `parent` to roughly `target_cost`.
///
/// Rejected when the legal snap inflates the sale to more than twice the
/// intended slice, when the slice would close the parent outright, or when
/// the remainder would fall below the market's legal minimum.
pub fn plan_rebalance(
    parent: &TradeOpen,
    target_cost: Decimal,
    sell_price: Decimal,
    market: &Market,
    min_cost_buffer: Decimal,
) -> Result<RebalancePlan, String> {
    let target_diff = parent.cost - target_cost;
    if target_diff <= Decimal::ZERO || sell_price <= Decimal::ZERO {
        return Err(format!(
            "target cost {target_cost} does not reduce the trade"
        ));
    }

    let (sell_quantity, sell_cost) =
        legal_order(market, target_diff / sell_price, sell_price, min_cost_buffer);

    if sell_cost / target_diff > dec!(2) {
        return Err(format!(
            "legal minimum sale {sell_cost} is more than twice the wanted slice {target_diff}"
        ));
    }

    if sell_quantity >= parent.quantity {
        return Err("slice would close the whole trade".to_string());
    }

    let remaining_quantity = parent.quantity - sell_quantity;
    if remaining_quantity < market.min_amount
        || remaining_quantity * sell_price < market.min_cost_with_buffer(min_cost_buffer)
    {
        return Err("remainder would fall below the market minimum".to_string());
    }

    Ok(RebalancePlan {
        trade_id: parent.id.clone(),
        sell_quantity,
        sell_cost,
        remaining_quantity,
        remaining_cost: parent.cost - sell_cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryType, Signal, TradingMode};
    use chrono::Utc;

    fn market() -> Market {
        Market {
            symbol: "ETHBTC".to_string(),
            base: "ETH".to_string(),
            quote: "BTC".to_string(),
            active: true,
            spot: true,
            margin: true,
            step_size: dec!(0.001),
            min_amount: dec!(0.001),
            max_amount: None,
            min_cost: dec!(0.0001),
            max_market_amount: None,
        }
    }

    fn trade(id: &str, qty: Decimal, cost: Decimal) -> TradeOpen {
        let signal = Signal {
            strategy_id: "s1".to_string(),
            strategy_name: "s1".to_string(),
            symbol: "ETHBTC".to_string(),
            entry_type: EntryType::Enter,
            position_type: Some(PositionType::Long),
            price: Some(cost / qty),
            score: None,
            timestamp: Utc::now(),
        };
        let mut t = TradeOpen::new(&signal, PositionType::Long, TradingMode::Real, Utc::now());
        t.id = id.to_string();
        t.quantity = qty;
        t.cost = cost;
        t.wallet = Some(WalletType::Spot);
        t.is_executed = true;
        t
    }

    #[test]
    fn test_flat_price_pnl_is_round_trip_fee() {
        // At a flat price the loss is exactly the two fee legs:
        // -2f / (1 + f) in percent terms.
        let fee = dec!(0.1);
        let pnl = calculate_pnl(dec!(100), dec!(100), fee);
        let f = fee / dec!(100);
        let expected = -dec!(2) * f / (Decimal::ONE + f) * dec!(100);
        assert_eq!(pnl, expected);
    }

    #[test]
    fn test_pnl_profit_after_fees() {
        let pnl = calculate_pnl(dec!(100), dec!(110), dec!(0.1));
        assert!(pnl > dec!(9.7) && pnl < dec!(9.9));
    }

    #[test]
    fn test_legal_order_min_cost_clamp() {
        let m = market();
        // Raw cost 0.001 * 0.05 = 0.00005 < 0.000102 buffered minimum.
        let (qty, cost) = legal_order(&m, dec!(0.001), dec!(0.05), dec!(0.02));
        assert!(cost >= m.min_cost_with_buffer(dec!(0.02)));
        assert_eq!(qty, m.amount_to_precision(qty));
    }

    #[test]
    fn test_legal_order_idempotent() {
        let m = market();
        let (q1, _) = legal_order(&m, dec!(1.23456), dec!(0.05), dec!(0.02));
        let (q2, _) = legal_order(&m, q1, dec!(0.05), dec!(0.02));
        assert_eq!(q1, q2);
    }

    #[test]
    fn test_snapshot_counts_locked_and_reservations() {
        let mut meta = MetaData::new(10);
        meta.markets.insert("ETHBTC".to_string(), market());

        let executed = trade("t1", dec!(1), dec!(0.02));
        let mut pending = trade("t2", dec!(0.5), dec!(0.01));
        pending.is_executed = false;
        meta.trades_open.push(executed);
        meta.trades_open.push(pending);

        let snapshot =
            WalletSnapshot::build(WalletType::Spot, "BTC", dec!(1), &meta, Decimal::ZERO);
        // Free loses the unexecuted reservation; locked holds the executed long.
        assert_eq!(snapshot.free, dec!(0.99));
        assert_eq!(snapshot.locked, dec!(0.02));
        assert_eq!(snapshot.trades.len(), 1);
    }

    #[test]
    fn test_snapshot_releases_closing_trades() {
        let mut meta = MetaData::new(10);
        meta.markets.insert("ETHBTC".to_string(), market());
        let t = trade("t1", dec!(1), dec!(0.02));
        meta.trades_closing.insert(t.id.clone());
        meta.trades_open.push(t);

        let snapshot =
            WalletSnapshot::build(WalletType::Spot, "BTC", dec!(1), &meta, Decimal::ZERO);
        assert_eq!(snapshot.free, dec!(1.02));
        assert_eq!(snapshot.locked, Decimal::ZERO);
        assert!(snapshot.trades.is_empty());
    }

    #[test]
    fn test_snapshot_wallet_buffer() {
        let mut meta = MetaData::new(10);
        meta.markets.insert("ETHBTC".to_string(), market());
        let snapshot =
            WalletSnapshot::build(WalletType::Spot, "BTC", dec!(1), &meta, dec!(0.1));
        assert_eq!(snapshot.free, dec!(0.9));
        assert_eq!(snapshot.total, dec!(0.9));
    }

    #[test]
    fn test_rebalance_plan_halves_largest() {
        let m = market();
        let parent = trade("t1", dec!(0.4), dec!(0.02));
        // Reduce 0.02 -> 0.0125: slice of 0.0075 at the entry price 0.05.
        let plan = plan_rebalance(&parent, dec!(0.0125), dec!(0.05), &m, Decimal::ZERO).unwrap();
        assert_eq!(plan.sell_quantity, dec!(0.15));
        assert_eq!(plan.sell_cost, dec!(0.0075));
        assert_eq!(plan.remaining_cost, dec!(0.0125));
    }

    #[test]
    fn test_rebalance_rejects_closing_slice() {
        let m = market();
        let parent = trade("t1", dec!(0.002), dec!(0.0001));
        let result = plan_rebalance(&parent, dec!(0.00001), dec!(0.05), &m, Decimal::ZERO);
        assert!(result.is_err());
    }

    #[test]
    fn test_rebalance_rejects_dust_remainder() {
        let m = market();
        // Remainder 0.001 ETH at 0.05 = 0.00005 < min cost.
        let parent = trade("t1", dec!(0.004), dec!(0.0002));
        let result = plan_rebalance(&parent, dec!(0.00005), dec!(0.05), &m, Decimal::ZERO);
        assert!(result.is_err());
    }
}
