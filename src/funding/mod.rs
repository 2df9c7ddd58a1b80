//! Long-entry funding policies.
//!
//! Each policy is a pure function over the candidate wallet snapshots and
//! decides which wallet funds a new long, how much of the requested cost is
//! affordable, what (if anything) must be borrowed, and which open trades are
//! rebalanced down to free quote balance.
//!
//! Invariant held by every policy: after the returned rebalances run, the
//! chosen wallet's free balance covers the returned cost.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::error::RejectionKind;
use crate::model::{LongFundsPolicy, WalletType};
use crate::wallet::WalletSnapshot;

/// A trade to partially close, and the cost it should be reduced to.
#[derive(Debug, Clone, PartialEq)]
pub struct RebalanceTarget {
    pub trade_id: String,
    pub target_cost: Decimal,
}

/// The funding decision for one long entry.
#[derive(Debug, Clone)]
pub struct FundingOutcome {
    pub wallet: WalletType,
    /// Affordable cost, possibly shrunk from the request.
    pub cost: Decimal,
    /// Quote amount to borrow before the order (margin wallet only).
    pub borrow: Decimal,
    pub rebalances: Vec<RebalanceTarget>,
    /// Spendable quote balance once the rebalances have run.
    pub potential: Decimal,
}

/// Decide how a long entry of `desired_cost` is funded.
///
/// `candidates` is ordered preferred-first. `pnl` maps trade ids to their
/// current PnL percentage (only consulted by the best-performer policy).
/// `min_legal_cost` is the buffered venue minimum; an outcome below it is a
/// rejection, not a trade.
pub fn plan_long_funding(
    policy: LongFundsPolicy,
    candidates: &[WalletSnapshot],
    desired_cost: Decimal,
    min_legal_cost: Decimal,
    pnl: &HashMap<String, Decimal>,
    symbol: &str,
) -> Result<FundingOutcome, RejectionKind> {
    if candidates.is_empty() {
        return Err(RejectionKind::MarginDisabled);
    }

    let outcome = match policy {
        LongFundsPolicy::None => spend_free(candidates, desired_cost),
        LongFundsPolicy::BorrowMin => borrow(candidates, desired_cost, false)?,
        LongFundsPolicy::BorrowAll => borrow(candidates, desired_cost, true)?,
        LongFundsPolicy::SellAll | LongFundsPolicy::SellLargest | LongFundsPolicy::SellLargestPnl => {
            rebalance_funding(policy, candidates, desired_cost, pnl)
        }
    };

    if outcome.cost < min_legal_cost || outcome.cost <= Decimal::ZERO {
        return Err(RejectionKind::CostInvalid {
            symbol: symbol.to_string(),
            cost: outcome.cost.to_string(),
        });
    }

    Ok(outcome)
}

/// Spend free balance only; shrink the cost when free falls short.
fn spend_free(candidates: &[WalletSnapshot], desired_cost: Decimal) -> FundingOutcome {
    let chosen = pick_wallet(candidates, desired_cost, |w| w.free);
    let potential = chosen.free;
    FundingOutcome {
        wallet: chosen.wallet,
        cost: desired_cost.min(potential),
        borrow: Decimal::ZERO,
        rebalances: Vec::new(),
        potential,
    }
}

/// Fund on margin, borrowing the shortfall or the full cost.
fn borrow(
    candidates: &[WalletSnapshot],
    desired_cost: Decimal,
    borrow_all: bool,
) -> Result<FundingOutcome, RejectionKind> {
    let margin = candidates
        .iter()
        .find(|w| w.wallet == WalletType::Margin)
        .ok_or(RejectionKind::MarginDisabled)?;

    let borrow = if borrow_all {
        desired_cost
    } else {
        (desired_cost - margin.free).max(Decimal::ZERO)
    };

    Ok(FundingOutcome {
        wallet: WalletType::Margin,
        cost: desired_cost,
        borrow,
        rebalances: Vec::new(),
        potential: desired_cost,
    })
}

/// Free funds by partially closing open longs.
fn rebalance_funding(
    policy: LongFundsPolicy,
    candidates: &[WalletSnapshot],
    desired_cost: Decimal,
    pnl: &HashMap<String, Decimal>,
) -> FundingOutcome {
    let mut planned: Vec<(Decimal, Vec<RebalanceTarget>)> = Vec::new();

    for wallet in candidates {
        planned.push(plan_wallet(policy, wallet, pnl));
    }

    // Preferred wallet wins when it can cover the request, otherwise the
    // wallet with the highest potential.
    let chosen_idx = planned
        .iter()
        .position(|(potential, _)| *potential >= desired_cost)
        .unwrap_or_else(|| {
            planned
                .iter()
                .enumerate()
                .max_by_key(|(_, (potential, _))| *potential)
                .map(|(i, _)| i)
                .unwrap_or(0)
        });

    let (potential, rebalances) = planned.swap_remove(chosen_idx);
    let wallet = candidates[chosen_idx].wallet;

    FundingOutcome {
        wallet,
        cost: desired_cost.min(potential),
        borrow: Decimal::ZERO,
        rebalances: if desired_cost <= candidates[chosen_idx].free {
            // Free balance already covers the request; nothing to sell.
            Vec::new()
        } else {
            rebalances
        },
        potential,
    }
}

/// Potential and rebalance targets for one wallet under one policy.
fn plan_wallet(
    policy: LongFundsPolicy,
    wallet: &WalletSnapshot,
    pnl: &HashMap<String, Decimal>,
) -> (Decimal, Vec<RebalanceTarget>) {
    let Some(largest) = wallet.largest_trade() else {
        return (wallet.free, Vec::new());
    };

    // A wallet whose free balance already rivals its largest position has
    // nothing worth splitting.
    if wallet.free >= largest.cost {
        return (wallet.free, Vec::new());
    }

    match policy {
        LongFundsPolicy::SellAll => {
            let mut kept: Vec<&crate::model::TradeOpen> = wallet.trades.iter().collect();
            let mut average;
            // Drop below-average trades until the remaining set's average is
            // a floor under every kept trade.
            loop {
                let sum: Decimal = kept.iter().map(|t| t.cost).sum();
                average = (wallet.free + sum) / Decimal::from(kept.len() as u64 + 1);
                let before = kept.len();
                kept.retain(|t| t.cost >= average);
                if kept.len() == before || kept.is_empty() {
                    break;
                }
            }
            let targets = kept
                .iter()
                .map(|t| RebalanceTarget {
                    trade_id: t.id.clone(),
                    target_cost: average,
                })
                .collect();
            (average, targets)
        }

        LongFundsPolicy::SellLargest => {
            let potential = (wallet.free + largest.cost) / dec!(2);
            (
                potential,
                vec![RebalanceTarget {
                    trade_id: largest.id.clone(),
                    target_cost: potential,
                }],
            )
        }

        LongFundsPolicy::SellLargestPnl => {
            // Among the above-average positions, split the best performer.
            let count = Decimal::from(wallet.trades.len() as u64);
            let mean: Decimal =
                wallet.trades.iter().map(|t| t.cost).sum::<Decimal>() / count;
            let chosen = wallet
                .trades
                .iter()
                .filter(|t| t.cost >= mean)
                .max_by_key(|t| pnl.get(&t.id).copied().unwrap_or(Decimal::MIN))
                .unwrap_or(largest);
            let potential = (wallet.free + chosen.cost) / dec!(2);
            (
                potential,
                vec![RebalanceTarget {
                    trade_id: chosen.id.clone(),
                    target_cost: potential,
                }],
            )
        }

        _ => (wallet.free, Vec::new()),
    }
}

/// Preferred-first wallet choice: first candidate covering the request,
/// falling back to the best-funded one.
fn pick_wallet<F>(candidates: &[WalletSnapshot], desired_cost: Decimal, metric: F) -> &WalletSnapshot
where
    F: Fn(&WalletSnapshot) -> Decimal,
{
    candidates
        .iter()
        .find(|w| metric(w) >= desired_cost)
        .unwrap_or_else(|| {
            candidates
                .iter()
                .max_by_key(|w| metric(w))
                .expect("candidates are non-empty")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryType, PositionType, Signal, TradeOpen, TradingMode};
    use chrono::Utc;

    fn snapshot(wallet: WalletType, free: Decimal, costs: &[(&str, Decimal)]) -> WalletSnapshot {
        let trades = costs
            .iter()
            .map(|(id, cost)| {
                let signal = Signal {
                    strategy_id: "s1".to_string(),
                    strategy_name: "s1".to_string(),
                    symbol: "ETHBTC".to_string(),
                    entry_type: EntryType::Enter,
                    position_type: Some(PositionType::Long),
                    price: Some(dec!(0.05)),
                    score: None,
                    timestamp: Utc::now(),
                };
                let mut t =
                    TradeOpen::new(&signal, PositionType::Long, TradingMode::Real, Utc::now());
                t.id = id.to_string();
                t.cost = *cost;
                t.quantity = *cost / dec!(0.05);
                t.wallet = Some(wallet);
                t.is_executed = true;
                t
            })
            .collect();
        let locked: Decimal = costs.iter().map(|(_, c)| *c).sum();
        WalletSnapshot {
            wallet,
            free,
            locked,
            total: free + locked,
            potential: None,
            trades,
        }
    }

    #[test]
    fn test_none_policy_shrinks_to_free() {
        let candidates = vec![snapshot(WalletType::Spot, dec!(0.004), &[])];
        let outcome = plan_long_funding(
            LongFundsPolicy::None,
            &candidates,
            dec!(0.01),
            dec!(0.0001),
            &HashMap::new(),
            "ETHBTC",
        )
        .unwrap();
        assert_eq!(outcome.cost, dec!(0.004));
        assert_eq!(outcome.borrow, Decimal::ZERO);
    }

    #[test]
    fn test_borrow_min_covers_shortfall() {
        let candidates = vec![snapshot(WalletType::Margin, dec!(0.004), &[])];
        let outcome = plan_long_funding(
            LongFundsPolicy::BorrowMin,
            &candidates,
            dec!(0.01),
            dec!(0.0001),
            &HashMap::new(),
            "ETHBTC",
        )
        .unwrap();
        assert_eq!(outcome.wallet, WalletType::Margin);
        assert_eq!(outcome.cost, dec!(0.01));
        assert_eq!(outcome.borrow, dec!(0.006));
    }

    #[test]
    fn test_borrow_all_borrows_everything() {
        let candidates = vec![snapshot(WalletType::Margin, dec!(0.004), &[])];
        let outcome = plan_long_funding(
            LongFundsPolicy::BorrowAll,
            &candidates,
            dec!(0.01),
            dec!(0.0001),
            &HashMap::new(),
            "ETHBTC",
        )
        .unwrap();
        assert_eq!(outcome.borrow, dec!(0.01));
    }

    #[test]
    fn test_borrow_requires_margin_candidate() {
        let candidates = vec![snapshot(WalletType::Spot, dec!(1), &[])];
        let result = plan_long_funding(
            LongFundsPolicy::BorrowMin,
            &candidates,
            dec!(0.01),
            dec!(0.0001),
            &HashMap::new(),
            "ETHBTC",
        );
        assert_eq!(result.unwrap_err(), RejectionKind::MarginDisabled);
    }

    #[test]
    fn test_sell_largest_splits_the_biggest() {
        let candidates = vec![snapshot(
            WalletType::Spot,
            dec!(0.005),
            &[("big", dec!(0.02)), ("small", dec!(0.01))],
        )];
        let outcome = plan_long_funding(
            LongFundsPolicy::SellLargest,
            &candidates,
            dec!(0.03),
            dec!(0.0001),
            &HashMap::new(),
            "ETHBTC",
        )
        .unwrap();
        assert_eq!(outcome.potential, dec!(0.0125));
        assert_eq!(outcome.cost, dec!(0.0125));
        assert_eq!(
            outcome.rebalances,
            vec![RebalanceTarget {
                trade_id: "big".to_string(),
                target_cost: dec!(0.0125),
            }]
        );
    }

    #[test]
    fn test_sell_largest_skips_rebalance_when_free_covers() {
        let candidates = vec![snapshot(
            WalletType::Spot,
            dec!(0.05),
            &[("big", dec!(0.02))],
        )];
        let outcome = plan_long_funding(
            LongFundsPolicy::SellLargest,
            &candidates,
            dec!(0.03),
            dec!(0.0001),
            &HashMap::new(),
            "ETHBTC",
        )
        .unwrap();
        assert!(outcome.rebalances.is_empty());
        assert_eq!(outcome.cost, dec!(0.03));
    }

    #[test]
    fn test_sell_all_levels_the_book() {
        // free 0.01, trades 0.05/0.03/0.002. First average:
        // (0.01+0.082)/4 = 0.023 drops the 0.002 trade; second:
        // (0.01+0.08)/3 = 0.03 keeps both remaining trades.
        let candidates = vec![snapshot(
            WalletType::Spot,
            dec!(0.01),
            &[("a", dec!(0.05)), ("b", dec!(0.03)), ("c", dec!(0.002))],
        )];
        let outcome = plan_long_funding(
            LongFundsPolicy::SellAll,
            &candidates,
            dec!(0.1),
            dec!(0.0001),
            &HashMap::new(),
            "ETHBTC",
        )
        .unwrap();
        assert_eq!(outcome.potential, dec!(0.03));
        assert_eq!(outcome.rebalances.len(), 2);
        assert!(outcome
            .rebalances
            .iter()
            .all(|r| r.target_cost == dec!(0.03)));
    }

    #[test]
    fn test_sell_largest_pnl_prefers_best_performer() {
        let candidates = vec![snapshot(
            WalletType::Spot,
            dec!(0.005),
            &[("winner", dec!(0.02)), ("bigger", dec!(0.022)), ("small", dec!(0.001))],
        )];
        let pnl = HashMap::from([
            ("winner".to_string(), dec!(5)),
            ("bigger".to_string(), dec!(-2)),
            ("small".to_string(), dec!(50)),
        ]);
        let outcome = plan_long_funding(
            LongFundsPolicy::SellLargestPnl,
            &candidates,
            dec!(0.03),
            dec!(0.0001),
            &HashMap::new(),
            "ETHBTC",
        );
        // Without PnL data the largest wins; with it, the best above-average
        // performer does.
        assert_eq!(
            outcome.unwrap().rebalances[0].trade_id,
            "bigger".to_string()
        );

        let outcome = plan_long_funding(
            LongFundsPolicy::SellLargestPnl,
            &candidates,
            dec!(0.03),
            dec!(0.0001),
            &pnl,
            "ETHBTC",
        )
        .unwrap();
        assert_eq!(outcome.rebalances[0].trade_id, "winner".to_string());
    }

    #[test]
    fn test_below_min_cost_is_rejected() {
        let candidates = vec![snapshot(WalletType::Spot, dec!(0.00001), &[])];
        let result = plan_long_funding(
            LongFundsPolicy::None,
            &candidates,
            dec!(0.01),
            dec!(0.0001),
            &HashMap::new(),
            "ETHBTC",
        );
        assert!(matches!(result, Err(RejectionKind::CostInvalid { .. })));
    }
}
