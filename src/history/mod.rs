//! Per-day balance history and PnL book.
//!
//! One ordered list of day rows per (trading mode, quote asset). The first
//! row ever written is kept forever and absorbs the fees of expired rows;
//! everything else ages out after a year.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::TradingMode;

/// One UTC day of activity for a (mode, quote) book.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayRecord {
    pub date: NaiveDate,
    pub open_balance: Decimal,
    pub close_balance: Decimal,
    /// Signed; order fees are negative.
    #[serde(default)]
    pub estimated_fees: Decimal,
    pub profit_loss: Decimal,
    pub min_open_trades: u32,
    pub max_open_trades: u32,
    pub total_opened_trades: u32,
    pub total_closed_trades: u32,
}

impl DayRecord {
    fn new(date: NaiveDate, balance: Decimal, open_trades: u32) -> Self {
        Self {
            date,
            open_balance: balance,
            close_balance: balance,
            estimated_fees: Decimal::ZERO,
            profit_loss: Decimal::ZERO,
            min_open_trades: open_trades,
            max_open_trades: open_trades,
            total_opened_trades: 0,
            total_closed_trades: 0,
        }
    }
}

/// All books, keyed by "mode:quote".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BalanceHistoryBook {
    pub entries: HashMap<String, Vec<DayRecord>>,
}

fn book_key(mode: TradingMode, quote: &str) -> String {
    format!("{mode}:{quote}")
}

impl BalanceHistoryBook {
    /// Today's row for a book, created from `balance` when absent.
    fn day_mut(
        &mut self,
        mode: TradingMode,
        quote: &str,
        date: NaiveDate,
        balance: Decimal,
        open_trades: u32,
    ) -> &mut DayRecord {
        let rows = self.entries.entry(book_key(mode, quote)).or_default();
        let needs_new = rows.last().map(|r| r.date != date).unwrap_or(true);
        if needs_new {
            // Carry the previous close forward as today's open when we have
            // history; otherwise seed from the reported balance.
            let open = rows.last().map(|r| r.close_balance).unwrap_or(balance);
            rows.push(DayRecord::new(date, open, open_trades));
        }
        rows.last_mut().expect("row just ensured")
    }

    /// Record a trade opening.
    pub fn record_open(
        &mut self,
        mode: TradingMode,
        quote: &str,
        balance: Decimal,
        open_trades: u32,
    ) {
        let date = Utc::now().date_naive();
        let row = self.day_mut(mode, quote, date, balance, open_trades);
        row.total_opened_trades += 1;
        row.close_balance = balance;
        row.min_open_trades = row.min_open_trades.min(open_trades);
        row.max_open_trades = row.max_open_trades.max(open_trades);
    }

    /// Record a trade closing with its realized change and fee.
    pub fn record_close(
        &mut self,
        mode: TradingMode,
        quote: &str,
        balance: Decimal,
        open_trades: u32,
        change: Decimal,
        fee: Decimal,
    ) {
        let date = Utc::now().date_naive();
        let row = self.day_mut(mode, quote, date, balance, open_trades);
        row.total_closed_trades += 1;
        row.profit_loss += change;
        row.estimated_fees += fee;
        row.close_balance = balance;
        row.min_open_trades = row.min_open_trades.min(open_trades);
        row.max_open_trades = row.max_open_trades.max(open_trades);
    }

    /// Record a fee with no position change (e.g. a rebalance slice).
    pub fn record_fee(&mut self, mode: TradingMode, quote: &str, balance: Decimal, fee: Decimal) {
        let date = Utc::now().date_naive();
        let row = self.day_mut(mode, quote, date, balance, 0);
        row.estimated_fees += fee;
        row.close_balance = balance;
    }

    /// Drop rows older than a year, except the very first row of each book,
    /// which absorbs the expired rows' fees.
    pub fn prune(&mut self, today: NaiveDate) {
        let cutoff = today - chrono::Duration::days(365);
        for rows in self.entries.values_mut() {
            if rows.len() <= 1 {
                continue;
            }
            let first_date = rows[0].date;
            let mut rolled_fees = Decimal::ZERO;
            rows.retain(|r| {
                if r.date == first_date || r.date >= cutoff {
                    true
                } else {
                    rolled_fees += r.estimated_fees;
                    false
                }
            });
            if rolled_fees != Decimal::ZERO {
                rows[0].estimated_fees += rolled_fees;
            }
        }
    }

    /// Reset one book (operator action).
    pub fn reset(&mut self, mode: TradingMode, quote: &str) -> bool {
        self.entries.remove(&book_key(mode, quote)).is_some()
    }

    pub fn book(&self, mode: TradingMode, quote: &str) -> Option<&Vec<DayRecord>> {
        self.entries.get(&book_key(mode, quote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_open_and_close_update_counts() {
        let mut book = BalanceHistoryBook::default();
        book.record_open(TradingMode::Real, "BTC", dec!(1), 1);
        book.record_close(TradingMode::Real, "BTC", dec!(1.01), 0, dec!(0.012), dec!(-0.00002));

        let rows = book.book(TradingMode::Real, "BTC").unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.total_opened_trades, 1);
        assert_eq!(row.total_closed_trades, 1);
        assert_eq!(row.profit_loss, dec!(0.012));
        assert_eq!(row.estimated_fees, dec!(-0.00002));
        assert_eq!(row.close_balance, dec!(1.01));
    }

    #[test]
    fn test_prune_keeps_first_row_and_rolls_fees() {
        let mut book = BalanceHistoryBook::default();
        let today = Utc::now().date_naive();

        let rows = vec![
            DayRecord {
                estimated_fees: dec!(-0.001),
                ..DayRecord::new(today - chrono::Duration::days(800), dec!(1), 0)
            },
            DayRecord {
                estimated_fees: dec!(-0.002),
                ..DayRecord::new(today - chrono::Duration::days(500), dec!(1), 0)
            },
            DayRecord {
                estimated_fees: dec!(-0.003),
                ..DayRecord::new(today - chrono::Duration::days(400), dec!(1), 0)
            },
            DayRecord::new(today, dec!(1), 0),
        ];
        book.entries.insert("real:BTC".to_string(), rows);

        book.prune(today);

        let rows = book.book(TradingMode::Real, "BTC").unwrap();
        // The first row survives as the single entry older than a year.
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].estimated_fees, dec!(-0.006));
        assert_eq!(rows[1].date, today);
    }

    #[test]
    fn test_new_day_carries_close_forward() {
        let mut book = BalanceHistoryBook::default();
        let yesterday = Utc::now().date_naive() - chrono::Duration::days(1);
        book.entries.insert(
            "real:BTC".to_string(),
            vec![DayRecord {
                close_balance: dec!(1.5),
                ..DayRecord::new(yesterday, dec!(1), 0)
            }],
        );

        book.record_open(TradingMode::Real, "BTC", dec!(1.6), 1);
        let rows = book.book(TradingMode::Real, "BTC").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].open_balance, dec!(1.5));
        assert_eq!(rows[1].close_balance, dec!(1.6));
    }
}
