//! Caching façade over the raw venue operations.
//!
//! Owns the market, price and balance caches. Every mutating call invalidates
//! the balance cache on both sides of the venue round-trip and timestamps the
//! mutation; balance reads wait out a settle delay after the most recent
//! mutation so the venue's books have caught up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::traits::ExchangeApi;
use super::types::{Market, OrderResult, OrderSide, Ticker, WalletBalances};
use crate::model::WalletType;

fn markets_ttl() -> chrono::Duration {
    chrono::Duration::hours(24)
}

fn prices_ttl() -> chrono::Duration {
    chrono::Duration::seconds(60)
}

fn balance_ttl() -> chrono::Duration {
    chrono::Duration::hours(24)
}

#[derive(Default)]
struct Caches {
    markets: Option<(Arc<HashMap<String, Market>>, DateTime<Utc>)>,
    prices: Option<(Arc<HashMap<String, Decimal>>, DateTime<Utc>)>,
    balances: HashMap<WalletType, WalletBalances>,
    last_mutation: Option<Instant>,
}

/// Typed, caching gateway to the exchange.
pub struct Gateway {
    api: Arc<dyn ExchangeApi>,
    settle_delay: Duration,
    caches: Mutex<Caches>,
}

impl Gateway {
    pub fn new(api: Arc<dyn ExchangeApi>, settle_delay_ms: u64) -> Self {
        Self {
            api,
            settle_delay: Duration::from_millis(settle_delay_ms),
            caches: Mutex::new(Caches::default()),
        }
    }

    /// Markets keyed by symbol, cached for 24 hours unless forced.
    pub async fn load_markets(&self, force: bool) -> Result<Arc<HashMap<String, Market>>> {
        if !force {
            let caches = self.caches.lock().await;
            if let Some((markets, at)) = &caches.markets {
                if Utc::now() - *at < markets_ttl() {
                    return Ok(Arc::clone(markets));
                }
            }
        }

        let markets: HashMap<String, Market> = self
            .api
            .fetch_markets()
            .await?
            .into_iter()
            .map(|m| (m.symbol.clone(), m))
            .collect();
        let markets = Arc::new(markets);

        let mut caches = self.caches.lock().await;
        caches.markets = Some((Arc::clone(&markets), Utc::now()));
        Ok(markets)
    }

    /// Age of the markets cache, if loaded.
    pub async fn markets_age(&self) -> Option<chrono::Duration> {
        let caches = self.caches.lock().await;
        caches.markets.as_ref().map(|(_, at)| Utc::now() - *at)
    }

    /// Latest prices, cached for 60 seconds unless forced.
    pub async fn load_prices(&self, force: bool) -> Result<Arc<HashMap<String, Decimal>>> {
        if !force {
            let caches = self.caches.lock().await;
            if let Some((prices, at)) = &caches.prices {
                if Utc::now() - *at < prices_ttl() {
                    return Ok(Arc::clone(prices));
                }
            }
        }

        let prices = Arc::new(self.api.fetch_prices().await?);
        let mut caches = self.caches.lock().await;
        caches.prices = Some((Arc::clone(&prices), Utc::now()));
        Ok(prices)
    }

    /// Best bid/ask, never cached.
    pub async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        self.api.fetch_ticker(symbol).await
    }

    /// Balance snapshot for a wallet, cached until the next mutating call.
    ///
    /// Waits out the settle delay after the most recent mutation before
    /// hitting the venue again.
    pub async fn fetch_balance(&self, wallet: WalletType) -> Result<WalletBalances> {
        let wait = {
            let caches = self.caches.lock().await;
            if let Some(cached) = caches.balances.get(&wallet) {
                if Utc::now() - cached.fetched_at < balance_ttl() {
                    return Ok(cached.clone());
                }
            }
            caches.last_mutation.and_then(|at| {
                self.settle_delay.checked_sub(at.elapsed())
            })
        };

        if let Some(wait) = wait {
            debug!(wallet = %wallet, wait_ms = wait.as_millis() as u64, "Waiting for balances to settle");
            tokio::time::sleep(wait).await;
        }

        let balances = self.api.fetch_balances(wallet).await?;
        let mut caches = self.caches.lock().await;
        caches.balances.insert(wallet, balances.clone());
        Ok(balances)
    }

    /// Drop every cached balance and stamp the mutation clock.
    async fn invalidate_balances(&self) {
        let mut caches = self.caches.lock().await;
        caches.balances.clear();
        caches.last_mutation = Some(Instant::now());
    }

    /// Place a market order. The caller is responsible for precision snapping.
    pub async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        wallet: WalletType,
    ) -> Result<OrderResult> {
        self.invalidate_balances().await;
        let result = self
            .api
            .create_market_order(symbol, side, quantity, wallet)
            .await;
        self.invalidate_balances().await;
        result
    }

    /// Borrow on cross margin.
    pub async fn margin_borrow(&self, asset: &str, amount: Decimal) -> Result<u64> {
        self.invalidate_balances().await;
        let result = self.api.margin_borrow(asset, amount).await;
        self.invalidate_balances().await;
        result
    }

    /// Repay a cross-margin loan.
    pub async fn margin_repay(&self, asset: &str, amount: Decimal) -> Result<u64> {
        self.invalidate_balances().await;
        let result = self.api.margin_repay(asset, amount).await;
        self.invalidate_balances().await;
        result
    }

    /// Snap a quantity to the market's legal step.
    pub async fn amount_to_precision(&self, symbol: &str, quantity: Decimal) -> Result<Decimal> {
        let markets = self.load_markets(false).await?;
        let market = markets
            .get(symbol)
            .ok_or_else(|| anyhow!("unknown market {symbol}"))?;
        Ok(market.amount_to_precision(quantity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct CountingApi {
        balance_calls: AtomicU32,
        price_calls: AtomicU32,
    }

    #[async_trait]
    impl ExchangeApi for CountingApi {
        async fn fetch_markets(&self) -> Result<Vec<Market>> {
            Ok(vec![Market {
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
            }])
        }

        async fn fetch_prices(&self) -> Result<HashMap<String, Decimal>> {
            self.price_calls.fetch_add(1, Ordering::SeqCst);
            Ok(HashMap::from([("ETHBTC".to_string(), dec!(0.05))]))
        }

        async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker> {
            Ok(Ticker {
                bid: dec!(0.049),
                ask: dec!(0.051),
            })
        }

        async fn fetch_balances(&self, wallet: WalletType) -> Result<WalletBalances> {
            self.balance_calls.fetch_add(1, Ordering::SeqCst);
            Ok(WalletBalances {
                wallet,
                assets: HashMap::new(),
                fetched_at: Utc::now(),
            })
        }

        async fn create_market_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            quantity: Decimal,
            _wallet: WalletType,
        ) -> Result<OrderResult> {
            Ok(OrderResult {
                status: super::super::types::OrderStatus::Closed,
                price: dec!(0.05),
                quantity,
                cost: quantity * dec!(0.05),
            })
        }

        async fn margin_borrow(&self, _asset: &str, _amount: Decimal) -> Result<u64> {
            Ok(1)
        }

        async fn margin_repay(&self, _asset: &str, _amount: Decimal) -> Result<u64> {
            Ok(2)
        }
    }

    #[tokio::test]
    async fn test_balance_cache_hit() {
        let api = Arc::new(CountingApi::default());
        let gateway = Gateway::new(api.clone(), 0);

        gateway.fetch_balance(WalletType::Spot).await.unwrap();
        gateway.fetch_balance(WalletType::Spot).await.unwrap();
        assert_eq!(api.balance_calls.load(Ordering::SeqCst), 1);

        // A different wallet is a different cache entry.
        gateway.fetch_balance(WalletType::Margin).await.unwrap();
        assert_eq!(api.balance_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mutation_invalidates_balance_cache() {
        let api = Arc::new(CountingApi::default());
        let gateway = Gateway::new(api.clone(), 0);

        gateway.fetch_balance(WalletType::Spot).await.unwrap();
        gateway
            .create_market_order("ETHBTC", OrderSide::Buy, dec!(1), WalletType::Spot)
            .await
            .unwrap();
        gateway.fetch_balance(WalletType::Spot).await.unwrap();
        assert_eq!(api.balance_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_price_cache_within_ttl() {
        let api = Arc::new(CountingApi::default());
        let gateway = Gateway::new(api.clone(), 0);

        gateway.load_prices(false).await.unwrap();
        gateway.load_prices(false).await.unwrap();
        assert_eq!(api.price_calls.load(Ordering::SeqCst), 1);

        gateway.load_prices(true).await.unwrap();
        assert_eq!(api.price_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_amount_to_precision_uses_market_step() {
        let gateway = Gateway::new(Arc::new(CountingApi::default()), 0);
        let snapped = gateway
            .amount_to_precision("ETHBTC", dec!(1.23456))
            .await
            .unwrap();
        assert_eq!(snapped, dec!(1.234));
    }
}
