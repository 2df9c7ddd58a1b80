//! Scripted venue and hub doubles for engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::Engine;
use crate::config::Config;
use crate::exchange::{
    AssetBalance, ExchangeApi, Gateway, Market, OrderResult, OrderSide, OrderStatus, Ticker,
    WalletBalances,
};
use crate::hub::{HubAck, HubApi, HubTrade};
use crate::model::{Strategy, TradingMode, WalletType};
use crate::notify::{Notifier, NotifyLevel, RingBufferSink};
use crate::queue::TradeQueue;
use crate::store::StateStore;

/// One order as seen by the scripted venue.
#[derive(Debug, Clone)]
pub struct RecordedOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub wallet: WalletType,
}

/// Scripted venue: fixed balances, deterministic fills, switchable failures.
pub struct MockExchange {
    pub markets: Vec<Market>,
    pub ticker: Mutex<Ticker>,
    pub balances: Mutex<HashMap<WalletType, HashMap<String, AssetBalance>>>,
    pub orders: Mutex<Vec<RecordedOrder>>,
    pub borrows: Mutex<Vec<(String, Decimal)>>,
    pub repays: Mutex<Vec<(String, Decimal)>>,
    pub fail_orders: AtomicBool,
    pub fail_repay: AtomicBool,
}

impl MockExchange {
    pub fn new(markets: Vec<Market>) -> Arc<Self> {
        Arc::new(Self {
            markets,
            ticker: Mutex::new(Ticker {
                bid: dec!(0.05),
                ask: dec!(0.05),
            }),
            balances: Mutex::new(HashMap::new()),
            orders: Mutex::new(Vec::new()),
            borrows: Mutex::new(Vec::new()),
            repays: Mutex::new(Vec::new()),
            fail_orders: AtomicBool::new(false),
            fail_repay: AtomicBool::new(false),
        })
    }

    pub fn set_free(&self, wallet: WalletType, asset: &str, free: Decimal) {
        self.balances
            .lock()
            .unwrap()
            .entry(wallet)
            .or_default()
            .insert(
                asset.to_string(),
                AssetBalance {
                    free,
                    ..Default::default()
                },
            );
    }

    pub fn set_ticker(&self, bid: Decimal, ask: Decimal) {
        *self.ticker.lock().unwrap() = Ticker { bid, ask };
    }

    pub fn recorded_orders(&self) -> Vec<RecordedOrder> {
        self.orders.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn fetch_markets(&self) -> Result<Vec<Market>> {
        Ok(self.markets.clone())
    }

    async fn fetch_prices(&self) -> Result<HashMap<String, Decimal>> {
        let ticker = self.ticker.lock().unwrap();
        Ok(self
            .markets
            .iter()
            .map(|m| (m.symbol.clone(), ticker.bid))
            .collect())
    }

    async fn fetch_ticker(&self, _symbol: &str) -> Result<Ticker> {
        Ok(*self.ticker.lock().unwrap())
    }

    async fn fetch_balances(&self, wallet: WalletType) -> Result<WalletBalances> {
        Ok(WalletBalances {
            wallet,
            assets: self
                .balances
                .lock()
                .unwrap()
                .get(&wallet)
                .cloned()
                .unwrap_or_default(),
            fetched_at: Utc::now(),
        })
    }

    async fn create_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        wallet: WalletType,
    ) -> Result<OrderResult> {
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(anyhow!("venue rejected the order"));
        }
        self.orders.lock().unwrap().push(RecordedOrder {
            symbol: symbol.to_string(),
            side,
            quantity,
            wallet,
        });
        let ticker = *self.ticker.lock().unwrap();
        let price = match side {
            OrderSide::Buy => ticker.ask,
            OrderSide::Sell => ticker.bid,
        };
        Ok(OrderResult {
            status: OrderStatus::Closed,
            price,
            quantity,
            cost: quantity * price,
        })
    }

    async fn margin_borrow(&self, asset: &str, amount: Decimal) -> Result<u64> {
        self.borrows
            .lock()
            .unwrap()
            .push((asset.to_string(), amount));
        Ok(1)
    }

    async fn margin_repay(&self, asset: &str, amount: Decimal) -> Result<u64> {
        if self.fail_repay.load(Ordering::SeqCst) {
            return Err(anyhow!("repay rejected"));
        }
        self.repays
            .lock()
            .unwrap()
            .push((asset.to_string(), amount));
        Ok(2)
    }
}

/// Scripted hub: records acknowledgements, serves canned trade lists.
#[derive(Default)]
pub struct MockHub {
    pub acks: Mutex<Vec<HubAck>>,
    pub user_trades: Mutex<Vec<HubTrade>>,
}

#[async_trait]
impl HubApi for MockHub {
    fn ack(&self, ack: HubAck) {
        self.acks.lock().unwrap().push(ack);
    }

    async fn list_user_trades(&self) -> Result<Vec<HubTrade>> {
        Ok(self.user_trades.lock().unwrap().clone())
    }

    async fn list_strategy_trades(&self, _strategy_id: &str) -> Result<Vec<HubTrade>> {
        Ok(Vec::new())
    }
}

/// A fully wired engine against scripted collaborators.
pub struct TestRig {
    pub engine: Arc<Engine>,
    pub exchange: Arc<MockExchange>,
    pub hub: Arc<MockHub>,
    pub ring: Arc<RingBufferSink>,
}

/// The ETHBTC market every scenario uses.
pub fn eth_market() -> Market {
    Market {
        symbol: "ETHBTC".to_string(),
        base: "ETH".to_string(),
        quote: "BTC".to_string(),
        active: true,
        spot: true,
        margin: true,
        step_size: dec!(0.0001),
        min_amount: dec!(0.0001),
        max_amount: None,
        min_cost: dec!(0.0001),
        max_market_amount: None,
    }
}

pub fn strategy(id: &str, amount: Decimal, mode: TradingMode) -> Strategy {
    Strategy {
        id: id.to_string(),
        name: format!("{id}-name"),
        trade_amount: amount,
        trading_mode: mode,
        is_active: true,
        is_stopped: false,
        loss_trade_run: 0,
    }
}

/// Assemble an operational engine over in-memory collaborators.
pub async fn rig(config: Config, markets: Vec<Market>, strategies: Vec<Strategy>) -> TestRig {
    let exchange = MockExchange::new(markets.clone());
    let gateway = Arc::new(Gateway::new(exchange.clone(), 0));
    let store = Arc::new(StateStore::open_in_memory(100).unwrap());
    let ring = RingBufferSink::new(100);
    let mut notifier = Notifier::new(NotifyLevel::Info);
    notifier.register(ring.clone());
    let hub = Arc::new(MockHub::default());
    let (queue, _worker) = TradeQueue::start(Duration::from_millis(1));

    let engine = Engine::new(
        Arc::new(config),
        gateway,
        store,
        Arc::new(notifier),
        hub.clone(),
        queue,
    );

    {
        let mut meta = engine.meta.lock().await;
        meta.markets = markets.into_iter().map(|m| (m.symbol.clone(), m)).collect();
        meta.strategies = strategies.into_iter().map(|s| (s.id.clone(), s)).collect();
        meta.is_operational = true;
    }

    TestRig {
        engine,
        exchange,
        hub,
        ring,
    }
}

/// Let the queue worker and any spawned tasks drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_secs(2)).await;
}
