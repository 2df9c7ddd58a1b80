//! Exchange connectivity: raw client, typed gateway and shared types.

mod client;
mod gateway;
mod traits;
mod types;

pub use client::BinanceClient;
pub use gateway::Gateway;
pub use traits::ExchangeApi;
pub use types::{
    AssetBalance, Market, OrderResult, OrderSide, OrderStatus, Ticker, WalletBalances,
};
