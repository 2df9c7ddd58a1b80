//! Signal hub connectivity.

mod client;
mod types;

pub use client::{HubApi, HubClient};
pub use types::{
    ack_channel, Envelope, HubAck, HubEvent, HubTrade, SignalPayload, StrategyPayload,
    TradedPayload,
};
