//! Wire types for the signal hub.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::model::{EntryType, PositionType, TradingMode};

/// Events delivered by the hub connection.
#[derive(Debug, Clone)]
pub enum HubEvent {
    /// Full strategy-list refresh.
    StrategyList(Vec<StrategyPayload>),
    /// A buy-side signal (long enter or short exit).
    Buy(SignalPayload),
    /// A sell-side signal (short enter or long exit).
    Sell(SignalPayload),
    /// Unconditional close request.
    Close(SignalPayload),
    /// Stop request: pause the matching trade without touching the venue.
    Stop(SignalPayload),
    /// Connection established.
    Connected,
    /// Connection lost; a reconnect follows.
    Disconnected,
}

/// One strategy row of the strategy-list payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyPayload {
    pub strategy_id: String,
    pub strategy_name: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub trade_amount: Decimal,
    pub trading_mode: TradingMode,
    pub is_active: bool,
}

/// A raw signal payload. The signal kind is implicit in the event name.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalPayload {
    pub strategy_id: String,
    pub strategy_name: String,
    pub symbol: String,
    #[serde(default)]
    pub entry_type: Option<EntryType>,
    #[serde(default)]
    pub position_type: Option<PositionType>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub score: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An open trade as reported by the hub's HTTP surface.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubTrade {
    pub strategy_id: String,
    pub strategy_name: String,
    pub symbol: String,
    pub position_type: PositionType,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub quantity: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price_buy: Option<Decimal>,
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub price_sell: Option<Decimal>,
    #[serde(default)]
    pub is_stopped: bool,
    pub timestamp: DateTime<Utc>,
}

/// Acknowledgement sent back after a trade executes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradedPayload {
    pub symbol: String,
    pub strategy_id: String,
    pub strategy_name: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub quantity: Decimal,
    pub trading_mode: TradingMode,
}

/// An outbound hub message: channel name plus payload. An empty channel is
/// swallowed (used by engine-internal trades that the hub must not see).
#[derive(Debug, Clone)]
pub struct HubAck {
    pub channel: String,
    pub payload: TradedPayload,
}

/// Channel name for the ack matching an order side.
pub fn ack_channel(is_buy: bool) -> &'static str {
    if is_buy {
        "traded_buy_signal"
    } else {
        "traded_sell_signal"
    }
}

/// JSON envelope carried on the socket in both directions.
#[derive(Debug, Deserialize, Serialize)]
pub struct Envelope {
    pub event: String,
    pub data: serde_json::Value,
}

impl Envelope {
    /// Decode an inbound envelope into a hub event.
    pub fn into_event(self) -> anyhow::Result<HubEvent> {
        let event = match self.event.as_str() {
            "strategies" => HubEvent::StrategyList(serde_json::from_value(self.data)?),
            "buy_signal" => HubEvent::Buy(serde_json::from_value(self.data)?),
            "sell_signal" => HubEvent::Sell(serde_json::from_value(self.data)?),
            "close_signal" => HubEvent::Close(serde_json::from_value(self.data)?),
            "stop_signal" => HubEvent::Stop(serde_json::from_value(self.data)?),
            other => anyhow::bail!("unknown hub event {other}"),
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_buy_signal_envelope_decodes() {
        let raw = serde_json::json!({
            "event": "buy_signal",
            "data": {
                "strategyId": "s1",
                "strategyName": "momentum",
                "symbol": "ETHBTC",
                "entryType": "enter",
                "positionType": "long",
                "price": "0.05",
                "timestamp": "2024-01-01T00:00:00Z"
            }
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        match envelope.into_event().unwrap() {
            HubEvent::Buy(signal) => {
                assert_eq!(signal.symbol, "ETHBTC");
                assert_eq!(signal.price, Some(dec!(0.05)));
                assert_eq!(signal.entry_type, Some(crate::model::EntryType::Enter));
            }
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_close_signal_without_position_type() {
        let raw = serde_json::json!({
            "event": "close_signal",
            "data": {
                "strategyId": "s1",
                "strategyName": "momentum",
                "symbol": "ETHBTC",
                "timestamp": "2024-01-01T00:00:00Z"
            }
        });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        match envelope.into_event().unwrap() {
            HubEvent::Close(signal) => assert!(signal.position_type.is_none()),
            other => panic!("wrong event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_an_error() {
        let envelope = Envelope {
            event: "mystery".to_string(),
            data: serde_json::Value::Null,
        };
        assert!(envelope.into_event().is_err());
    }
}
