//! Exit pipeline: price refresh, closing-set bookkeeping, task enqueue.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::execute::Job;
use super::Engine;
use crate::model::{PositionType, Signal, SourceType};
use crate::store::SnapshotKey;

/// Schedule the close of an existing trade for a validated exit signal.
///
/// The trade enters the closing set before the task is queued, so sizing for
/// overlapping entries treats its locked cost as released.
pub(crate) async fn close_trade_open(
    engine: &Arc<Engine>,
    signal: &Signal,
    position: PositionType,
    source: SourceType,
) {
    // An exit without a price falls back to the live book.
    let exit_price = match signal.price {
        Some(price) if price > Decimal::ZERO => Some(price),
        _ => match engine.gateway.fetch_ticker(&signal.symbol).await {
            Ok(ticker) => Some(match position {
                PositionType::Long => ticker.bid,
                PositionType::Short => ticker.ask,
            }),
            Err(e) => {
                debug!(error = %e, symbol = %signal.symbol, "Ticker unavailable for exit price");
                None
            }
        },
    };

    let (trade_id, ack_channel) = {
        let mut meta = engine.meta.lock().await;
        let Some(trade) = meta.find_trade_mut(&signal.strategy_id, &signal.symbol, position)
        else {
            debug!(symbol = %signal.symbol, "Trade vanished before its exit was scheduled");
            return;
        };

        match position {
            PositionType::Long => {
                if let Some(price) = exit_price {
                    trade.price_sell = Some(price);
                    trade.cost = trade.quantity * price;
                }
                trade.time_sell = Some(Utc::now());
            }
            PositionType::Short => {
                if let Some(price) = exit_price {
                    trade.price_buy = Some(price);
                    trade.cost = trade.quantity * price;
                }
                trade.time_buy = Some(Utc::now());
            }
        }
        trade.time_updated = Utc::now();

        let trade_id = trade.id.clone();
        // The exit order is the mirror of the entry side.
        let ack_channel =
            crate::hub::ack_channel(position == PositionType::Short).to_string();

        meta.trades_closing.insert(trade_id.clone());
        engine.store.mark_dirty(SnapshotKey::TradesOpen);

        info!(
            trade = %trade_id,
            symbol = %signal.symbol,
            position = %position,
            price = %exit_price.unwrap_or(Decimal::ZERO),
            "Scheduling close"
        );
        (trade_id, ack_channel)
    };

    let job = Job::Close {
        trade_id: trade_id.clone(),
        source,
        signal_time: signal.timestamp,
        ack_channel,
    };
    let engine_for_task = Arc::clone(engine);
    engine.queue.push(format!("close {trade_id}"), async move {
        super::execute::run(engine_for_task, job).await;
    });
}
