//! Operator and diagnostics HTTP surface.
//!
//! Read-only views over the meta-data plus the write operations an operator
//! needs: stop/start strategies, HODL/release/close/delete trades, reset the
//! PnL book or the virtual ledger, and trigger a fee-token top-up. Protected
//! by an optional password.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::info;

use crate::engine::Engine;
use crate::model::{TradingMode, WalletType};
use crate::notify::RingBufferSink;
use crate::store::LogTable;

const PAGE_SIZE: u32 = 100;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub ring: Arc<RingBufferSink>,
}

/// Build the operator router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/log", get(log_view))
        .route("/trans", get(trans_view))
        .route("/pnl", get(pnl_view))
        .route("/strategies", get(strategies_view))
        .route("/trades", get(trades_view))
        .route("/virtual", get(virtual_view))
        .route("/graph.html", get(graph_view))
        .with_state(state)
}

/// Serve the router until the process exits.
pub async fn serve(state: AppState, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "Operator surface listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

type Params = Query<HashMap<String, String>>;

fn authorized(state: &AppState, params: &HashMap<String, String>) -> bool {
    let expected = &state.engine.config.ops.password;
    expected.is_empty() || params.get("password").map(|p| p == expected).unwrap_or(false)
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, "password required").into_response()
}

fn conflict(detail: impl ToString) -> Response {
    (StatusCode::CONFLICT, detail.to_string()).into_response()
}

async fn log_view(State(state): State<AppState>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    match params.get("db").and_then(|p| p.parse::<u32>().ok()) {
        Some(page) => match state.engine.store.read_page(LogTable::Log, page, PAGE_SIZE) {
            Ok(lines) => lines.join("\n").into_response(),
            Err(e) => conflict(e),
        },
        None => state.ring.recent().join("\n").into_response(),
    }
}

async fn trans_view(State(state): State<AppState>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    match params.get("db").and_then(|p| p.parse::<u32>().ok()) {
        Some(page) => match state
            .engine
            .store
            .read_page(LogTable::Transactions, page, PAGE_SIZE)
        {
            Ok(lines) => lines.join("\n").into_response(),
            Err(e) => conflict(e),
        },
        None => {
            let meta = state.engine.meta.lock().await;
            Json(meta.transactions.iter().cloned().collect::<Vec<_>>()).into_response()
        }
    }
}

/// "ASSET:mode" / "ASSET:wallet" selector used by several operations.
fn split_selector(raw: &str) -> Option<(String, String)> {
    let (asset, tail) = raw.split_once(':')?;
    Some((asset.to_uppercase(), tail.to_lowercase()))
}

async fn pnl_view(State(state): State<AppState>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }

    if let Some(selector) = params.get("reset") {
        let Some((asset, mode)) = split_selector(selector) else {
            return conflict("expected reset=ASSET:mode");
        };
        let Ok(mode) = serde_json::from_value::<TradingMode>(json!(mode)) else {
            return conflict("unknown trading mode");
        };
        return if state.engine.reset_pnl(&asset, mode).await {
            format!("PnL book for {asset} ({mode}) reset").into_response()
        } else {
            conflict("no such book")
        };
    }

    if let Some(selector) = params.get("topup") {
        let Some((asset, wallet)) = split_selector(selector) else {
            return conflict("expected topup=ASSET:wallet");
        };
        let Ok(wallet) = serde_json::from_value::<WalletType>(json!(wallet)) else {
            return conflict("unknown wallet");
        };
        return match state.engine.top_up_fee_token(&asset, wallet).await {
            Ok(()) => "fee token topped up".into_response(),
            Err(e) => conflict(e),
        };
    }

    let meta = state.engine.meta.lock().await;
    Json(&meta.balance_history).into_response()
}

async fn strategies_view(State(state): State<AppState>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }

    if params.contains_key("public") {
        let meta = state.engine.meta.lock().await;
        return Json(meta.public_strategies.values().cloned().collect::<Vec<_>>())
            .into_response();
    }
    for (key, stopped, outcome) in [("stop", true, "stopped"), ("start", false, "started")] {
        if let Some(id) = params.get(key) {
            return match state.engine.set_strategy_stopped(id, stopped).await {
                Ok(()) => format!("strategy {id} {outcome}").into_response(),
                Err(e) => conflict(e),
            };
        }
    }

    let meta = state.engine.meta.lock().await;
    Json(meta.strategies.values().cloned().collect::<Vec<_>>()).into_response()
}

async fn trades_view(State(state): State<AppState>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }

    if let Some(id) = params.get("hodl") {
        return act(state.engine.set_trade_hodl(id, true).await, "held");
    }
    if let Some(id) = params.get("release") {
        return act(state.engine.set_trade_hodl(id, false).await, "released");
    }
    if let Some(id) = params.get("stop") {
        return act(state.engine.set_trade_stopped(id, true).await, "stopped");
    }
    if let Some(id) = params.get("start") {
        return act(state.engine.set_trade_stopped(id, false).await, "restarted");
    }
    if let Some(id) = params.get("close") {
        return act(state.engine.close_trade_manual(id).await, "closing");
    }
    if let Some(id) = params.get("delete") {
        return act(state.engine.delete_trade(id).await, "deleted");
    }

    let meta = state.engine.meta.lock().await;
    Json(meta.trades_open.clone()).into_response()
}

fn act(result: Result<(), crate::error::RejectionKind>, what: &str) -> Response {
    match result {
        Ok(()) => format!("trade {what}").into_response(),
        Err(e) => conflict(e),
    }
}

async fn virtual_view(State(state): State<AppState>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }

    if let Some(raw) = params.get("reset") {
        let funds = if raw == "true" {
            None
        } else {
            match Decimal::from_str(raw) {
                Ok(funds) if funds > Decimal::ZERO => Some(funds),
                _ => return conflict("expected reset=true or a positive amount"),
            }
        };
        state.engine.reset_virtual(funds).await;
        return "virtual balances reseeded".into_response();
    }

    let meta = state.engine.meta.lock().await;
    Json(&meta.virtual_balances).into_response()
}

async fn graph_view(State(state): State<AppState>, Query(params): Params) -> Response {
    if !authorized(&state, &params) {
        return forbidden();
    }
    let Some((asset, mode)) = params.get("summary").and_then(|s| split_selector(s)) else {
        return conflict("expected summary=ASSET:mode");
    };
    let Ok(mode) = serde_json::from_value::<TradingMode>(json!(mode)) else {
        return conflict("unknown trading mode");
    };

    let meta = state.engine.meta.lock().await;
    let Some(rows) = meta.balance_history.book(mode, &asset) else {
        return conflict("no such book");
    };

    let max = rows
        .iter()
        .map(|r| r.close_balance)
        .max()
        .unwrap_or(Decimal::ONE)
        .max(Decimal::ONE);
    let points: Vec<String> = rows
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let x = if rows.len() > 1 {
                i as f64 * 800.0 / (rows.len() - 1) as f64
            } else {
                0.0
            };
            let ratio = (r.close_balance / max).to_f64().unwrap_or(0.0);
            let y = 280.0 - ratio * 260.0;
            format!("{x:.1},{y:.1}")
        })
        .collect();

    Html(format!(
        r##"<!doctype html>
<html><head><title>{asset} {mode}</title></head>
<body style="font-family:monospace">
<h3>{asset} close balance ({mode}, {} days)</h3>
<svg viewBox="0 0 800 300" width="800" height="300">
<rect width="800" height="300" fill="#fafafa"/>
<polyline fill="none" stroke="#2962ff" stroke-width="2" points="{}"/>
</svg>
</body></html>"##,
        rows.len(),
        points.join(" ")
    ))
    .into_response()
}
