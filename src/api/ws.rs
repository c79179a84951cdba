// =============================================================================
// WebSocket dispatch — parse, validate, attach
// =============================================================================
//
// One upgrade handler per stream kind. Parameters are validated before the
// session starts; an unknown symbol or timeframe upgrades the socket only to
// deliver a machine-readable error frame and close.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::debug;

use crate::api::session::{self, SessionConfig};
use crate::app_state::AppState;
use crate::hub::cache::{clamp_book_limit, validate_rounding, BookParams};
use crate::hub::HubKey;
use crate::symbols::{RegistryError, SymbolMeta};
use crate::types::{ErrorCode, StreamKind, Timeframe};

// =============================================================================
// Query parameters
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct OrderBookQuery {
    pub limit: Option<usize>,
    pub rounding: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CandlesQuery {
    pub container_width: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct LiquidationsQuery {
    pub timeframe: Option<String>,
}

// =============================================================================
// Symbol validation
// =============================================================================

/// Resolve metadata or describe the rejection to send after upgrade.
async fn lookup_symbol(state: &AppState, symbol: &str) -> Result<SymbolMeta, (ErrorCode, String)> {
    match state.symbols.metadata(symbol).await {
        Ok(meta) => Ok(meta),
        Err(RegistryError::UnknownSymbol(id)) => {
            debug!(symbol = %id, "rejecting subscription for unknown symbol");
            Err((ErrorCode::UnknownSymbol, format!("unknown symbol: {id}")))
        }
        Err(RegistryError::ServiceUnavailable) => Err((
            ErrorCode::UpstreamUnavailable,
            "symbol service unavailable".to_string(),
        )),
    }
}

// =============================================================================
// Upgrade handlers
// =============================================================================

/// GET /ws/orderbook/{symbol}?limit&rounding
pub async fn orderbook(
    ws: WebSocketUpgrade,
    Path(symbol): Path<String>,
    Query(query): Query<OrderBookQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let meta = match lookup_symbol(&state, &symbol).await {
            Ok(meta) => meta,
            Err((code, message)) => return session::reject(socket, code, &message).await,
        };

        let params = BookParams {
            limit: clamp_book_limit(query.limit.unwrap_or(100), state.config.max_orderbook_limit),
            rounding: validate_rounding(query.rounding, &meta),
        };
        let config = SessionConfig {
            key: HubKey::new(meta.display_id.clone(), StreamKind::OrderBook, None),
            meta,
            book_params: Some(params),
            container_width: None,
            volume_key: None,
        };
        session::run(socket, state, config).await;
    })
}

/// GET /ws/candles/{symbol}/{timeframe}?container_width
pub async fn candles(
    ws: WebSocketUpgrade,
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(query): Query<CandlesQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let Some(tf) = Timeframe::parse(&timeframe) else {
            return session::reject(
                socket,
                ErrorCode::InvalidTimeframe,
                &format!("timeframe '{timeframe}' is not supported"),
            )
            .await;
        };
        let meta = match lookup_symbol(&state, &symbol).await {
            Ok(meta) => meta,
            Err((code, message)) => return session::reject(socket, code, &message).await,
        };

        let config = SessionConfig {
            key: HubKey::new(meta.display_id.clone(), StreamKind::Candles, Some(tf)),
            meta,
            book_params: None,
            container_width: query.container_width,
            volume_key: None,
        };
        session::run(socket, state, config).await;
    })
}

/// GET /ws/trades/{symbol}
pub async fn trades(
    ws: WebSocketUpgrade,
    Path(symbol): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let meta = match lookup_symbol(&state, &symbol).await {
            Ok(meta) => meta,
            Err((code, message)) => return session::reject(socket, code, &message).await,
        };

        let config = SessionConfig {
            key: HubKey::new(meta.display_id.clone(), StreamKind::Trades, None),
            meta,
            book_params: None,
            container_width: None,
            volume_key: None,
        };
        session::run(socket, state, config).await;
    })
}

/// GET /ws/liquidations/{symbol}[?timeframe]
///
/// A timeframe opts the socket into liquidation-volume frames alongside the
/// raw order feed.
pub async fn liquidations(
    ws: WebSocketUpgrade,
    Path(symbol): Path<String>,
    Query(query): Query<LiquidationsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let tf = match &query.timeframe {
            Some(raw) => match Timeframe::parse(raw) {
                Some(tf) => Some(tf),
                None => {
                    return session::reject(
                        socket,
                        ErrorCode::InvalidTimeframe,
                        &format!("timeframe '{raw}' is not supported"),
                    )
                    .await;
                }
            },
            None => None,
        };
        let meta = match lookup_symbol(&state, &symbol).await {
            Ok(meta) => meta,
            Err((code, message)) => return session::reject(socket, code, &message).await,
        };

        let config = SessionConfig {
            key: HubKey::new(meta.display_id.clone(), StreamKind::Liquidations, None),
            volume_key: tf.map(|tf| {
                HubKey::new(
                    meta.display_id.clone(),
                    StreamKind::LiquidationVolume,
                    Some(tf),
                )
            }),
            meta,
            book_params: None,
            container_width: None,
        };
        session::run(socket, state, config).await;
    })
}

/// GET /ws/ticker/{symbol}
pub async fn ticker(
    ws: WebSocketUpgrade,
    Path(symbol): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let meta = match lookup_symbol(&state, &symbol).await {
            Ok(meta) => meta,
            Err((code, message)) => return session::reject(socket, code, &message).await,
        };

        let config = SessionConfig {
            key: HubKey::new(meta.display_id.clone(), StreamKind::Ticker, None),
            meta,
            book_params: None,
            container_width: None,
            volume_key: None,
        };
        session::run(socket, state, config).await;
    })
}
