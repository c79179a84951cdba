// =============================================================================
// REST query surface & router — Axum 0.7
// =============================================================================
//
// Read-only endpoints sharing the Formatter and Symbol Registry with the
// WebSocket path. None of them creates hubs or upstream connections: the
// order-book read falls back to a direct REST fetch when no hub is live.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::aggregator::VolumeAggregator;
use crate::api::ws;
use crate::app_state::AppState;
use crate::hub::cache::{clamp_book_limit, validate_rounding, BookParams, OrderBookCache};
use crate::hub::HubKey;
use crate::symbols::RegistryError;
use crate::types::{ErrorCode, StreamKind, Timeframe};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full router: REST under the API prefix, stream upgrades under
/// the WS prefix, CORS from configuration.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state);
    let api = &state.config.api_prefix;
    let ws_prefix = &state.config.ws_prefix;

    Router::new()
        .route(&format!("{api}/health"), get(health))
        .route(&format!("{api}/symbols"), get(symbols))
        .route(
            &format!("{api}/liquidation-volume/:symbol/:timeframe"),
            get(liquidation_volume),
        )
        .route(&format!("{api}/orderbook/:symbol"), get(orderbook))
        .route(&format!("{ws_prefix}/orderbook/:symbol"), get(ws::orderbook))
        .route(
            &format!("{ws_prefix}/candles/:symbol/:timeframe"),
            get(ws::candles),
        )
        .route(&format!("{ws_prefix}/trades/:symbol"), get(ws::trades))
        .route(
            &format!("{ws_prefix}/liquidations/:symbol"),
            get(ws::liquidations),
        )
        .route(&format!("{ws_prefix}/ticker/:symbol"), get(ws::ticker))
        .layer(cors)
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    if state.config.cors_any() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();
    CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// 4xx/5xx body shape shared by every endpoint.
fn error_response(code: ErrorCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(serde_json::json!({
            "error": { "type": code.as_str(), "message": message.into() }
        })),
    )
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptimeSeconds": state.start_time.elapsed().as_secs(),
        "hubs": state.hubs.len(),
        "symbolServiceDegraded": state.symbols.degraded(),
        "serverTime": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// GET /symbols
// =============================================================================

async fn symbols(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let list = state.symbols.list_symbols().await;
    if list.is_empty() && state.symbols.degraded() {
        return error_response(
            ErrorCode::UpstreamUnavailable,
            "symbol service unavailable",
        )
        .into_response();
    }
    Json(serde_json::json!({ "symbols": list })).into_response()
}

// =============================================================================
// GET /liquidation-volume/{symbol}/{timeframe}?start&end
// =============================================================================

#[derive(Debug, Deserialize)]
struct VolumeRangeQuery {
    start: Option<i64>,
    end: Option<i64>,
}

async fn liquidation_volume(
    Path((symbol, timeframe)): Path<(String, String)>,
    Query(query): Query<VolumeRangeQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(tf) = Timeframe::parse(&timeframe) else {
        return error_response(
            ErrorCode::InvalidTimeframe,
            format!("timeframe '{timeframe}' is not supported"),
        )
        .into_response();
    };
    let meta = match state.symbols.metadata(&symbol).await {
        Ok(meta) => meta,
        Err(e) => return registry_error_response(e).into_response(),
    };

    let end_ms = query.end.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
    let start_ms = query.start.unwrap_or(end_ms - tf.ms() * 100);
    if start_ms > end_ms {
        return error_response(ErrorCode::BadRequest, "start is after end").into_response();
    }

    let events = match state
        .history
        .liquidations_range(&meta.exchange_id, start_ms, end_ms)
        .await
    {
        Ok(events) => events,
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "liquidation range fetch failed");
            return error_response(
                ErrorCode::UpstreamUnavailable,
                "liquidation history unavailable",
            )
            .into_response();
        }
    };

    let mut aggregator = VolumeAggregator::new(tf);
    aggregator.seed(&events);
    let buckets = aggregator.range(start_ms, end_ms);

    Json(serde_json::json!({
        "symbol": meta.display_id,
        "timeframe": tf.as_str(),
        "buckets": buckets,
    }))
    .into_response()
}

// =============================================================================
// GET /orderbook/{symbol}?limit
// =============================================================================

#[derive(Debug, Deserialize)]
struct OrderBookReadQuery {
    limit: Option<usize>,
    rounding: Option<f64>,
}

async fn orderbook(
    Path(symbol): Path<String>,
    Query(query): Query<OrderBookReadQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let meta = match state.symbols.metadata(&symbol).await {
        Ok(meta) => meta,
        Err(e) => return registry_error_response(e).into_response(),
    };

    let params = BookParams {
        limit: clamp_book_limit(query.limit.unwrap_or(100), state.config.max_orderbook_limit),
        rounding: validate_rounding(query.rounding, &meta),
    };

    // Serve from a live hub's cache when one exists; otherwise fall back to a
    // one-shot REST fetch. Never creates a hub.
    let key = HubKey::new(meta.display_id.clone(), StreamKind::OrderBook, None);
    if let Some(hub) = state.hubs.get(&key) {
        if let Some(view) = hub.book_view(&params) {
            return Json(view).into_response();
        }
    }

    match state.history.depth(&meta.exchange_id, params.limit).await {
        Ok(snapshot) => {
            let mut cache = OrderBookCache::default();
            cache.replace(snapshot);
            Json(cache.view(&meta, &params)).into_response()
        }
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "order book fetch failed");
            error_response(ErrorCode::UpstreamUnavailable, "order book unavailable")
                .into_response()
        }
    }
}

fn registry_error_response(error: RegistryError) -> (StatusCode, Json<serde_json::Value>) {
    match error {
        RegistryError::UnknownSymbol(id) => {
            error_response(ErrorCode::UnknownSymbol, format!("unknown symbol: {id}"))
        }
        RegistryError::ServiceUnavailable => {
            error_response(ErrorCode::UpstreamUnavailable, "symbol service unavailable")
        }
    }
}
