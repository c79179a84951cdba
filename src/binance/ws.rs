// =============================================================================
// Binance Futures WebSocket feed — one connection per (symbol, kind)
// =============================================================================
//
// The feed decodes raw exchange frames into the canonical UpstreamEvent types
// and never reconnects on its own: on any IO error it emits a terminal
// Disconnected event and ends the stream. Reconnection policy belongs to the
// hub that owns the connection.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::binance::rest::{parse_levels, parse_str_f64};
use crate::types::{
    BookSnapshot, Candle, LiquidationEvent, LiquidationSide, StreamKind, TickerUpdate, Timeframe,
    TradeRecord, TradeSide, UpstreamEvent,
};

/// Upstream connect-attempt timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// If no frame arrives for this long the connection is considered dead.
const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Decoded events buffered between the reader task and the hub.
const EVENT_BUFFER: usize = 512;

// =============================================================================
// Feed seam
// =============================================================================

/// An open upstream connection. Events end with a terminal `Disconnected`.
pub struct FeedConnection {
    events: mpsc::Receiver<UpstreamEvent>,
    reader: Option<JoinHandle<()>>,
}

impl FeedConnection {
    pub fn new(events: mpsc::Receiver<UpstreamEvent>, reader: Option<JoinHandle<()>>) -> Self {
        Self { events, reader }
    }

    /// Next decoded event; `None` after the stream has fully drained.
    pub async fn next(&mut self) -> Option<UpstreamEvent> {
        self.events.recv().await
    }

    /// Idempotent close; safe to call while a reconnect is in flight.
    pub fn close(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.abort();
        }
        self.events.close();
    }
}

impl Drop for FeedConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// The upstream-exchange seam. Production uses [`BinanceFeed`]; tests inject
/// synthetic feeds.
#[async_trait]
pub trait UpstreamFeed: Send + Sync {
    async fn open(
        &self,
        symbol: &str,
        kind: StreamKind,
        timeframe: Option<Timeframe>,
    ) -> Result<FeedConnection>;
}

// =============================================================================
// Binance implementation
// =============================================================================

/// Binance futures single-stream WebSocket adapter.
pub struct BinanceFeed {
    ws_base_url: String,
}

impl BinanceFeed {
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into(),
        }
    }

    /// Exchange stream name for a subscription.
    fn stream_name(symbol: &str, kind: StreamKind, timeframe: Option<Timeframe>) -> String {
        let lower = symbol.to_lowercase();
        match kind {
            StreamKind::OrderBook => format!("{lower}@depth20@100ms"),
            StreamKind::Trades => format!("{lower}@aggTrade"),
            StreamKind::Candles => {
                let tf = timeframe.map(|tf| tf.as_str()).unwrap_or("1m");
                format!("{lower}@kline_{tf}")
            }
            StreamKind::Ticker => format!("{lower}@ticker"),
            StreamKind::Liquidations | StreamKind::LiquidationVolume => {
                format!("{lower}@forceOrder")
            }
        }
    }
}

#[async_trait]
impl UpstreamFeed for BinanceFeed {
    async fn open(
        &self,
        symbol: &str,
        kind: StreamKind,
        timeframe: Option<Timeframe>,
    ) -> Result<FeedConnection> {
        let stream = Self::stream_name(symbol, kind, timeframe);
        let url = format!("{}/{}", self.ws_base_url, stream);
        info!(url = %url, symbol = %symbol, kind = %kind, "connecting upstream WebSocket");

        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url))
            .await
            .context("upstream connect attempt timed out")?
            .context("failed to connect upstream WebSocket")?;

        info!(symbol = %symbol, kind = %kind, "upstream WebSocket connected");
        let (_write, mut read) = ws_stream.split();

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let sym = symbol.to_string();

        let reader = tokio::spawn(async move {
            loop {
                let msg = match tokio::time::timeout(READ_IDLE_TIMEOUT, read.next()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        let _ = tx
                            .send(UpstreamEvent::Disconnected {
                                reason: "read idle timeout".to_string(),
                            })
                            .await;
                        return;
                    }
                };

                match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        match decode_frame(kind, &text) {
                            Ok(Some(event)) => {
                                if tx.send(event).await.is_err() {
                                    return; // hub side closed
                                }
                            }
                            Ok(None) => {} // keepalive / irrelevant frame
                            Err(e) => {
                                warn!(symbol = %sym, kind = %kind, error = %e, "failed to decode upstream frame");
                            }
                        }
                    }
                    // tungstenite answers pings automatically.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(symbol = %sym, kind = %kind, error = %e, "upstream read error");
                        let _ = tx
                            .send(UpstreamEvent::Disconnected {
                                reason: e.to_string(),
                            })
                            .await;
                        return;
                    }
                    None => {
                        let _ = tx
                            .send(UpstreamEvent::Disconnected {
                                reason: "stream ended".to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(FeedConnection::new(rx, Some(reader)))
    }
}

// =============================================================================
// Frame decoding
// =============================================================================

/// Decode one text frame for the given stream kind. `Ok(None)` means the
/// frame is valid but carries nothing for the cache (e.g. subscription acks).
fn decode_frame(kind: StreamKind, text: &str) -> Result<Option<UpstreamEvent>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse upstream JSON")?;

    // Combined-stream envelopes wrap the payload in `data`.
    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    // Subscription confirmations carry an `id` and no event type.
    if data.get("e").is_none() && data.get("bids").is_none() && data.get("b").is_none() {
        return Ok(None);
    }

    let event = match kind {
        StreamKind::OrderBook => UpstreamEvent::Book(decode_depth(data)?),
        StreamKind::Trades => UpstreamEvent::Trade(decode_agg_trade(data)?),
        StreamKind::Candles => UpstreamEvent::Candle(decode_kline(data)?),
        StreamKind::Ticker => UpstreamEvent::Ticker(decode_ticker(data)?),
        StreamKind::Liquidations | StreamKind::LiquidationVolume => {
            UpstreamEvent::Liquidation(decode_force_order(data)?)
        }
    };
    Ok(Some(event))
}

/// Partial-depth snapshot. Futures frames use `b`/`a`, spot-style frames use
/// `bids`/`asks`; both are 20-level full replacements.
fn decode_depth(data: &serde_json::Value) -> Result<BookSnapshot> {
    let (bids_val, asks_val) = if data.get("bids").is_some() {
        (&data["bids"], &data["asks"])
    } else {
        (&data["b"], &data["a"])
    };

    let bids = parse_levels(bids_val).context("missing depth bids")?;
    let asks = parse_levels(asks_val).context("missing depth asks")?;

    let timestamp_ms = data["T"]
        .as_i64()
        .or_else(|| data["E"].as_i64())
        .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    Ok(BookSnapshot {
        timestamp_ms,
        bids,
        asks,
    })
}

/// ```json
/// { "e": "aggTrade", "a": 12345, "p": "37000.0", "q": "0.1", "T": 1699..., "m": true }
/// ```
fn decode_agg_trade(data: &serde_json::Value) -> Result<TradeRecord> {
    let trade_id = data["a"].as_i64().context("missing field a")?;
    let price = parse_str_f64(&data["p"]).context("missing field p")?;
    let amount = parse_str_f64(&data["q"]).context("missing field q")?;
    let timestamp_ms = data["T"].as_i64().context("missing field T")?;
    let buyer_is_maker = data["m"].as_bool().context("missing field m")?;

    Ok(TradeRecord {
        trade_id,
        price,
        amount,
        // Buyer as maker means the taker sold.
        side: if buyer_is_maker {
            TradeSide::Sell
        } else {
            TradeSide::Buy
        },
        timestamp_ms,
    })
}

/// ```json
/// { "e": "kline", "k": { "t": ..., "o": "..", "h": "..", "l": "..", "c": "..", "v": "..", "x": false } }
/// ```
fn decode_kline(data: &serde_json::Value) -> Result<Candle> {
    let k = &data["k"];
    Ok(Candle {
        open_time_ms: k["t"].as_i64().context("missing field k.t")?,
        open: parse_str_f64(&k["o"]).context("missing field k.o")?,
        high: parse_str_f64(&k["h"]).context("missing field k.h")?,
        low: parse_str_f64(&k["l"]).context("missing field k.l")?,
        close: parse_str_f64(&k["c"]).context("missing field k.c")?,
        volume: parse_str_f64(&k["v"]).context("missing field k.v")?,
        is_closed: k["x"].as_bool().context("missing field k.x")?,
    })
}

/// ```json
/// { "e": "24hrTicker", "c": "..", "P": "..", "h": "..", "l": "..", "q": "..", "E": ... }
/// ```
fn decode_ticker(data: &serde_json::Value) -> Result<TickerUpdate> {
    Ok(TickerUpdate {
        last_price: parse_str_f64(&data["c"]).context("missing field c")?,
        price_change_percent: parse_str_f64(&data["P"]).context("missing field P")?,
        high_24h: parse_str_f64(&data["h"]).context("missing field h")?,
        low_24h: parse_str_f64(&data["l"]).context("missing field l")?,
        volume_24h: parse_str_f64(&data["q"]).context("missing field q")?,
        timestamp_ms: data["E"]
            .as_i64()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
    })
}

/// ```json
/// { "e": "forceOrder", "o": { "s": "BTCUSDT", "S": "SELL", "q": "0.014", "ap": "9910", "T": ... } }
/// ```
fn decode_force_order(data: &serde_json::Value) -> Result<LiquidationEvent> {
    let o = &data["o"];
    let side = match o["S"].as_str().context("missing field o.S")? {
        "BUY" => LiquidationSide::Buy,
        "SELL" => LiquidationSide::Sell,
        other => anyhow::bail!("unknown liquidation side: {other}"),
    };
    let quantity = parse_str_f64(&o["q"]).context("missing field o.q")?;
    let avg_price = parse_str_f64(&o["ap"]).context("missing field o.ap")?;

    Ok(LiquidationEvent {
        side,
        quantity,
        avg_price,
        amount_usdt: quantity * avg_price,
        timestamp_ms: o["T"].as_i64().context("missing field o.T")?,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names() {
        assert_eq!(
            BinanceFeed::stream_name("BTCUSDT", StreamKind::OrderBook, None),
            "btcusdt@depth20@100ms"
        );
        assert_eq!(
            BinanceFeed::stream_name("ETHUSDT", StreamKind::Candles, Some(Timeframe::M5)),
            "ethusdt@kline_5m"
        );
        assert_eq!(
            BinanceFeed::stream_name("BTCUSDT", StreamKind::Liquidations, None),
            "btcusdt@forceOrder"
        );
        assert_eq!(
            BinanceFeed::stream_name("BTCUSDT", StreamKind::Ticker, None),
            "btcusdt@ticker"
        );
    }

    #[test]
    fn decode_futures_depth_frame() {
        let text = r#"{
            "e": "depthUpdate", "E": 1700000000100, "T": 1700000000090,
            "s": "BTCUSDT",
            "b": [["50000.0", "1.0"], ["49999.0", "2.0"]],
            "a": [["50001.0", "3.0"]]
        }"#;
        let event = decode_frame(StreamKind::OrderBook, text).unwrap().unwrap();
        match event {
            UpstreamEvent::Book(book) => {
                assert_eq!(book.timestamp_ms, 1700000000090);
                assert_eq!(book.bids.len(), 2);
                assert_eq!(book.asks, vec![(50001.0, 3.0)]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decode_spot_style_depth_frame() {
        let text = r#"{
            "lastUpdateId": 1,
            "bids": [["100.0", "1.0"]],
            "asks": [["101.0", "1.0"]]
        }"#;
        let event = decode_frame(StreamKind::OrderBook, text).unwrap().unwrap();
        assert!(matches!(event, UpstreamEvent::Book(_)));
    }

    #[test]
    fn decode_agg_trade_frame() {
        let text = r#"{ "e": "aggTrade", "a": 7, "p": "50000.0", "q": "0.01", "T": 10, "m": false }"#;
        let event = decode_frame(StreamKind::Trades, text).unwrap().unwrap();
        match event {
            UpstreamEvent::Trade(t) => {
                assert_eq!(t.trade_id, 7);
                assert_eq!(t.side, TradeSide::Buy);
                assert_eq!(t.timestamp_ms, 10);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decode_kline_frame() {
        let text = r#"{
            "e": "kline", "s": "BTCUSDT",
            "k": { "t": 1700000000000, "i": "1m",
                   "o": "37000.0", "h": "37050.0", "l": "36990.0", "c": "37020.0",
                   "v": "123.4", "x": true }
        }"#;
        let event = decode_frame(StreamKind::Candles, text).unwrap().unwrap();
        match event {
            UpstreamEvent::Candle(c) => {
                assert_eq!(c.open_time_ms, 1_700_000_000_000);
                assert!(c.is_closed);
                assert_eq!(c.close, 37020.0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn decode_force_order_frame() {
        let text = r#"{
            "e": "forceOrder",
            "o": { "s": "ETHUSDT", "S": "SELL", "q": "2.0", "ap": "2000.0", "T": 90000 }
        }"#;
        let event = decode_frame(StreamKind::Liquidations, text).unwrap().unwrap();
        match event {
            UpstreamEvent::Liquidation(liq) => {
                assert_eq!(liq.side, LiquidationSide::Sell);
                assert_eq!(liq.amount_usdt, 4000.0);
                assert_eq!(liq.timestamp_ms, 90_000);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn subscription_ack_is_ignored() {
        let text = r#"{ "result": null, "id": 1 }"#;
        assert!(decode_frame(StreamKind::Trades, text).unwrap().is_none());
    }
}
