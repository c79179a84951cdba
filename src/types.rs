// =============================================================================
// Shared types used across the marketgate gateway
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Stream kinds
// =============================================================================

/// The data-stream kinds a hub can serve. One hub exists per
/// `(symbol, kind[, timeframe])`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    OrderBook,
    Candles,
    Trades,
    Ticker,
    Liquidations,
    LiquidationVolume,
}

impl StreamKind {
    /// Envelope `type` string for outbound frames.
    pub fn as_type_str(&self) -> &'static str {
        match self {
            Self::OrderBook => "orderbook",
            Self::Candles => "candles",
            Self::Trades => "trades",
            Self::Ticker => "ticker",
            Self::Liquidations => "liquidation_order",
            Self::LiquidationVolume => "liquidation_volume",
        }
    }

    /// Kinds that load a historical backlog before going live.
    pub fn wants_historical(&self) -> bool {
        !matches!(self, Self::Ticker)
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_type_str())
    }
}

// =============================================================================
// Timeframes
// =============================================================================

/// The fixed timeframe allow-list for candle and liquidation-volume streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "8h")]
    H8,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "3d")]
    D3,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1M")]
    Mo1,
}

impl Timeframe {
    pub const ALL: &'static [Timeframe] = &[
        Self::M1,
        Self::M3,
        Self::M5,
        Self::M15,
        Self::M30,
        Self::H1,
        Self::H2,
        Self::H4,
        Self::H6,
        Self::H8,
        Self::H12,
        Self::D1,
        Self::D3,
        Self::W1,
        Self::Mo1,
    ];

    /// Exchange-native interval string (also the wire representation).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M3 => "3m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H2 => "2h",
            Self::H4 => "4h",
            Self::H6 => "6h",
            Self::H8 => "8h",
            Self::H12 => "12h",
            Self::D1 => "1d",
            Self::D3 => "3d",
            Self::W1 => "1w",
            Self::Mo1 => "1M",
        }
    }

    /// Bucket width in milliseconds. The 1M timeframe uses a 30-day width for
    /// bucket alignment purposes.
    pub fn ms(&self) -> i64 {
        const MINUTE: i64 = 60_000;
        const HOUR: i64 = 60 * MINUTE;
        const DAY: i64 = 24 * HOUR;
        match self {
            Self::M1 => MINUTE,
            Self::M3 => 3 * MINUTE,
            Self::M5 => 5 * MINUTE,
            Self::M15 => 15 * MINUTE,
            Self::M30 => 30 * MINUTE,
            Self::H1 => HOUR,
            Self::H2 => 2 * HOUR,
            Self::H4 => 4 * HOUR,
            Self::H6 => 6 * HOUR,
            Self::H8 => 8 * HOUR,
            Self::H12 => 12 * HOUR,
            Self::D1 => DAY,
            Self::D3 => 3 * DAY,
            Self::W1 => 7 * DAY,
            Self::Mo1 => 30 * DAY,
        }
    }

    /// Parse from the wire string; `None` when the value is not in the
    /// allow-list.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|tf| tf.as_str() == s)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Canonical market-data records (raw, unformatted)
// =============================================================================

/// Taker side of a public trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

/// Side of a forced-liquidation order. SELL means a long was liquidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiquidationSide {
    Buy,
    Sell,
}

impl LiquidationSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

/// A full order-book snapshot as delivered by the exchange. Replaced whole on
/// every upstream frame; per-session views are materialised from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BookSnapshot {
    pub timestamp_ms: i64,
    /// (price, amount), descending by price.
    pub bids: Vec<(f64, f64)>,
    /// (price, amount), ascending by price.
    pub asks: Vec<(f64, f64)>,
}

/// A single OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub open_time_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

/// A public trade.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub trade_id: i64,
    pub price: f64,
    pub amount: f64,
    pub side: TradeSide,
    pub timestamp_ms: i64,
}

/// A forced-liquidation order.
#[derive(Debug, Clone, PartialEq)]
pub struct LiquidationEvent {
    pub side: LiquidationSide,
    pub quantity: f64,
    pub avg_price: f64,
    /// quantity * avg_price, in the quote currency.
    pub amount_usdt: f64,
    pub timestamp_ms: i64,
}

impl LiquidationEvent {
    /// Dedup key used to suppress overlap between the historical backlog and
    /// the live feed.
    pub fn dedup_key(&self) -> (i64, i64, LiquidationSide) {
        (self.timestamp_ms, self.amount_usdt.round() as i64, self.side)
    }
}

/// 24h rolling ticker statistics.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TickerUpdate {
    pub last_price: f64,
    pub price_change_percent: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    pub timestamp_ms: i64,
}

// =============================================================================
// Upstream events
// =============================================================================

/// A decoded frame from the upstream exchange connection, normalised into the
/// canonical record types above.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Book(BookSnapshot),
    Trade(TradeRecord),
    Candle(Candle),
    Ticker(TickerUpdate),
    Liquidation(LiquidationEvent),
    /// Terminal: the connection died. The hub owns reconnection.
    Disconnected { reason: String },
}

// =============================================================================
// Outbound envelope & error frames
// =============================================================================

/// The JSON envelope every downstream data frame is wrapped in.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub symbol: String,
    pub timeframe: Option<&'static str>,
    /// True only for the first frame of a new attach (or a forced re-sync).
    pub initial: bool,
    /// True for per-event live updates the receiver should patch in rather
    /// than replace with.
    pub is_update: bool,
    pub data: serde_json::Value,
    /// ISO 8601 send time.
    pub timestamp: String,
}

impl Envelope {
    pub fn new(
        kind: StreamKind,
        symbol: &str,
        timeframe: Option<Timeframe>,
        initial: bool,
        is_update: bool,
        data: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.as_type_str(),
            symbol: symbol.to_string(),
            timeframe: timeframe.map(|tf| tf.as_str()),
            initial,
            is_update,
            data,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Machine-readable error codes surfaced to downstream clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    UnknownSymbol,
    InvalidTimeframe,
    SlowConsumer,
    UpstreamUnavailable,
    BadRequest,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownSymbol => "UnknownSymbol",
            Self::InvalidTimeframe => "InvalidTimeframe",
            Self::SlowConsumer => "SlowConsumer",
            Self::UpstreamUnavailable => "UpstreamUnavailable",
            Self::BadRequest => "BadRequest",
            Self::Internal => "Internal",
        }
    }

    /// HTTP status for REST surfaces.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::UnknownSymbol | Self::InvalidTimeframe | Self::BadRequest => 400,
            Self::SlowConsumer => 400,
            Self::UpstreamUnavailable => 502,
            Self::Internal => 500,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Build the `{"type":"error",...}` frame sent before an application close.
pub fn error_frame(code: ErrorCode, message: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "error",
        "code": code.as_str(),
        "message": message,
    })
}

/// Reply to a client `{"type":"ping"}`.
pub fn pong_frame() -> serde_json::Value {
    serde_json::json!({ "type": "pong" })
}

// =============================================================================
// Inbound control messages
// =============================================================================

/// Control messages a downstream client may send over an open socket.
/// Unknown message types are logged and ignored by the session.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Ping,
    UpdateParams {
        limit: Option<usize>,
        rounding: Option<f64>,
    },
    ChangeTimeframe {
        timeframe: String,
    },
}

// =============================================================================
// Tests
// =============================================================================
