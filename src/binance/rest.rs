// =============================================================================
// Binance Futures REST client — public market-data endpoints
// =============================================================================
//
// Only unsigned endpoints are used. When an API key is configured it is sent
// as the X-MBX-APIKEY header for the higher request-weight quota; no request
// is ever signed.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::types::{Candle, TradeRecord, TradeSide};

/// Timeout for candle/trade fetches.
const FAST_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for the heavier exchange-info and ticker sweeps.
const INFO_TIMEOUT: Duration = Duration::from_secs(15);

/// Binance futures REST client over a shared connection pool.
#[derive(Clone)]
pub struct BinanceRest {
    base_url: String,
    client: reqwest::Client,
}

// =============================================================================
// Response shapes
// =============================================================================

/// One tradable instrument from GET /fapi/v1/exchangeInfo.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSymbol {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeSymbol>,
}

/// 24h rolling statistics from GET /fapi/v1/ticker/24hr.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker24h {
    pub symbol: String,
    #[serde(deserialize_with = "de_str_f64")]
    pub last_price: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub price_change_percent: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub high_price: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub low_price: f64,
    #[serde(deserialize_with = "de_str_f64")]
    pub quote_volume: f64,
}

/// One aggregated trade from GET /fapi/v1/aggTrades.
#[derive(Debug, Deserialize)]
struct AggTrade {
    #[serde(rename = "a")]
    id: i64,
    #[serde(rename = "p", deserialize_with = "de_str_f64")]
    price: f64,
    #[serde(rename = "q", deserialize_with = "de_str_f64")]
    quantity: f64,
    #[serde(rename = "T")]
    timestamp_ms: i64,
    /// True when the buyer was the maker, i.e. the taker sold.
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

/// Binance sends most numeric fields as JSON strings.
fn de_str_f64<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

// =============================================================================
// Client
// =============================================================================

impl BinanceRest {
    /// Create the client. `api_key` may be empty for unauthenticated access.
    pub fn new(base_url: impl Into<String>, api_key: &str) -> Self {
        let mut default_headers = HeaderMap::new();
        if !api_key.is_empty() {
            if let Ok(val) = HeaderValue::from_str(api_key) {
                default_headers.insert("X-MBX-APIKEY", val);
            }
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(INFO_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    async fn get_json(&self, url: &str, timeout: Duration) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("GET {url} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))?;

        if !status.is_success() {
            anyhow::bail!("GET {url} returned {status}: {body}");
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Exchange info & tickers
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/exchangeInfo — the full instrument list.
    #[instrument(skip(self), name = "binance::exchange_info")]
    pub async fn exchange_info(&self) -> Result<Vec<ExchangeSymbol>> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let body = self.get_json(&url, INFO_TIMEOUT).await?;

        let info: ExchangeInfo =
            serde_json::from_value(body).context("failed to decode exchangeInfo response")?;

        debug!(count = info.symbols.len(), "exchange info fetched");
        Ok(info.symbols)
    }

    /// GET /fapi/v1/ticker/24hr — 24h statistics for every instrument.
    #[instrument(skip(self), name = "binance::tickers_24h")]
    pub async fn tickers_24h(&self) -> Result<Vec<Ticker24h>> {
        let url = format!("{}/fapi/v1/ticker/24hr", self.base_url);
        let body = self.get_json(&url, INFO_TIMEOUT).await?;

        let raw = body.as_array().context("ticker response is not an array")?;

        // Instruments that fail to decode (delisted, zero-volume oddities) are
        // skipped rather than failing the whole sweep.
        let mut tickers = Vec::with_capacity(raw.len());
        for entry in raw {
            match serde_json::from_value::<Ticker24h>(entry.clone()) {
                Ok(t) => tickers.push(t),
                Err(e) => warn!(error = %e, "skipping malformed 24h ticker entry"),
            }
        }

        debug!(count = tickers.len(), "24h tickers fetched");
        Ok(tickers)
    }

    // -------------------------------------------------------------------------
    // Candles
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/klines — parsed from the array-of-arrays response.
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime
    #[instrument(skip(self), name = "binance::klines")]
    pub async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let body = self.get_json(&url, FAST_TIMEOUT).await?;

        let raw = body.as_array().context("klines response is not an array")?;
        let now_ms = chrono::Utc::now().timestamp_millis();

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 7 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            let open_time_ms = arr[0].as_i64().context("missing kline openTime")?;
            let close_time_ms = arr[6].as_i64().context("missing kline closeTime")?;

            candles.push(Candle {
                open_time_ms,
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
                is_closed: close_time_ms <= now_ms,
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    /// GET /fapi/v1/aggTrades — recent aggregated trades, oldest first.
    #[instrument(skip(self), name = "binance::agg_trades")]
    pub async fn agg_trades(&self, symbol: &str, limit: usize) -> Result<Vec<TradeRecord>> {
        let url = format!(
            "{}/fapi/v1/aggTrades?symbol={}&limit={}",
            self.base_url, symbol, limit
        );
        let body = self.get_json(&url, FAST_TIMEOUT).await?;

        let trades: Vec<AggTrade> =
            serde_json::from_value(body).context("failed to decode aggTrades response")?;

        let records = trades
            .into_iter()
            .map(|t| TradeRecord {
                trade_id: t.id,
                price: t.price,
                amount: t.quantity,
                side: if t.buyer_is_maker {
                    TradeSide::Sell
                } else {
                    TradeSide::Buy
                },
                timestamp_ms: t.timestamp_ms,
            })
            .collect::<Vec<_>>();

        debug!(symbol, count = records.len(), "aggTrades fetched");
        Ok(records)
    }

    /// GET /fapi/v1/depth — one-shot order-book snapshot for the REST surface.
    #[instrument(skip(self), name = "binance::depth")]
    pub async fn depth(&self, symbol: &str, limit: usize) -> Result<crate::types::BookSnapshot> {
        let url = format!(
            "{}/fapi/v1/depth?symbol={}&limit={}",
            self.base_url, symbol, limit
        );
        let body = self.get_json(&url, FAST_TIMEOUT).await?;

        let timestamp_ms = body["T"]
            .as_i64()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let bids = parse_levels(&body["bids"]).context("missing depth bids")?;
        let asks = parse_levels(&body["asks"]).context("missing depth asks")?;

        Ok(crate::types::BookSnapshot {
            timestamp_ms,
            bids,
            asks,
        })
    }
}

/// Parse a `[["price","amount"], ...]` level array.
pub(crate) fn parse_levels(val: &serde_json::Value) -> Option<Vec<(f64, f64)>> {
    let arr = val.as_array()?;
    let mut levels = Vec::with_capacity(arr.len());
    for entry in arr {
        let price = entry.get(0)?.as_str()?.parse::<f64>().ok()?;
        let amount = entry.get(1)?.as_str()?.parse::<f64>().ok()?;
        levels.push((price, amount));
    }
    Some(levels)
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .with_context(|| format!("failed to parse '{s}' as f64"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

impl std::fmt::Debug for BinanceRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceRest")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
