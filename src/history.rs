// =============================================================================
// Historical backlog source — one-shot fetches behind a seam
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;

use crate::binance::{BinanceRest, LiquidationApi};
use crate::types::{BookSnapshot, Candle, LiquidationEvent, Timeframe, TradeRecord};

/// How many trades the backlog carries; matches the trade ring size.
pub const TRADE_BACKLOG: usize = 100;
/// How many liquidations the backlog carries; matches the liquidation ring.
pub const LIQUIDATION_BACKLOG: usize = 50;

/// Default candle backlog when the client did not report a container width.
pub const DEFAULT_CANDLE_LIMIT: usize = 500;

/// Candle backlog size for a reported chart width in pixels:
/// `clamp(floor(width / 6) * 3, 200, 1000)`.
pub fn candle_limit_for_width(container_width: Option<u32>) -> usize {
    match container_width {
        Some(width) => ((width as usize / 6) * 3).clamp(200, 1000),
        None => DEFAULT_CANDLE_LIMIT,
    }
}

/// The historical-backlog seam. Every method is a single HTTP round trip with
/// its own timeout; failures surface as `Err` and the hub decides whether to
/// degrade to a live-only stream.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn depth(&self, symbol: &str, limit: usize) -> Result<BookSnapshot>;

    async fn candles(&self, symbol: &str, tf: Timeframe, limit: usize) -> Result<Vec<Candle>>;

    async fn trades(&self, symbol: &str, limit: usize) -> Result<Vec<TradeRecord>>;

    async fn liquidations(&self, symbol: &str, limit: usize) -> Result<Vec<LiquidationEvent>>;

    async fn liquidations_range(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<LiquidationEvent>>;
}

/// Production source: exchange REST for candles/trades, the external
/// liquidation API for the rest.
pub struct GatewayHistory {
    rest: BinanceRest,
    liq: LiquidationApi,
}

impl GatewayHistory {
    pub fn new(rest: BinanceRest, liq: LiquidationApi) -> Self {
        Self { rest, liq }
    }
}

#[async_trait]
impl HistorySource for GatewayHistory {
    async fn depth(&self, symbol: &str, limit: usize) -> Result<BookSnapshot> {
        self.rest.depth(symbol, limit).await
    }

    async fn candles(&self, symbol: &str, tf: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        self.rest.klines(symbol, tf.as_str(), limit).await
    }

    async fn trades(&self, symbol: &str, limit: usize) -> Result<Vec<TradeRecord>> {
        self.rest.agg_trades(symbol, limit).await
    }

    async fn liquidations(&self, symbol: &str, limit: usize) -> Result<Vec<LiquidationEvent>> {
        self.liq.recent(symbol, limit).await
    }

    async fn liquidations_range(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<LiquidationEvent>> {
        self.liq.range(symbol, start_ms, end_ms).await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_limit_defaults_without_width() {
        assert_eq!(candle_limit_for_width(None), 500);
    }

    #[test]
    fn candle_limit_scales_and_clamps() {
        // floor(1200 / 6) * 3 = 600
        assert_eq!(candle_limit_for_width(Some(1200)), 600);
        // Tiny widths clamp up to 200.
        assert_eq!(candle_limit_for_width(Some(100)), 200);
        // Huge widths clamp down to 1000.
        assert_eq!(candle_limit_for_width(Some(10_000)), 1000);
        // floor(401 / 6) * 3 = 66 * 3 = 198 -> clamped to 200.
        assert_eq!(candle_limit_for_width(Some(401)), 200);
    }
}
