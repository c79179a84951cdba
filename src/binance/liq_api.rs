// =============================================================================
// External liquidation-history API client
// =============================================================================
//
// The exchange WebSocket only carries liquidations from the moment of
// subscription, so the backlog comes from a secondary HTTP service whose base
// URL is configured via the environment. An empty base URL disables the
// client: every fetch returns an empty backlog without logging noise.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::types::{LiquidationEvent, LiquidationSide};

/// Liquidation-history fetches are the slowest external calls we make.
const LIQ_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct LiquidationApi {
    base_url: String,
    client: reqwest::Client,
}

/// One historical liquidation order as served by the external API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiLiquidation {
    side: LiquidationSide,
    quantity: f64,
    avg_price: f64,
    timestamp: i64,
}

impl From<ApiLiquidation> for LiquidationEvent {
    fn from(raw: ApiLiquidation) -> Self {
        Self {
            side: raw.side,
            quantity: raw.quantity,
            avg_price: raw.avg_price,
            amount_usdt: raw.quantity * raw.avg_price,
            timestamp_ms: raw.timestamp,
        }
    }
}

impl LiquidationApi {
    /// `base_url` may be empty, which disables all fetches.
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    pub fn enabled(&self) -> bool {
        !self.base_url.is_empty()
    }

    async fn fetch(&self, url: &str) -> Result<Vec<LiquidationEvent>> {
        let resp = self
            .client
            .get(url)
            .timeout(LIQ_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("GET {url} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("GET {url} returned {status}");
        }

        let raw: Vec<ApiLiquidation> = resp
            .json()
            .await
            .with_context(|| format!("failed to decode liquidation response from {url}"))?;

        Ok(raw.into_iter().map(LiquidationEvent::from).collect())
    }

    /// Most recent liquidations for a symbol, newest last.
    #[instrument(skip(self), name = "liq_api::recent")]
    pub async fn recent(&self, symbol: &str, limit: usize) -> Result<Vec<LiquidationEvent>> {
        if !self.enabled() {
            return Ok(Vec::new());
        }
        let url = format!(
            "{}/liquidations?symbol={}&limit={}",
            self.base_url, symbol, limit
        );
        let events = self.fetch(&url).await?;
        debug!(symbol, count = events.len(), "historical liquidations fetched");
        Ok(events)
    }

    /// Liquidations inside `[start_ms, end_ms]` for seeding volume buckets.
    #[instrument(skip(self), name = "liq_api::range")]
    pub async fn range(
        &self,
        symbol: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<LiquidationEvent>> {
        if !self.enabled() {
            return Ok(Vec::new());
        }
        let url = format!(
            "{}/liquidations?symbol={}&start={}&end={}",
            self.base_url, symbol, start_ms, end_ms
        );
        let events = self.fetch(&url).await?;
        debug!(
            symbol,
            start_ms,
            end_ms,
            count = events.len(),
            "liquidation range fetched"
        );
        Ok(events)
    }
}

impl std::fmt::Debug for LiquidationApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiquidationApi")
            .field("base_url", &self.base_url)
            .field("enabled", &self.enabled())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_client_returns_empty() {
        let api = LiquidationApi::new("", reqwest::Client::new());
        assert!(!api.enabled());
        assert!(api.recent("BTCUSDT", 50).await.unwrap().is_empty());
        assert!(api.range("BTCUSDT", 0, 1).await.unwrap().is_empty());
    }

    #[test]
    fn api_record_converts_with_amount() {
        let raw: ApiLiquidation = serde_json::from_str(
            r#"{ "side": "BUY", "quantity": 1.5, "avgPrice": 2000.0, "timestamp": 60000 }"#,
        )
        .unwrap();
        let event = LiquidationEvent::from(raw);
        assert_eq!(event.side, LiquidationSide::Buy);
        assert_eq!(event.amount_usdt, 3000.0);
        assert_eq!(event.timestamp_ms, 60_000);
    }
}
