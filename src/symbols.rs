// =============================================================================
// Symbol Registry — instrument metadata with TTL cache
// =============================================================================
//
// Single process-wide service. The instrument list and 24h statistics are
// fetched together, filtered to active whitelisted-quote pairs, and cached
// for five minutes. Refresh is single-flight: concurrent callers block on
// the one in-flight fetch instead of stampeding the exchange.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::binance::{BinanceRest, ExchangeSymbol, Ticker24h};
use crate::format;

/// Cache lifetime of the instrument list.
const REFRESH_TTL: Duration = Duration::from_secs(300);

/// Maximum number of rounding steps offered for a symbol.
const MAX_LADDER_LEN: usize = 7;

// =============================================================================
// Types
// =============================================================================

/// Read-only metadata for one tradable instrument.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolMeta {
    /// Stable user-facing id, e.g. "BTCUSDT".
    pub display_id: String,
    /// Exchange-native id used on upstream subscriptions.
    pub exchange_id: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub price_precision: u32,
    pub amount_precision: u32,
    /// Price-rounding steps, smallest first.
    pub rounding_ladder: Vec<f64>,
    /// Step preselected for new order-book subscriptions.
    pub default_rounding: f64,
    /// 24h quote volume, shortened (K/M/B); absent when the ticker sweep
    /// had no entry for the symbol.
    pub volume_24h: Option<String>,
    /// Representative price used for ladder truncation; 0 when unknown.
    #[serde(skip)]
    pub last_price: f64,
}

/// Registry lookups that cannot be satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The symbol is not in the active instrument list.
    UnknownSymbol(String),
    /// The registry has never loaded and the last refresh failed.
    ServiceUnavailable,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSymbol(id) => write!(f, "unknown symbol: {id}"),
            Self::ServiceUnavailable => write!(f, "symbol service unavailable"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Default)]
struct RegistryState {
    /// display_id → metadata.
    symbols: HashMap<String, SymbolMeta>,
    /// Display order: by 24h volume descending.
    ordered: Vec<String>,
    loaded_at: Option<Instant>,
    degraded: bool,
}

/// Process-wide symbol registry.
pub struct SymbolRegistry {
    rest: BinanceRest,
    quote_whitelist: Vec<String>,
    state: RwLock<RegistryState>,
    /// Single-flight guard for refreshes.
    refresh_flight: tokio::sync::Mutex<()>,
}

// =============================================================================
// Registry
// =============================================================================

impl SymbolRegistry {
    pub fn new(rest: BinanceRest, quote_whitelist: Vec<String>) -> Self {
        Self {
            rest,
            quote_whitelist,
            state: RwLock::new(RegistryState::default()),
            refresh_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Cached instrument list in display order. Triggers a refresh when the
    /// TTL has expired; on refresh failure the last known list is returned.
    pub async fn list_symbols(&self) -> Vec<SymbolMeta> {
        self.ensure_fresh().await;
        let state = self.state.read();
        state
            .ordered
            .iter()
            .filter_map(|id| state.symbols.get(id).cloned())
            .collect()
    }

    /// Resolve a display id to the exchange-native id.
    pub async fn resolve(&self, display_id: &str) -> Result<String, RegistryError> {
        self.metadata(display_id).await.map(|meta| meta.exchange_id)
    }

    /// Full metadata for a display id.
    pub async fn metadata(&self, display_id: &str) -> Result<SymbolMeta, RegistryError> {
        self.ensure_fresh().await;
        let state = self.state.read();
        if let Some(meta) = state.symbols.get(display_id) {
            return Ok(meta.clone());
        }
        if state.symbols.is_empty() && state.degraded {
            return Err(RegistryError::ServiceUnavailable);
        }
        Err(RegistryError::UnknownSymbol(display_id.to_string()))
    }

    /// True when the registry has never managed a successful load.
    pub fn degraded(&self) -> bool {
        self.state.read().degraded
    }

    fn is_fresh(&self) -> bool {
        self.state
            .read()
            .loaded_at
            .map(|at| at.elapsed() < REFRESH_TTL)
            .unwrap_or(false)
    }

    /// Refresh when stale. Concurrent callers serialise on the flight lock
    /// and re-check freshness after acquiring it.
    async fn ensure_fresh(&self) {
        if self.is_fresh() {
            return;
        }

        let _flight = self.refresh_flight.lock().await;
        if self.is_fresh() {
            return; // another flight already refreshed
        }

        match self.fetch_instruments().await {
            Ok((symbols, ordered)) => {
                let mut state = self.state.write();
                info!(count = symbols.len(), "symbol registry refreshed");
                state.symbols = symbols;
                state.ordered = ordered;
                state.loaded_at = Some(Instant::now());
                state.degraded = false;
            }
            Err(e) => {
                let mut state = self.state.write();
                if state.loaded_at.is_some() {
                    warn!(error = %e, "symbol refresh failed, serving last known list");
                    // Keep serving stale data; retry on the next call.
                    state.loaded_at = Some(Instant::now());
                } else {
                    warn!(error = %e, "symbol refresh failed with empty registry");
                    state.degraded = true;
                }
            }
        }
    }

    async fn fetch_instruments(
        &self,
    ) -> anyhow::Result<(HashMap<String, SymbolMeta>, Vec<String>)> {
        let instruments = self.rest.exchange_info().await?;

        // The ticker sweep enriches metadata but is not load-bearing.
        let tickers: HashMap<String, Ticker24h> = match self.rest.tickers_24h().await {
            Ok(list) => list.into_iter().map(|t| (t.symbol.clone(), t)).collect(),
            Err(e) => {
                warn!(error = %e, "24h ticker sweep failed, volumes unavailable");
                HashMap::new()
            }
        };

        let mut symbols = HashMap::new();
        let mut volumes: Vec<(String, f64)> = Vec::new();

        for instrument in instruments {
            let Some(meta) = build_meta(&instrument, tickers.get(&instrument.symbol), &self.quote_whitelist)
            else {
                continue;
            };
            volumes.push((
                meta.display_id.clone(),
                tickers
                    .get(&meta.display_id)
                    .map(|t| t.quote_volume)
                    .unwrap_or(0.0),
            ));
            symbols.insert(meta.display_id.clone(), meta);
        }

        volumes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let ordered = volumes.into_iter().map(|(id, _)| id).collect();

        debug!(count = symbols.len(), "instrument list built");
        Ok((symbols, ordered))
    }
}

// =============================================================================
// Metadata construction (pure)
// =============================================================================

/// Build metadata for one instrument; `None` filters it out (inactive or
/// non-whitelisted quote).
fn build_meta(
    instrument: &ExchangeSymbol,
    ticker: Option<&Ticker24h>,
    quote_whitelist: &[String],
) -> Option<SymbolMeta> {
    if instrument.status != "TRADING" {
        return None;
    }
    if !quote_whitelist.is_empty() && !quote_whitelist.contains(&instrument.quote_asset) {
        return None;
    }

    let last_price = ticker.map(|t| t.last_price).unwrap_or(0.0);
    let representative = if last_price > 0.0 {
        last_price
    } else {
        representative_price_heuristic(&instrument.quote_asset)
    };

    let (rounding_ladder, default_rounding) =
        rounding_ladder(instrument.price_precision, representative);

    let volume_24h = ticker
        .map(|t| format::or_empty(format::format_large_number(t.quote_volume)))
        .filter(|s| !s.is_empty());

    Some(SymbolMeta {
        display_id: instrument.symbol.clone(),
        exchange_id: instrument.symbol.clone(),
        base_asset: instrument.base_asset.clone(),
        quote_asset: instrument.quote_asset.clone(),
        price_precision: instrument.price_precision,
        amount_precision: instrument.quantity_precision,
        rounding_ladder,
        default_rounding,
        volume_24h,
        last_price,
    })
}

/// Fallback price scale when no ticker is known for the instrument yet.
fn representative_price_heuristic(quote_asset: &str) -> f64 {
    match quote_asset {
        "USDT" | "USDC" | "BUSD" | "FDUSD" => 100.0,
        "BTC" => 0.001,
        _ => 1.0,
    }
}

/// Decimal rounding ladder for a symbol.
///
/// The first step is always `10^-price_precision`; each next step is 10x the
/// previous. Steps above one tenth of the representative price are cut, and
/// the ladder is capped at [`MAX_LADDER_LEN`]. The default step sits at the
/// middle of whatever survives.
fn rounding_ladder(price_precision: u32, representative_price: f64) -> (Vec<f64>, f64) {
    let mut ladder = Vec::with_capacity(MAX_LADDER_LEN);
    let mut step = 10f64.powi(-(price_precision as i32));

    while ladder.len() < MAX_LADDER_LEN {
        if !ladder.is_empty()
            && representative_price > 0.0
            && step > representative_price / 10.0
        {
            break;
        }
        ladder.push(step);
        step *= 10.0;
    }

    let default_rounding = ladder[ladder.len() / 2];
    (ladder, default_rounding)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn instrument(symbol: &str, status: &str, quote: &str, precision: u32) -> ExchangeSymbol {
        serde_json::from_value(serde_json::json!({
            "symbol": symbol,
            "status": status,
            "baseAsset": symbol.strip_suffix(quote).unwrap_or("X"),
            "quoteAsset": quote,
            "pricePrecision": precision,
            "quantityPrecision": 3,
        }))
        .unwrap()
    }

    fn ticker(symbol: &str, last: f64, volume: f64) -> Ticker24h {
        serde_json::from_value(serde_json::json!({
            "symbol": symbol,
            "lastPrice": last.to_string(),
            "priceChangePercent": "0.0",
            "highPrice": last.to_string(),
            "lowPrice": last.to_string(),
            "quoteVolume": volume.to_string(),
        }))
        .unwrap()
    }

    #[test]
    fn ladder_starts_at_tick_and_multiplies_by_ten() {
        let (ladder, _) = rounding_ladder(2, 50_000.0);
        assert_eq!(ladder[0], 0.01);
        for pair in ladder.windows(2) {
            assert!((pair[1] / pair[0] - 10.0).abs() < 1e-9);
        }
        assert!(ladder.len() <= MAX_LADDER_LEN);
    }

    #[test]
    fn ladder_truncates_against_representative_price() {
        // Price 2000: steps above 200 are cut -> 0.01..100.
        let (ladder, _) = rounding_ladder(2, 2_000.0);
        assert_eq!(*ladder.last().unwrap(), 100.0);

        // Very low price keeps at least the tick step.
        let (ladder, _) = rounding_ladder(4, 0.0001);
        assert_eq!(ladder, vec![0.0001]);
    }

    #[test]
    fn ladder_default_sits_in_the_middle() {
        let (ladder, default) = rounding_ladder(2, 50_000.0);
        assert_eq!(default, ladder[ladder.len() / 2]);
        assert!(ladder.contains(&default));
    }

    #[test]
    fn build_meta_filters_inactive_and_foreign_quotes() {
        let whitelist = vec!["USDT".to_string()];
        assert!(build_meta(&instrument("BTCUSDT", "BREAK", "USDT", 2), None, &whitelist).is_none());
        assert!(build_meta(&instrument("BTCBUSD", "TRADING", "BUSD", 2), None, &whitelist).is_none());
        assert!(build_meta(&instrument("BTCUSDT", "TRADING", "USDT", 2), None, &whitelist).is_some());
    }

    #[test]
    fn build_meta_formats_volume_and_keeps_precisions() {
        let whitelist = vec!["USDT".to_string()];
        let t = ticker("BTCUSDT", 50_000.0, 1_234_000_000.0);
        let meta = build_meta(&instrument("BTCUSDT", "TRADING", "USDT", 2), Some(&t), &whitelist)
            .unwrap();
        assert_eq!(meta.price_precision, 2);
        assert_eq!(meta.amount_precision, 3);
        assert_eq!(meta.volume_24h.as_deref(), Some("1.23B"));
        assert_eq!(meta.rounding_ladder[0], 0.01);
        assert_eq!(meta.last_price, 50_000.0);
    }

    #[test]
    fn build_meta_uses_quote_heuristic_without_ticker() {
        let whitelist = vec!["USDT".to_string()];
        let meta =
            build_meta(&instrument("NEWUSDT", "TRADING", "USDT", 3), None, &whitelist).unwrap();
        // Heuristic price 100 -> ladder truncated at 10.
        assert_eq!(*meta.rounding_ladder.last().unwrap(), 10.0);
        assert!(meta.volume_24h.is_none());
    }
}
