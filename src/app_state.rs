// =============================================================================
// Central application state — explicit process-wide services
// =============================================================================
//
// Everything that used to be a singleton lives here and is passed by
// reference: the symbol registry, the hub registry, the shared HTTP pool and
// the historical source. Built once at startup, torn down at shutdown.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use crate::binance::{BinanceFeed, BinanceRest, LiquidationApi};
use crate::config::AppConfig;
use crate::history::{GatewayHistory, HistorySource};
use crate::hub::HubRegistry;
use crate::symbols::SymbolRegistry;

/// Shared across every handler and task via `Arc<AppState>`.
pub struct AppState {
    pub config: AppConfig,
    pub symbols: Arc<SymbolRegistry>,
    pub hubs: Arc<HubRegistry>,
    pub history: Arc<dyn HistorySource>,
    /// Instant the gateway started; drives the health endpoint's uptime.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig) -> Arc<Self> {
        let rest = BinanceRest::new(&config.rest_base_url, &config.api_key);

        // One plain pool for the external liquidation API; the exchange pool
        // carries the API-key header and must not leak it elsewhere.
        let external_http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .build()
            .expect("failed to build reqwest client");
        let liq_api = LiquidationApi::new(&config.liquidation_api_url, external_http);

        let symbols = Arc::new(SymbolRegistry::new(
            rest.clone(),
            config.quote_whitelist.clone(),
        ));

        let history: Arc<dyn HistorySource> = Arc::new(GatewayHistory::new(rest, liq_api));
        let feed = Arc::new(BinanceFeed::new(&config.ws_base_url));

        let hubs = HubRegistry::new(
            feed,
            history.clone(),
            config.grace_shutdown,
            config.max_orderbook_limit,
        );

        Arc::new(Self {
            config,
            symbols,
            hubs,
            history,
            start_time: Instant::now(),
        })
    }
}
