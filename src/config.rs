// =============================================================================
// Gateway configuration — environment-driven, loaded once at startup
// =============================================================================
//
// Every knob comes from the environment (a `.env` file is honoured via
// dotenv in main). Missing variables fall back to defaults suitable for the
// public Binance futures endpoints; the gateway runs unauthenticated when no
// API key is provided.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Immutable gateway configuration shared behind `Arc` via `AppState`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Address the downstream HTTP/WebSocket server binds to.
    pub bind_addr: String,

    /// Exchange REST base URL.
    pub rest_base_url: String,
    /// Exchange WebSocket base URL (single-stream endpoint).
    pub ws_base_url: String,
    /// Optional exchange API key, sent as a header for a higher request-weight
    /// quota. Public market data works without it.
    pub api_key: String,
    /// Matching secret. Unused while the gateway only touches public
    /// endpoints; absent means sandbox/public mode.
    pub api_secret: String,

    /// Base URL of the external historical-liquidation API. Empty disables
    /// historical liquidation fetches (the fetcher returns `[]` silently).
    pub liquidation_api_url: String,

    /// Allowed CORS origins; `*` means any.
    pub cors_origins: Vec<String>,

    /// Path prefixes for the WebSocket and REST surfaces.
    pub ws_prefix: String,
    pub api_prefix: String,

    /// Hard cap on the order-book limit parameter.
    pub max_orderbook_limit: usize,

    /// Quote assets the symbol registry keeps (others are filtered out).
    pub quote_whitelist: Vec<String>,

    /// How long a hub lingers after its last detach before tearing down.
    pub grace_shutdown: Duration,

    /// Verbose per-frame logging.
    pub debug: bool,
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let max_orderbook_limit: usize = env_or("MARKETGATE_MAX_ORDERBOOK_LIMIT", "1000")
            .parse()
            .context("MARKETGATE_MAX_ORDERBOOK_LIMIT is not a number")?;

        let grace_ms: u64 = env_or("MARKETGATE_GRACE_SHUTDOWN_MS", "5000")
            .parse()
            .context("MARKETGATE_GRACE_SHUTDOWN_MS is not a number")?;

        let cors_origins: Vec<String> = env_or("MARKETGATE_CORS_ORIGINS", "*")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let quote_whitelist: Vec<String> = env_or("MARKETGATE_QUOTE_WHITELIST", "USDT")
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let config = Self {
            bind_addr: env_or("MARKETGATE_BIND_ADDR", "0.0.0.0:8442"),
            rest_base_url: env_or("MARKETGATE_REST_BASE_URL", "https://fapi.binance.com"),
            ws_base_url: env_or("MARKETGATE_WS_BASE_URL", "wss://fstream.binance.com/ws"),
            api_key: std::env::var("MARKETGATE_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("MARKETGATE_API_SECRET").unwrap_or_default(),
            liquidation_api_url: std::env::var("MARKETGATE_LIQUIDATION_API_URL")
                .unwrap_or_default(),
            cors_origins,
            ws_prefix: env_or("MARKETGATE_WS_PREFIX", "/ws"),
            api_prefix: env_or("MARKETGATE_API_PREFIX", "/api"),
            max_orderbook_limit,
            quote_whitelist,
            grace_shutdown: Duration::from_millis(grace_ms),
            debug: env_or("MARKETGATE_DEBUG", "false") == "true",
        };

        info!(
            bind_addr = %config.bind_addr,
            rest = %config.rest_base_url,
            ws = %config.ws_base_url,
            authenticated = !config.api_key.is_empty(),
            liquidation_api = !config.liquidation_api_url.is_empty(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// Whether any origin is allowed.
    pub fn cors_any(&self) -> bool {
        self.cors_origins.iter().any(|o| o == "*")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8442".into(),
            rest_base_url: "https://fapi.binance.com".into(),
            ws_base_url: "wss://fstream.binance.com/ws".into(),
            api_key: String::new(),
            api_secret: String::new(),
            liquidation_api_url: String::new(),
            cors_origins: vec!["*".into()],
            ws_prefix: "/ws".into(),
            api_prefix: "/api".into(),
            max_orderbook_limit: 1000,
            quote_whitelist: vec!["USDT".into()],
            grace_shutdown: Duration::from_millis(5000),
            debug: false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_public_binance_futures() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.rest_base_url, "https://fapi.binance.com");
        assert_eq!(cfg.ws_base_url, "wss://fstream.binance.com/ws");
        assert!(cfg.api_key.is_empty());
        assert!(cfg.liquidation_api_url.is_empty());
        assert_eq!(cfg.grace_shutdown, Duration::from_millis(5000));
        assert_eq!(cfg.max_orderbook_limit, 1000);
        assert!(cfg.cors_any());
        assert_eq!(cfg.quote_whitelist, vec!["USDT"]);
    }
}
