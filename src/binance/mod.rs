pub mod liq_api;
pub mod rest;
pub mod ws;

pub use liq_api::LiquidationApi;
pub use rest::{BinanceRest, ExchangeSymbol, Ticker24h};
pub use ws::BinanceFeed;
