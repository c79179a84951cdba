pub mod cache;
pub mod registry;
pub mod stream_hub;

pub use registry::HubRegistry;
pub use stream_hub::{Hub, SubscriberSpec};

use crate::types::{StreamKind, Timeframe};

/// Identifies one hub: `(symbol, kind[, timeframe])`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HubKey {
    pub symbol: String,
    pub kind: StreamKind,
    pub timeframe: Option<Timeframe>,
}

impl HubKey {
    pub fn new(symbol: impl Into<String>, kind: StreamKind, timeframe: Option<Timeframe>) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            timeframe,
        }
    }
}

impl std::fmt::Display for HubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.timeframe {
            Some(tf) => write!(f, "{}@{}/{}", self.symbol, self.kind, tf),
            None => write!(f, "{}@{}", self.symbol, self.kind),
        }
    }
}
