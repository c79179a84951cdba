// =============================================================================
// Liquidation Volume Aggregator — timeframe-aligned buckets
// =============================================================================
//
// One aggregator per (symbol, timeframe) hub. Buckets accumulate in place and
// are never replaced by a later apply; only `seed` may set values absolutely,
// and it runs before any live event touches the same bucket. Each live apply
// returns the single changed bucket so the hub can emit a minimal update.
// =============================================================================

use std::collections::BTreeMap;

use serde::Serialize;

use crate::format;
use crate::types::{LiquidationEvent, LiquidationSide, Timeframe};

/// One timeframe-aligned accumulator of liquidation volume.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBucket {
    pub bucket_open_ms: i64,
    pub buy_volume_usdt: f64,
    pub sell_volume_usdt: f64,
    pub total: f64,
    /// buy - sell.
    pub delta: f64,
    pub count: u64,
    pub buy_volume_formatted: String,
    pub sell_volume_formatted: String,
    pub total_formatted: String,
    pub delta_formatted: String,
}

impl VolumeBucket {
    fn empty(bucket_open_ms: i64) -> Self {
        let mut bucket = Self {
            bucket_open_ms,
            buy_volume_usdt: 0.0,
            sell_volume_usdt: 0.0,
            total: 0.0,
            delta: 0.0,
            count: 0,
            buy_volume_formatted: String::new(),
            sell_volume_formatted: String::new(),
            total_formatted: String::new(),
            delta_formatted: String::new(),
        };
        bucket.refresh_derived();
        bucket
    }

    fn accumulate(&mut self, event: &LiquidationEvent) {
        match event.side {
            LiquidationSide::Buy => self.buy_volume_usdt += event.amount_usdt,
            LiquidationSide::Sell => self.sell_volume_usdt += event.amount_usdt,
        }
        self.count += 1;
        self.refresh_derived();
    }

    fn refresh_derived(&mut self) {
        self.total = self.buy_volume_usdt + self.sell_volume_usdt;
        self.delta = self.buy_volume_usdt - self.sell_volume_usdt;
        self.buy_volume_formatted =
            format::or_empty(format::format_large_number(self.buy_volume_usdt));
        self.sell_volume_formatted =
            format::or_empty(format::format_large_number(self.sell_volume_usdt));
        self.total_formatted = format::or_empty(format::format_large_number(self.total));
        self.delta_formatted = format::or_empty(format::format_large_number(self.delta));
    }
}

/// Rolls raw liquidation events into per-timeframe volume buckets.
#[derive(Debug)]
pub struct VolumeAggregator {
    timeframe: Timeframe,
    buckets: BTreeMap<i64, VolumeBucket>,
}

impl VolumeAggregator {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            timeframe,
            buckets: BTreeMap::new(),
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    fn bucket_open(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - timestamp_ms.rem_euclid(self.timeframe.ms())
    }

    /// Accumulate one live event; returns the changed bucket.
    pub fn apply(&mut self, event: &LiquidationEvent) -> VolumeBucket {
        let open_ms = self.bucket_open(event.timestamp_ms);
        let bucket = self
            .buckets
            .entry(open_ms)
            .or_insert_with(|| VolumeBucket::empty(open_ms));
        bucket.accumulate(event);
        bucket.clone()
    }

    /// Replace all state from a historical range fetch. The only operation
    /// allowed to set bucket values absolutely.
    pub fn seed(&mut self, events: &[LiquidationEvent]) {
        self.buckets.clear();
        for event in events {
            let open_ms = self.bucket_open(event.timestamp_ms);
            self.buckets
                .entry(open_ms)
                .or_insert_with(|| VolumeBucket::empty(open_ms))
                .accumulate(event);
        }
    }

    /// All buckets in ascending bucket-open order.
    pub fn snapshot(&self) -> Vec<VolumeBucket> {
        self.buckets.values().cloned().collect()
    }

    /// Buckets whose open time falls inside `[start_ms, end_ms]`.
    pub fn range(&self, start_ms: i64, end_ms: i64) -> Vec<VolumeBucket> {
        self.buckets
            .range(start_ms..=end_ms)
            .map(|(_, b)| b.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
