// =============================================================================
// Per-kind hub caches — merge rules and display views
// =============================================================================
//
// Every cache mutation happens under the owning hub's lock and is pure CPU
// work: no cache method performs I/O. Display strings are precomputed at
// insert time so fan-out only serialises.
// =============================================================================

use std::collections::{BTreeMap, HashSet, VecDeque};

use serde::Serialize;

use crate::format;
use crate::symbols::SymbolMeta;
use crate::types::{
    BookSnapshot, Candle, LiquidationEvent, LiquidationSide, TickerUpdate, TradeRecord,
};

/// Trades kept per symbol, newest first.
pub const TRADE_RING: usize = 100;
/// Liquidation orders kept per symbol, newest first.
pub const LIQUIDATION_RING: usize = 50;

/// Order-book limits the exchange actually serves.
pub const VALID_BOOK_LIMITS: &[usize] = &[5, 10, 20, 50, 100, 500, 1000];

// =============================================================================
// Order-book parameters
// =============================================================================

/// Per-session order-book aggregation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BookParams {
    pub limit: usize,
    pub rounding: f64,
}

/// Clamp a requested limit to the nearest valid exchange limit, honouring the
/// configured hard cap. Ties go to the smaller limit.
pub fn clamp_book_limit(requested: usize, max_limit: usize) -> usize {
    let capped: Vec<usize> = VALID_BOOK_LIMITS
        .iter()
        .copied()
        .filter(|&l| l <= max_limit.max(VALID_BOOK_LIMITS[0]))
        .collect();

    let mut best = capped[0];
    for &candidate in &capped {
        let best_diff = best.abs_diff(requested);
        let diff = candidate.abs_diff(requested);
        if diff < best_diff {
            best = candidate;
        }
    }
    best
}

/// Snap a requested rounding step to the symbol's ladder; anything not on the
/// ladder falls back to the default step.
pub fn validate_rounding(requested: Option<f64>, meta: &SymbolMeta) -> f64 {
    match requested {
        Some(step) => meta
            .rounding_ladder
            .iter()
            .copied()
            .find(|&s| (s - step).abs() / s < 1e-6)
            .unwrap_or(meta.default_rounding),
        None => meta.default_rounding,
    }
}

/// Fractional display digits appropriate for a rounding step
/// (0.01 -> 2, 0.1 -> 1, 1 and above -> 0).
fn decimals_for_step(step: f64) -> usize {
    if step >= 1.0 {
        0
    } else {
        (-step.log10()).round().max(0.0) as usize
    }
}

// =============================================================================
// Order book
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BookLevelView {
    pub price: f64,
    pub amount: f64,
    pub price_formatted: String,
    pub amount_formatted: String,
    pub cumulative_amount_formatted: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderBookView {
    pub symbol: String,
    pub bids: Vec<BookLevelView>,
    pub asks: Vec<BookLevelView>,
    pub rounding: f64,
    pub limit: usize,
    pub timestamp: i64,
}

/// Holds the latest raw upstream snapshot; per-session views are materialised
/// on demand with each session's own parameters.
#[derive(Debug, Default)]
pub struct OrderBookCache {
    raw: Option<BookSnapshot>,
}

impl OrderBookCache {
    /// Whole-snapshot replacement; latest wins.
    pub fn replace(&mut self, snapshot: BookSnapshot) {
        self.raw = Some(snapshot);
    }

    pub fn has_snapshot(&self) -> bool {
        self.raw.is_some()
    }

    /// True once a snapshot with at least one level has been stored. Until
    /// then the next live snapshot is the client's first authoritative view.
    pub fn is_populated(&self) -> bool {
        self.raw
            .as_ref()
            .map(|raw| !raw.bids.is_empty() || !raw.asks.is_empty())
            .unwrap_or(false)
    }

    /// Materialise a display view for one session's parameters. An empty view
    /// is returned before the first upstream snapshot.
    pub fn view(&self, meta: &SymbolMeta, params: &BookParams) -> OrderBookView {
        let Some(raw) = &self.raw else {
            return OrderBookView {
                symbol: meta.display_id.clone(),
                bids: Vec::new(),
                asks: Vec::new(),
                rounding: params.rounding,
                limit: params.limit,
                timestamp: 0,
            };
        };

        let bids = aggregate_side(&raw.bids, params, meta, BookSide::Bid);
        let asks = aggregate_side(&raw.asks, params, meta, BookSide::Ask);

        OrderBookView {
            symbol: meta.display_id.clone(),
            bids,
            asks,
            rounding: params.rounding,
            limit: params.limit,
            timestamp: raw.timestamp_ms,
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum BookSide {
    Bid,
    Ask,
}

/// Bucket one side of the book by the rounding step. Bids round down, asks
/// round up, so the displayed spread can never invert.
fn aggregate_side(
    levels: &[(f64, f64)],
    params: &BookParams,
    meta: &SymbolMeta,
    side: BookSide,
) -> Vec<BookLevelView> {
    let step = params.rounding;
    let mut buckets: BTreeMap<i64, f64> = BTreeMap::new();

    for &(price, amount) in levels {
        let key = match side {
            BookSide::Bid => (price / step).floor() as i64,
            BookSide::Ask => (price / step).ceil() as i64,
        };
        *buckets.entry(key).or_insert(0.0) += amount;
    }

    let ordered: Vec<(i64, f64)> = match side {
        // Bids descend from the best (highest) price.
        BookSide::Bid => buckets.into_iter().rev().collect(),
        BookSide::Ask => buckets.into_iter().collect(),
    };

    let price_decimals = decimals_for_step(step);
    let scale = 10f64.powi(price_decimals as i32);
    let mut cumulative = 0.0;
    ordered
        .into_iter()
        .take(params.limit)
        .map(|(key, amount)| {
            // Normalise away float noise from the key * step reconstruction.
            let price = (key as f64 * step * scale).round() / scale;
            cumulative += amount;
            BookLevelView {
                price,
                amount,
                price_formatted: format::or_empty(format::format_decimal(price, price_decimals)),
                amount_formatted: format::or_empty(format::format_decimal(
                    amount,
                    meta.amount_precision as usize,
                )),
                cumulative_amount_formatted: format::or_empty(format::format_decimal(
                    cumulative,
                    meta.amount_precision as usize,
                )),
            }
        })
        .collect()
}

// =============================================================================
// Candles
// =============================================================================

/// Candle series keyed by open time; the in-progress bar is overwritten in
/// place and the series is trimmed to the subscriber-requested size.
#[derive(Debug)]
pub struct CandleCache {
    bars: BTreeMap<i64, Candle>,
    limit: usize,
}

impl CandleCache {
    pub fn new(limit: usize) -> Self {
        Self {
            bars: BTreeMap::new(),
            limit,
        }
    }

    /// Adopt the size the first subscriber asked for.
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
        self.trim();
    }

    pub fn seed(&mut self, candles: Vec<Candle>) {
        self.bars.clear();
        for candle in candles {
            self.bars.insert(candle.open_time_ms, candle);
        }
        self.trim();
    }

    /// Upsert by open time; an existing bar is overwritten.
    pub fn upsert(&mut self, candle: Candle) -> Candle {
        self.bars.insert(candle.open_time_ms, candle);
        self.trim();
        candle
    }

    fn trim(&mut self) {
        while self.bars.len() > self.limit {
            let oldest = *self.bars.keys().next().expect("non-empty map");
            self.bars.remove(&oldest);
        }
    }

    /// All bars, oldest first.
    pub fn view(&self) -> Vec<Candle> {
        self.bars.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Open time of the oldest and newest bars, when any exist.
    pub fn time_span(&self) -> Option<(i64, i64)> {
        let first = *self.bars.keys().next()?;
        let last = *self.bars.keys().next_back()?;
        Some((first, last))
    }
}

// =============================================================================
// Trades
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeView {
    pub trade_id: i64,
    pub price: f64,
    pub amount: f64,
    pub side: &'static str,
    pub timestamp_ms: i64,
    pub display_time: String,
    pub price_formatted: String,
    pub amount_formatted: String,
}

fn trade_view(record: &TradeRecord, meta: &SymbolMeta) -> TradeView {
    TradeView {
        trade_id: record.trade_id,
        price: record.price,
        amount: record.amount,
        side: record.side.as_str(),
        timestamp_ms: record.timestamp_ms,
        display_time: format::or_empty(format::format_time_hms(record.timestamp_ms)),
        price_formatted: format::or_empty(format::format_decimal(
            record.price,
            meta.price_precision as usize,
        )),
        amount_formatted: format::or_empty(format::format_decimal(
            record.amount,
            meta.amount_precision as usize,
        )),
    }
}

/// Bounded deque of recent trades, newest first, deduplicated by trade id.
#[derive(Debug, Default)]
pub struct TradeCache {
    ring: VecDeque<TradeView>,
}

impl TradeCache {
    /// Replace the ring from a historical fetch (records oldest first).
    /// Records whose id is already buffered are skipped.
    pub fn seed(&mut self, records: &[TradeRecord], meta: &SymbolMeta) {
        for record in records {
            self.push(record, meta);
        }
    }

    /// Insert one trade; returns the view when it was fresh, `None` for a
    /// duplicate id.
    pub fn push(&mut self, record: &TradeRecord, meta: &SymbolMeta) -> Option<TradeView> {
        if self.ring.iter().any(|t| t.trade_id == record.trade_id) {
            return None;
        }
        let view = trade_view(record, meta);
        self.ring.push_front(view.clone());
        self.ring.truncate(TRADE_RING);
        Some(view)
    }

    /// Newest first.
    pub fn view(&self) -> Vec<TradeView> {
        self.ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

// =============================================================================
// Liquidations
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidationView {
    pub side: &'static str,
    pub quantity: f64,
    pub avg_price: f64,
    pub amount_usdt: f64,
    pub timestamp_ms: i64,
    pub base_asset: String,
    pub display_time: String,
    pub quantity_formatted: String,
    pub avg_price_formatted: String,
    pub amount_usdt_formatted: String,
}

fn liquidation_view(event: &LiquidationEvent, meta: &SymbolMeta) -> LiquidationView {
    LiquidationView {
        side: event.side.as_str(),
        quantity: event.quantity,
        avg_price: event.avg_price,
        amount_usdt: event.amount_usdt,
        timestamp_ms: event.timestamp_ms,
        base_asset: meta.base_asset.clone(),
        display_time: format::or_empty(format::format_time_hms(event.timestamp_ms)),
        quantity_formatted: format::or_empty(format::format_decimal(
            event.quantity,
            meta.amount_precision as usize,
        )),
        avg_price_formatted: format::or_empty(format::format_decimal(
            event.avg_price,
            meta.price_precision as usize,
        )),
        amount_usdt_formatted: format::or_empty(format::format_usdt(event.amount_usdt, 2)),
    }
}

/// Bounded deque of recent liquidation orders, newest first, deduplicated by
/// `(timestamp, rounded amount, side)` so a historical event and its live
/// double collapse to one entry.
#[derive(Debug, Default)]
pub struct LiquidationCache {
    ring: VecDeque<LiquidationView>,
    seen: HashSet<(i64, i64, LiquidationSide)>,
}

impl LiquidationCache {
    /// Seed from a historical fetch (events oldest first).
    pub fn seed(&mut self, events: &[LiquidationEvent], meta: &SymbolMeta) {
        for event in events {
            self.push(event, meta);
        }
    }

    /// Insert one event; returns the view when fresh, `None` when the dedup
    /// key was already present.
    pub fn push(&mut self, event: &LiquidationEvent, meta: &SymbolMeta) -> Option<LiquidationView> {
        if !self.seen.insert(event.dedup_key()) {
            return None;
        }
        let view = liquidation_view(event, meta);
        self.ring.push_front(view.clone());
        while self.ring.len() > LIQUIDATION_RING {
            if let Some(evicted) = self.ring.pop_back() {
                let side = if evicted.side == "BUY" {
                    LiquidationSide::Buy
                } else {
                    LiquidationSide::Sell
                };
                self.seen
                    .remove(&(evicted.timestamp_ms, evicted.amount_usdt.round() as i64, side));
            }
        }
        Some(view)
    }

    /// Newest first.
    pub fn view(&self) -> Vec<LiquidationView> {
        self.ring.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }
}

// =============================================================================
// Ticker
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerView {
    pub last_price: f64,
    pub price_change_percent: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub volume_24h: f64,
    pub timestamp_ms: i64,
    pub last_price_formatted: String,
    pub price_change_percent_formatted: String,
    pub volume_24h_formatted: String,
}

/// Latest 24h ticker statistics; replaced whole on every update.
#[derive(Debug, Default)]
pub struct TickerCache {
    latest: Option<TickerView>,
}

impl TickerCache {
    pub fn replace(&mut self, update: &TickerUpdate, meta: &SymbolMeta) -> TickerView {
        let view = TickerView {
            last_price: update.last_price,
            price_change_percent: update.price_change_percent,
            high_24h: update.high_24h,
            low_24h: update.low_24h,
            volume_24h: update.volume_24h,
            timestamp_ms: update.timestamp_ms,
            last_price_formatted: format::or_empty(format::format_decimal(
                update.last_price,
                meta.price_precision as usize,
            )),
            price_change_percent_formatted: format::or_empty(format::format_decimal(
                update.price_change_percent,
                2,
            )),
            volume_24h_formatted: format::or_empty(format::format_large_number(update.volume_24h)),
        };
        self.latest = Some(view.clone());
        view
    }

    pub fn view(&self) -> Option<TickerView> {
        self.latest.clone()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TradeSide;

    fn meta() -> SymbolMeta {
        SymbolMeta {
            display_id: "BTCUSDT".into(),
            exchange_id: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            price_precision: 2,
            amount_precision: 8,
            rounding_ladder: vec![0.01, 0.1, 1.0, 10.0, 100.0, 1000.0],
            default_rounding: 10.0,
            volume_24h: None,
            last_price: 50_000.0,
        }
    }

    // ── Parameters ──────────────────────────────────────────────────────

    #[test]
    fn limit_clamps_to_nearest_valid() {
        assert_eq!(clamp_book_limit(20, 1000), 20);
        assert_eq!(clamp_book_limit(3, 1000), 5);
        assert_eq!(clamp_book_limit(30, 1000), 20);
        assert_eq!(clamp_book_limit(70, 1000), 50);
        assert_eq!(clamp_book_limit(9999, 1000), 1000);
        // Configured cap shrinks the candidate set.
        assert_eq!(clamp_book_limit(9999, 100), 100);
    }

    #[test]
    fn rounding_snaps_to_ladder() {
        let meta = meta();
        assert_eq!(validate_rounding(Some(0.1), &meta), 0.1);
        assert_eq!(validate_rounding(Some(0.25), &meta), 10.0);
        assert_eq!(validate_rounding(None, &meta), 10.0);
    }

    #[test]
    fn decimals_follow_step() {
        assert_eq!(decimals_for_step(0.01), 2);
        assert_eq!(decimals_for_step(0.1), 1);
        assert_eq!(decimals_for_step(1.0), 0);
        assert_eq!(decimals_for_step(100.0), 0);
    }

    // ── Order book ──────────────────────────────────────────────────────

    #[test]
    fn book_view_formats_and_accumulates() {
        let mut cache = OrderBookCache::default();
        cache.replace(BookSnapshot {
            timestamp_ms: 1,
            bids: vec![(50_000.0, 1.0), (49_999.0, 2.0)],
            asks: vec![(50_001.0, 3.0)],
        });

        let params = BookParams {
            limit: 20,
            rounding: 0.1,
        };
        let view = cache.view(&meta(), &params);

        assert_eq!(view.symbol, "BTCUSDT");
        assert_eq!(view.timestamp, 1);
        assert_eq!(view.rounding, 0.1);
        assert_eq!(view.limit, 20);

        assert_eq!(view.bids[0].price, 50_000.0);
        assert_eq!(view.bids[0].price_formatted, "50000.0");
        assert_eq!(view.bids[0].amount_formatted, "1.00000000");
        assert_eq!(view.bids[1].cumulative_amount_formatted, "3.00000000");
        assert_eq!(view.asks[0].price, 50_001.0);
    }

    #[test]
    fn book_aggregation_buckets_by_rounding() {
        let mut cache = OrderBookCache::default();
        cache.replace(BookSnapshot {
            timestamp_ms: 5,
            bids: vec![(50_009.0, 1.0), (50_001.0, 2.0), (49_990.0, 1.0)],
            asks: vec![(50_011.0, 1.0), (50_019.0, 2.0)],
        });

        let params = BookParams {
            limit: 20,
            rounding: 10.0,
        };
        let view = cache.view(&meta(), &params);

        // 50009 and 50001 both floor to 50000.
        assert_eq!(view.bids[0].price, 50_000.0);
        assert_eq!(view.bids[0].amount, 3.0);
        assert_eq!(view.bids[1].price, 49_990.0);

        // 50011 and 50019 both ceil to 50020.
        assert_eq!(view.asks[0].price, 50_020.0);
        assert_eq!(view.asks[0].amount, 3.0);
    }

    #[test]
    fn book_view_respects_limit_and_orders_sides() {
        let mut cache = OrderBookCache::default();
        let bids: Vec<(f64, f64)> = (0..30).map(|i| (50_000.0 - i as f64, 1.0)).collect();
        let asks: Vec<(f64, f64)> = (1..31).map(|i| (50_000.0 + i as f64, 1.0)).collect();
        cache.replace(BookSnapshot {
            timestamp_ms: 9,
            bids,
            asks,
        });

        let params = BookParams {
            limit: 5,
            rounding: 1.0,
        };
        let view = cache.view(&meta(), &params);
        assert_eq!(view.bids.len(), 5);
        assert_eq!(view.asks.len(), 5);
        // Best bid first, descending; best ask first, ascending.
        assert!(view.bids[0].price > view.bids[4].price);
        assert!(view.asks[0].price < view.asks[4].price);
        assert!(view.bids[0].price < view.asks[0].price);
    }

    #[test]
    fn empty_book_view_before_first_snapshot() {
        let cache = OrderBookCache::default();
        let view = cache.view(
            &meta(),
            &BookParams {
                limit: 20,
                rounding: 1.0,
            },
        );
        assert!(view.bids.is_empty());
        assert!(view.asks.is_empty());
    }

    // ── Candles ─────────────────────────────────────────────────────────

    #[test]
    fn candle_upsert_overwrites_same_open_time() {
        let mut cache = CandleCache::new(10);
        let bar = |t: i64, close: f64, closed: bool| Candle {
            open_time_ms: t,
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            is_closed: closed,
        };

        cache.upsert(bar(0, 100.0, true));
        cache.upsert(bar(60_000, 101.0, false));
        cache.upsert(bar(60_000, 102.0, false));
        cache.upsert(bar(60_000, 103.0, true));

        assert_eq!(cache.len(), 2);
        let view = cache.view();
        assert_eq!(view[1].close, 103.0);
        assert!(view[1].is_closed);
    }

    #[test]
    fn candle_cache_trims_oldest() {
        let mut cache = CandleCache::new(3);
        for i in 0..5i64 {
            cache.upsert(Candle {
                open_time_ms: i * 60_000,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 0.0,
                is_closed: true,
            });
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.time_span(), Some((120_000, 240_000)));
    }

    // ── Trades ──────────────────────────────────────────────────────────

    fn trade(id: i64, ts: i64) -> TradeRecord {
        TradeRecord {
            trade_id: id,
            price: 50_000.0,
            amount: 0.01,
            side: TradeSide::Buy,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn trade_ring_newest_first_and_bounded() {
        let mut cache = TradeCache::default();
        let m = meta();
        for i in 0..150 {
            cache.push(&trade(i, i), &m);
        }
        assert_eq!(cache.len(), TRADE_RING);
        let view = cache.view();
        assert_eq!(view[0].trade_id, 149);
        assert_eq!(view.last().unwrap().trade_id, 50);
    }

    #[test]
    fn trade_duplicate_id_is_skipped() {
        let mut cache = TradeCache::default();
        let m = meta();
        assert!(cache.push(&trade(7, 5), &m).is_some());
        assert!(cache.push(&trade(7, 5), &m).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn trade_view_formats() {
        let mut cache = TradeCache::default();
        let view = cache.push(&trade(1, 1_700_000_000_000), &meta()).unwrap();
        assert_eq!(view.price_formatted, "50000.00");
        assert_eq!(view.amount_formatted, "0.01000000");
        assert_eq!(view.side, "buy");
        assert_eq!(view.display_time.len(), 8);
    }

    // ── Liquidations ────────────────────────────────────────────────────

    fn liq(ts: i64, amount: f64, side: LiquidationSide) -> LiquidationEvent {
        LiquidationEvent {
            side,
            quantity: amount / 2000.0,
            avg_price: 2000.0,
            amount_usdt: amount,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn liquidation_dedup_between_seed_and_live() {
        let mut cache = LiquidationCache::default();
        let m = meta();

        cache.seed(&[liq(5, 1000.0, LiquidationSide::Buy)], &m);
        assert_eq!(cache.len(), 1);

        // The same event arriving live is suppressed.
        assert!(cache.push(&liq(5, 1000.0, LiquidationSide::Buy), &m).is_none());
        assert_eq!(cache.len(), 1);

        // A different side at the same timestamp is a distinct event.
        assert!(cache.push(&liq(5, 1000.0, LiquidationSide::Sell), &m).is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn liquidation_ring_bounded_newest_first() {
        let mut cache = LiquidationCache::default();
        let m = meta();
        for i in 0..80 {
            cache.push(&liq(i, 1000.0 + i as f64 * 10.0, LiquidationSide::Buy), &m);
        }
        assert_eq!(cache.len(), LIQUIDATION_RING);
        let view = cache.view();
        assert_eq!(view[0].timestamp_ms, 79);
    }

    #[test]
    fn liquidation_view_carries_base_asset_and_formats() {
        let mut cache = LiquidationCache::default();
        let view = cache
            .push(&liq(1_700_000_000_000, 1_234_567.0, LiquidationSide::Sell), &meta())
            .unwrap();
        assert_eq!(view.base_asset, "BTC");
        assert_eq!(view.side, "SELL");
        assert_eq!(view.amount_usdt_formatted, "1,234,567.00");
    }

    // ── Ticker ──────────────────────────────────────────────────────────

    #[test]
    fn ticker_replace_and_format() {
        let mut cache = TickerCache::default();
        assert!(cache.view().is_none());

        let view = cache.replace(
            &TickerUpdate {
                last_price: 50_123.456,
                price_change_percent: -2.5,
                high_24h: 51_000.0,
                low_24h: 49_000.0,
                volume_24h: 2_000_000_000.0,
                timestamp_ms: 1,
            },
            &meta(),
        );
        assert_eq!(view.last_price_formatted, "50123.46");
        assert_eq!(view.price_change_percent_formatted, "-2.50");
        assert_eq!(view.volume_24h_formatted, "2.00B");
        assert!(cache.view().is_some());
    }
}
