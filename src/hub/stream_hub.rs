// =============================================================================
// Stream Hub — one upstream connection fanned out to many subscribers
// =============================================================================
//
// One hub per (symbol, kind[, timeframe]). The hub owns the upstream reader
// task, the per-kind cache, and the subscriber table. All merges run under
// the hub lock, which is never held across I/O: the upstream task fetches and
// awaits outside the lock and only locks to mutate the cache and push frames
// into the subscribers' bounded queues.
//
// Lifecycle: lazily connected on the first attach, kept warm through a grace
// period after the last detach (the registry owns the grace timer), torn down
// via the shutdown watch channel.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::VolumeAggregator;
use crate::binance::ws::UpstreamFeed;
use crate::history::{self, HistorySource};
use crate::hub::cache::{
    BookParams, CandleCache, LiquidationCache, OrderBookCache, TickerCache, TradeCache,
};
use crate::hub::HubKey;
use crate::symbols::SymbolMeta;
use crate::types::{
    error_frame, BookSnapshot, Candle, Envelope, ErrorCode, LiquidationEvent, StreamKind,
    TradeRecord, UpstreamEvent,
};

/// Per-subscriber outbound queue depth. Overflow closes the subscriber.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Historical reconciliation budget.
const HISTORICAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Reconnect backoff: base, factor 2, cap.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Consecutive failed connect attempts before the hub gives up until the
/// next attach.
const MAX_CONNECT_FAILURES: u32 = 8;

/// Live events buffered while the historical backlog is loading.
const PENDING_CAP: usize = 10_000;

/// Merge failures within [`MERGE_FAILURE_WINDOW`] that force a reconnect.
const MERGE_FAILURE_LIMIT: usize = 5;
const MERGE_FAILURE_WINDOW: Duration = Duration::from_secs(60);

/// Volume hubs seed this many buckets of history.
const VOLUME_SEED_BUCKETS: i64 = 120;

// =============================================================================
// Subscriber plumbing
// =============================================================================

/// Everything a session hands the hub at attach time.
pub struct SubscriberSpec {
    pub id: Uuid,
    /// Serialized outbound frames; bounded by [`SUBSCRIBER_QUEUE`].
    pub tx: mpsc::Sender<String>,
    /// Fired once when the hub evicts the session (slow consumer).
    pub kill: oneshot::Sender<ErrorCode>,
    /// Order-book aggregation parameters, where applicable.
    pub book_params: Option<BookParams>,
    /// Reported chart width; sizes the candle backlog for the first attacher.
    pub container_width: Option<u32>,
}

struct Subscriber {
    tx: mpsc::Sender<String>,
    kill: Option<oneshot::Sender<ErrorCode>>,
    params: BookParams,
    /// Waiting for the historical load to complete before the first frame.
    awaiting_initial: bool,
}

// =============================================================================
// Hub state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HubPhase {
    /// No subscriber has ever attached.
    Idle,
    /// First attach seen; historical backlog loading, live events buffering.
    Loading,
    /// Backlog merged (or skipped); events flow straight through.
    Streaming,
}

/// Upstream connection lifecycle, surfaced for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    /// Backoff exhausted; retried on the next attach.
    Closed,
}

enum KindCache {
    Book(OrderBookCache),
    Candles(CandleCache),
    Trades(TradeCache),
    Ticker(TickerCache),
    Liquidations(LiquidationCache),
    Volume(VolumeAggregator),
}

/// Historical backlog, fetched per kind.
enum Backlog {
    Book(BookSnapshot),
    Candles(Vec<Candle>),
    Trades(Vec<TradeRecord>),
    Liquidations(Vec<LiquidationEvent>),
    Volume(Vec<LiquidationEvent>),
}

struct HubState {
    phase: HubPhase,
    upstream: UpstreamState,
    cache: KindCache,
    pending: Vec<UpstreamEvent>,
    subscribers: HashMap<Uuid, Subscriber>,
    historical_loaded: bool,
    candle_limit: usize,
    grace_task: Option<JoinHandle<()>>,
    upstream_task: Option<JoinHandle<()>>,
    merge_failures: VecDeque<Instant>,
}

/// Outcome of one ingest step, steering the upstream read loop.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Continue,
    /// Repeated merge failures; drop the connection and resync.
    ForceReconnect,
}

// =============================================================================
// Hub
// =============================================================================

pub struct Hub {
    key: HubKey,
    meta: SymbolMeta,
    feed: Arc<dyn UpstreamFeed>,
    history: Arc<dyn HistorySource>,
    state: Mutex<HubState>,
    shutdown: watch::Sender<bool>,
    /// Counts upstream connections opened over the hub lifetime; lets tests
    /// observe connection sharing and reconnects.
    upstream_opens: AtomicU32,
    default_params: BookParams,
}

impl Hub {
    pub fn new(
        key: HubKey,
        meta: SymbolMeta,
        feed: Arc<dyn UpstreamFeed>,
        history: Arc<dyn HistorySource>,
        max_book_limit: usize,
    ) -> Arc<Self> {
        let cache = match key.kind {
            StreamKind::OrderBook => KindCache::Book(OrderBookCache::default()),
            StreamKind::Candles => KindCache::Candles(CandleCache::new(history::DEFAULT_CANDLE_LIMIT)),
            StreamKind::Trades => KindCache::Trades(TradeCache::default()),
            StreamKind::Ticker => KindCache::Ticker(TickerCache::default()),
            StreamKind::Liquidations => KindCache::Liquidations(LiquidationCache::default()),
            StreamKind::LiquidationVolume => KindCache::Volume(VolumeAggregator::new(
                key.timeframe.expect("volume hubs carry a timeframe"),
            )),
        };

        let default_params = BookParams {
            limit: crate::hub::cache::clamp_book_limit(100, max_book_limit),
            rounding: meta.default_rounding,
        };

        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            key,
            meta,
            feed,
            history,
            state: Mutex::new(HubState {
                phase: HubPhase::Idle,
                upstream: UpstreamState::Idle,
                cache,
                pending: Vec::new(),
                subscribers: HashMap::new(),
                historical_loaded: false,
                candle_limit: history::DEFAULT_CANDLE_LIMIT,
                grace_task: None,
                upstream_task: None,
                merge_failures: VecDeque::new(),
            }),
            shutdown,
            upstream_opens: AtomicU32::new(0),
            default_params,
        })
    }

    pub fn key(&self) -> &HubKey {
        &self.key
    }

    pub fn meta(&self) -> &SymbolMeta {
        &self.meta
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn historical_loaded(&self) -> bool {
        self.state.lock().historical_loaded
    }

    /// Total upstream connections opened; test observer.
    pub fn upstream_opens(&self) -> u32 {
        self.upstream_opens.load(Ordering::Relaxed)
    }

    /// One-shot order-book view from the current cache, for the REST surface.
    pub fn book_view(&self, params: &BookParams) -> Option<serde_json::Value> {
        let state = self.state.lock();
        match &state.cache {
            KindCache::Book(cache) if cache.has_snapshot() => {
                serde_json::to_value(cache.view(&self.meta, params)).ok()
            }
            _ => None,
        }
    }

    // -------------------------------------------------------------------------
    // Attach / detach
    // -------------------------------------------------------------------------

    /// Register a subscriber. The first attach starts the upstream connection
    /// and the historical load; later attaches get the current cache as their
    /// initial frame immediately.
    pub fn attach(self: &Arc<Self>, spec: SubscriberSpec) {
        let mut state = self.state.lock();

        // A new attach inside the grace window cancels the teardown.
        if let Some(grace) = state.grace_task.take() {
            grace.abort();
            debug!(hub = %self.key, "grace shutdown cancelled by new attach");
        }

        let params = spec.book_params.unwrap_or(self.default_params);
        let id = spec.id;
        let mut subscriber = Subscriber {
            tx: spec.tx,
            kill: Some(spec.kill),
            params,
            awaiting_initial: false,
        };

        match state.phase {
            HubPhase::Idle => {
                state.candle_limit = history::candle_limit_for_width(spec.container_width);
                let candle_limit = state.candle_limit;
                if let KindCache::Candles(cache) = &mut state.cache {
                    cache.set_limit(candle_limit);
                }

                if self.key.kind.wants_historical() {
                    subscriber.awaiting_initial = true;
                    state.subscribers.insert(id, subscriber);
                    state.phase = HubPhase::Loading;
                    let hub = self.clone();
                    tokio::spawn(async move { hub.run_initial_load().await });
                } else {
                    state.subscribers.insert(id, subscriber);
                    state.phase = HubPhase::Streaming;
                    self.send_initial_locked(&mut state, id, true);
                }

                self.spawn_upstream_locked(&mut state);
            }
            HubPhase::Loading => {
                subscriber.awaiting_initial = true;
                state.subscribers.insert(id, subscriber);
            }
            HubPhase::Streaming => {
                state.subscribers.insert(id, subscriber);
                self.send_initial_locked(&mut state, id, true);
            }
        }

        // A hub whose backoff was exhausted retries on the next attach.
        if state.upstream == UpstreamState::Closed {
            self.spawn_upstream_locked(&mut state);
        }

        info!(hub = %self.key, subscribers = state.subscribers.len(), "subscriber attached");
    }

    /// Remove a subscriber; returns true when the hub just became empty (the
    /// registry then schedules the grace teardown).
    pub fn detach(&self, id: Uuid) -> bool {
        let mut state = self.state.lock();
        if state.subscribers.remove(&id).is_some() {
            info!(hub = %self.key, subscribers = state.subscribers.len(), "subscriber detached");
        }
        state.subscribers.is_empty()
    }

    /// Store the registry's pending grace task so a later attach can cancel it.
    pub fn set_grace_task(&self, task: JoinHandle<()>) {
        let mut state = self.state.lock();
        if let Some(previous) = state.grace_task.replace(task) {
            previous.abort();
        }
    }

    /// Stop the upstream task and reject further events. Idempotent.
    pub fn teardown(&self) {
        let mut state = self.state.lock();
        let _ = self.shutdown.send(true);
        if let Some(task) = state.upstream_task.take() {
            task.abort();
        }
        if let Some(task) = state.grace_task.take() {
            task.abort();
        }
        state.upstream = UpstreamState::Idle;
        state.phase = HubPhase::Idle;
        info!(hub = %self.key, "hub torn down");
    }

    // -------------------------------------------------------------------------
    // Parameter updates (order book only)
    // -------------------------------------------------------------------------

    /// Apply a session's new order-book parameters. Identical parameters are
    /// a no-op; otherwise the latest snapshot is re-aggregated and exactly one
    /// `initial` frame goes to the requesting session.
    pub fn update_params(&self, id: Uuid, params: BookParams) {
        let mut state = self.state.lock();
        let Some(subscriber) = state.subscribers.get_mut(&id) else {
            return;
        };
        if subscriber.params == params {
            return;
        }
        subscriber.params = params;
        // A session still waiting on the historical load will see the new
        // parameters in its first snapshot; nothing to re-send yet.
        if subscriber.awaiting_initial {
            return;
        }
        debug!(hub = %self.key, session = %id, limit = params.limit, rounding = params.rounding, "book params updated");
        self.send_initial_locked(&mut state, id, true);
    }

    /// Current params for a session (used by the session to merge partial
    /// update_params requests).
    pub fn params_of(&self, id: Uuid) -> Option<BookParams> {
        self.state.lock().subscribers.get(&id).map(|s| s.params)
    }

    // -------------------------------------------------------------------------
    // Initial load
    // -------------------------------------------------------------------------

    async fn run_initial_load(self: Arc<Self>) {
        let backlog = match tokio::time::timeout(HISTORICAL_TIMEOUT, self.fetch_backlog()).await {
            Ok(Ok(backlog)) => Some(backlog),
            Ok(Err(e)) => {
                warn!(hub = %self.key, error = %e, "historical fetch failed, going live-only");
                None
            }
            Err(_) => {
                warn!(hub = %self.key, "historical fetch timed out, going live-only");
                None
            }
        };

        let mut state = self.state.lock();

        if let Some(backlog) = backlog {
            self.seed_cache_locked(&mut state, backlog);
            state.historical_loaded = true;
        }

        // Everyone who attached during the load gets the initial snapshot
        // first, then the buffered live events replay through the merge path.
        let waiting: Vec<Uuid> = state
            .subscribers
            .iter()
            .filter(|(_, s)| s.awaiting_initial)
            .map(|(id, _)| *id)
            .collect();
        for id in waiting {
            self.send_initial_locked(&mut state, id, true);
            if let Some(sub) = state.subscribers.get_mut(&id) {
                sub.awaiting_initial = false;
            }
        }

        let pending = std::mem::take(&mut state.pending);
        let buffered = pending.len();
        for event in pending {
            if let Err(e) = self.merge_and_emit_locked(&mut state, event) {
                warn!(hub = %self.key, error = %e, "merge failed while draining backlog");
            }
        }
        state.phase = HubPhase::Streaming;

        info!(
            hub = %self.key,
            historical = state.historical_loaded,
            buffered,
            "historical reconciliation complete"
        );
    }

    async fn fetch_backlog(&self) -> Result<Backlog> {
        let symbol = &self.meta.exchange_id;
        match self.key.kind {
            StreamKind::OrderBook => {
                let limit = self.default_params.limit;
                let snapshot = self.history.depth(symbol, limit).await?;
                Ok(Backlog::Book(snapshot))
            }
            StreamKind::Candles => {
                let tf = self.key.timeframe.context("candle hub without timeframe")?;
                let limit = self.state.lock().candle_limit;
                Ok(Backlog::Candles(self.history.candles(symbol, tf, limit).await?))
            }
            StreamKind::Trades => Ok(Backlog::Trades(
                self.history.trades(symbol, history::TRADE_BACKLOG).await?,
            )),
            StreamKind::Liquidations => Ok(Backlog::Liquidations(
                self.history
                    .liquidations(symbol, history::LIQUIDATION_BACKLOG)
                    .await?,
            )),
            StreamKind::LiquidationVolume => {
                let tf = self.key.timeframe.context("volume hub without timeframe")?;
                let end_ms = chrono::Utc::now().timestamp_millis();
                let start_ms = end_ms - tf.ms() * VOLUME_SEED_BUCKETS;
                Ok(Backlog::Volume(
                    self.history
                        .liquidations_range(symbol, start_ms, end_ms)
                        .await?,
                ))
            }
            StreamKind::Ticker => anyhow::bail!("ticker streams have no backlog"),
        }
    }

    fn seed_cache_locked(&self, state: &mut HubState, backlog: Backlog) {
        match (&mut state.cache, backlog) {
            (KindCache::Book(cache), Backlog::Book(snapshot)) => cache.replace(snapshot),
            (KindCache::Candles(cache), Backlog::Candles(candles)) => cache.seed(candles),
            (KindCache::Trades(cache), Backlog::Trades(trades)) => {
                cache.seed(&trades, &self.meta)
            }
            (KindCache::Liquidations(cache), Backlog::Liquidations(events)) => {
                cache.seed(&events, &self.meta)
            }
            (KindCache::Volume(agg), Backlog::Volume(events)) => agg.seed(&events),
            _ => error!(hub = %self.key, "backlog kind mismatch"),
        }
    }

    // -------------------------------------------------------------------------
    // Upstream lifecycle
    // -------------------------------------------------------------------------

    fn spawn_upstream_locked(self: &Arc<Self>, state: &mut HubState) {
        if let Some(previous) = state.upstream_task.take() {
            previous.abort();
        }
        state.upstream = UpstreamState::Connecting;
        let hub = self.clone();
        state.upstream_task = Some(tokio::spawn(async move { hub.run_upstream().await }));
    }

    async fn run_upstream(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut consecutive_failures: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }

            // Backoff only after failed attempts; a clean drop reconnects at
            // once.
            if consecutive_failures > 0 {
                let delay = backoff_delay(consecutive_failures);
                debug!(hub = %self.key, attempt = consecutive_failures, delay_ms = delay.as_millis() as u64, "reconnect backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => return,
                }
            }

            let reconnecting = self.upstream_opens() > 0;
            self.state.lock().upstream = if reconnecting {
                UpstreamState::Reconnecting
            } else {
                UpstreamState::Connecting
            };

            let mut conn = match self
                .feed
                .open(&self.meta.exchange_id, self.key.kind, self.key.timeframe)
                .await
            {
                Ok(conn) => conn,
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(hub = %self.key, error = %e, attempt = consecutive_failures, "upstream connect failed");
                    if consecutive_failures >= MAX_CONNECT_FAILURES {
                        error!(hub = %self.key, "upstream backoff exhausted");
                        let mut state = self.state.lock();
                        state.upstream = UpstreamState::Closed;
                        let frame = error_frame(
                            ErrorCode::UpstreamUnavailable,
                            "upstream connection could not be established",
                        )
                        .to_string();
                        self.broadcast_raw_locked(&mut state, &frame);
                        return;
                    }
                    continue;
                }
            };

            self.upstream_opens.fetch_add(1, Ordering::Relaxed);
            consecutive_failures = 0;
            self.state.lock().upstream = UpstreamState::Open;

            // On a true reconnect the cache may have gone stale while the
            // socket was down; restore coherence before reading frames.
            if reconnecting {
                self.resync().await;
            }

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        conn.close();
                        return;
                    }
                    event = conn.next() => match event {
                        Some(UpstreamEvent::Disconnected { reason }) => {
                            warn!(hub = %self.key, reason = %reason, "upstream disconnected");
                            break;
                        }
                        Some(event) => {
                            if self.ingest(event) == IngestOutcome::ForceReconnect {
                                conn.close();
                                break;
                            }
                        }
                        None => {
                            warn!(hub = %self.key, "upstream stream drained");
                            break;
                        }
                    }
                }
            }

            self.state.lock().upstream = UpstreamState::Reconnecting;
        }
    }

    /// Restore cache coherence after a reconnect and re-send `initial` to
    /// every attached session. Liquidation rings are intentionally not
    /// refetched: their dedup set already covers the overlap window.
    async fn resync(&self) {
        let symbol = self.meta.exchange_id.clone();

        match self.key.kind {
            StreamKind::OrderBook => {
                let limit = self.default_params.limit;
                match self.history.depth(&symbol, limit).await {
                    Ok(snapshot) => {
                        let mut state = self.state.lock();
                        if let KindCache::Book(cache) = &mut state.cache {
                            cache.replace(snapshot);
                        }
                    }
                    Err(e) => warn!(hub = %self.key, error = %e, "book resync fetch failed"),
                }
            }
            StreamKind::Candles => {
                let tf = self.key.timeframe.expect("candle hub carries a timeframe");
                let limit = self.state.lock().candle_limit;
                match self.history.candles(&symbol, tf, limit).await {
                    Ok(candles) => {
                        let mut state = self.state.lock();
                        if let KindCache::Candles(cache) = &mut state.cache {
                            cache.seed(candles);
                        }
                        state.historical_loaded = true;
                    }
                    Err(e) => warn!(hub = %self.key, error = %e, "candle resync fetch failed"),
                }
            }
            StreamKind::Trades => {
                match self.history.trades(&symbol, history::TRADE_BACKLOG).await {
                    Ok(trades) => {
                        let mut state = self.state.lock();
                        if let KindCache::Trades(cache) = &mut state.cache {
                            cache.seed(&trades, &self.meta);
                        }
                        state.historical_loaded = true;
                    }
                    Err(e) => warn!(hub = %self.key, error = %e, "trade resync fetch failed"),
                }
            }
            StreamKind::LiquidationVolume => {
                let tf = self.key.timeframe.expect("volume hub carries a timeframe");
                let end_ms = chrono::Utc::now().timestamp_millis();
                let start_ms = end_ms - tf.ms() * VOLUME_SEED_BUCKETS;
                match self.history.liquidations_range(&symbol, start_ms, end_ms).await {
                    Ok(events) => {
                        let mut state = self.state.lock();
                        if let KindCache::Volume(agg) = &mut state.cache {
                            agg.seed(&events);
                        }
                    }
                    Err(e) => warn!(hub = %self.key, error = %e, "volume resync fetch failed"),
                }
            }
            StreamKind::Liquidations | StreamKind::Ticker => {}
        }

        // Fresh initial to everyone already streaming; clients treat it as
        // authoritative. Sessions still inside the first historical load get
        // theirs when the load completes.
        let mut state = self.state.lock();
        let ids: Vec<Uuid> = state
            .subscribers
            .iter()
            .filter(|(_, s)| !s.awaiting_initial)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.send_initial_locked(&mut state, id, true);
        }
        info!(hub = %self.key, "resync complete");
    }

    // -------------------------------------------------------------------------
    // Merge & emit
    // -------------------------------------------------------------------------

    /// Feed one upstream event through the hub. Called from the upstream
    /// reader task; buffers during the historical load, merges otherwise.
    pub fn ingest(&self, event: UpstreamEvent) -> IngestOutcome {
        let mut state = self.state.lock();

        if state.phase == HubPhase::Loading {
            if state.pending.len() >= PENDING_CAP {
                warn!(hub = %self.key, "pending buffer full, dropping oldest live event");
                state.pending.remove(0);
            }
            state.pending.push(event);
            return IngestOutcome::Continue;
        }

        if let Err(e) = self.merge_and_emit_locked(&mut state, event) {
            warn!(hub = %self.key, error = %e, "merge step failed");
            let now = Instant::now();
            state.merge_failures.push_back(now);
            while let Some(front) = state.merge_failures.front() {
                if now.duration_since(*front) > MERGE_FAILURE_WINDOW {
                    state.merge_failures.pop_front();
                } else {
                    break;
                }
            }
            if state.merge_failures.len() >= MERGE_FAILURE_LIMIT {
                error!(hub = %self.key, "repeated merge failures, forcing reconnect");
                state.merge_failures.clear();
                let frame =
                    error_frame(ErrorCode::Internal, "stream error, resynchronising").to_string();
                self.broadcast_raw_locked(&mut state, &frame);
                return IngestOutcome::ForceReconnect;
            }
        }
        IngestOutcome::Continue
    }

    fn merge_and_emit_locked(&self, state: &mut HubState, event: UpstreamEvent) -> Result<()> {
        match event {
            UpstreamEvent::Book(snapshot) => {
                if let KindCache::Book(cache) = &mut state.cache {
                    // When no backlog seeded the book, the first real snapshot
                    // is the subscriber's initial authoritative view.
                    let first_contentful = !cache.is_populated();
                    cache.replace(snapshot);
                    self.emit_book_views_locked(state, first_contentful)?;
                }
            }
            UpstreamEvent::Trade(record) => {
                if let KindCache::Trades(cache) = &mut state.cache {
                    if let Some(view) = cache.push(&record, &self.meta) {
                        let data = serde_json::to_value(view)?;
                        self.broadcast_locked(state, false, true, data);
                    }
                }
            }
            UpstreamEvent::Candle(candle) => {
                if let KindCache::Candles(cache) = &mut state.cache {
                    let changed = cache.upsert(candle);
                    let data = serde_json::to_value(changed)?;
                    self.broadcast_locked(state, false, true, data);
                }
            }
            UpstreamEvent::Ticker(update) => {
                if let KindCache::Ticker(cache) = &mut state.cache {
                    let view = cache.replace(&update, &self.meta);
                    let data = serde_json::to_value(view)?;
                    self.broadcast_locked(state, false, false, data);
                }
            }
            UpstreamEvent::Liquidation(event) => match &mut state.cache {
                KindCache::Liquidations(cache) => {
                    if let Some(view) = cache.push(&event, &self.meta) {
                        let data = serde_json::to_value(view)?;
                        self.broadcast_locked(state, false, true, data);
                    }
                }
                KindCache::Volume(agg) => {
                    let bucket = agg.apply(&event);
                    let data = serde_json::to_value(bucket)?;
                    self.broadcast_locked(state, false, true, data);
                }
                _ => {}
            },
            UpstreamEvent::Disconnected { .. } => {}
        }
        Ok(())
    }

    /// Send the current cache to one subscriber with `initial` semantics.
    fn send_initial_locked(&self, state: &mut HubState, id: Uuid, initial: bool) {
        let Some(subscriber) = state.subscribers.get(&id) else {
            return;
        };

        let data = match &state.cache {
            KindCache::Book(cache) => {
                serde_json::to_value(cache.view(&self.meta, &subscriber.params)).ok()
            }
            KindCache::Candles(cache) => serde_json::to_value(cache.view()).ok(),
            KindCache::Trades(cache) => serde_json::to_value(cache.view()).ok(),
            KindCache::Ticker(cache) => match cache.view() {
                Some(view) => serde_json::to_value(view).ok(),
                None => Some(serde_json::Value::Null),
            },
            KindCache::Liquidations(cache) => serde_json::to_value(cache.view()).ok(),
            KindCache::Volume(agg) => serde_json::to_value(agg.snapshot()).ok(),
        };
        let Some(data) = data else {
            warn!(hub = %self.key, "failed to serialise initial snapshot");
            return;
        };

        let envelope = Envelope::new(
            self.key.kind,
            &self.meta.display_id,
            self.key.timeframe,
            initial,
            false,
            data,
        );
        match serde_json::to_string(&envelope) {
            Ok(frame) => self.send_to_locked(state, id, frame),
            Err(e) => warn!(hub = %self.key, error = %e, "failed to serialise initial frame"),
        }
    }

    /// Emit per-session order-book views (each session has its own params).
    fn emit_book_views_locked(&self, state: &mut HubState, initial: bool) -> Result<()> {
        let KindCache::Book(cache) = &state.cache else {
            return Ok(());
        };

        let mut frames: Vec<(Uuid, String)> = Vec::with_capacity(state.subscribers.len());
        for (id, subscriber) in &state.subscribers {
            if subscriber.awaiting_initial {
                continue;
            }
            let view = cache.view(&self.meta, &subscriber.params);
            let envelope = Envelope::new(
                self.key.kind,
                &self.meta.display_id,
                self.key.timeframe,
                initial,
                false,
                serde_json::to_value(view)?,
            );
            frames.push((*id, serde_json::to_string(&envelope)?));
        }

        for (id, frame) in frames {
            self.send_to_locked(state, id, frame);
        }
        Ok(())
    }

    /// Emit one identical envelope to every subscriber not still waiting for
    /// its initial snapshot.
    fn broadcast_locked(
        &self,
        state: &mut HubState,
        initial: bool,
        is_update: bool,
        data: serde_json::Value,
    ) {
        let envelope = Envelope::new(
            self.key.kind,
            &self.meta.display_id,
            self.key.timeframe,
            initial,
            is_update,
            data,
        );
        let frame = match serde_json::to_string(&envelope) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(hub = %self.key, error = %e, "failed to serialise frame");
                return;
            }
        };

        let ids: Vec<Uuid> = state
            .subscribers
            .iter()
            .filter(|(_, s)| !s.awaiting_initial)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.send_to_locked(state, id, frame.clone());
        }
    }

    /// Send a pre-serialized non-envelope frame (error frames) to everyone.
    fn broadcast_raw_locked(&self, state: &mut HubState, frame: &str) {
        let ids: Vec<Uuid> = state.subscribers.keys().copied().collect();
        for id in ids {
            self.send_to_locked(state, id, frame.to_string());
        }
    }

    /// Push one frame into a subscriber's queue. A full queue means the
    /// session is too slow: it is evicted and killed, others are unaffected.
    fn send_to_locked(&self, state: &mut HubState, id: Uuid, frame: String) {
        let Some(subscriber) = state.subscribers.get_mut(&id) else {
            return;
        };
        match subscriber.tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(hub = %self.key, session = %id, "subscriber queue full, evicting slow consumer");
                if let Some(mut slow) = state.subscribers.remove(&id) {
                    if let Some(kill) = slow.kill.take() {
                        let _ = kill.send(ErrorCode::SlowConsumer);
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(hub = %self.key, session = %id, "subscriber channel closed, removing");
                state.subscribers.remove(&id);
            }
        }
    }
}

/// Exponential backoff with jitter: base 1 s, factor 2, cap 30 s.
fn backoff_delay(consecutive_failures: u32) -> Duration {
    let exp = consecutive_failures.saturating_sub(1).min(16);
    let base = BACKOFF_BASE
        .saturating_mul(2u32.saturating_pow(exp))
        .min(BACKOFF_CAP);
    let jitter = base.mul_f64(rand::random::<f64>() * 0.2);
    base + jitter
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LiquidationSide, Timeframe, TradeSide};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    // ── Test doubles ────────────────────────────────────────────────────

    /// Feed whose connections are driven by the test.
    struct MockFeed {
        senders: PlMutex<Vec<mpsc::Sender<UpstreamEvent>>>,
        fail_connects: AtomicU32,
    }

    impl MockFeed {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                senders: PlMutex::new(Vec::new()),
                fail_connects: AtomicU32::new(0),
            })
        }

        /// Push an event into the most recent connection.
        async fn send(&self, event: UpstreamEvent) {
            let tx = self
                .senders
                .lock()
                .last()
                .cloned()
                .expect("no open connection");
            tx.send(event).await.expect("hub dropped connection");
        }

        fn connections(&self) -> usize {
            self.senders.lock().len()
        }
    }

    #[async_trait]
    impl UpstreamFeed for MockFeed {
        async fn open(
            &self,
            _symbol: &str,
            _kind: StreamKind,
            _timeframe: Option<Timeframe>,
        ) -> Result<crate::binance::ws::FeedConnection> {
            if self.fail_connects.load(Ordering::Relaxed) > 0 {
                self.fail_connects.fetch_sub(1, Ordering::Relaxed);
                anyhow::bail!("mock connect failure");
            }
            let (tx, rx) = mpsc::channel(512);
            self.senders.lock().push(tx);
            Ok(crate::binance::ws::FeedConnection::new(rx, None))
        }
    }

    /// History with configurable payloads and an optional artificial delay so
    /// tests can land live events inside the reconciliation window.
    #[derive(Default)]
    struct MockHistory {
        trades: Vec<TradeRecord>,
        liquidations: Vec<LiquidationEvent>,
        candles: Vec<Candle>,
        delay: Option<Duration>,
        fail: bool,
    }

    #[async_trait]
    impl HistorySource for MockHistory {
        async fn depth(&self, _symbol: &str, _limit: usize) -> Result<BookSnapshot> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("mock history failure");
            }
            Ok(BookSnapshot::default())
        }

        async fn candles(
            &self,
            _symbol: &str,
            _tf: Timeframe,
            _limit: usize,
        ) -> Result<Vec<Candle>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("mock history failure");
            }
            Ok(self.candles.clone())
        }

        async fn trades(&self, _symbol: &str, _limit: usize) -> Result<Vec<TradeRecord>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("mock history failure");
            }
            Ok(self.trades.clone())
        }

        async fn liquidations(&self, _symbol: &str, _limit: usize) -> Result<Vec<LiquidationEvent>> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                anyhow::bail!("mock history failure");
            }
            Ok(self.liquidations.clone())
        }

        async fn liquidations_range(
            &self,
            _symbol: &str,
            _start_ms: i64,
            _end_ms: i64,
        ) -> Result<Vec<LiquidationEvent>> {
            if self.fail {
                anyhow::bail!("mock history failure");
            }
            Ok(self.liquidations.clone())
        }
    }

    fn meta() -> SymbolMeta {
        SymbolMeta {
            display_id: "BTCUSDT".into(),
            exchange_id: "BTCUSDT".into(),
            base_asset: "BTC".into(),
            quote_asset: "USDT".into(),
            price_precision: 2,
            amount_precision: 8,
            rounding_ladder: vec![0.01, 0.1, 1.0, 10.0, 100.0],
            default_rounding: 0.1,
            volume_24h: None,
            last_price: 50_000.0,
        }
    }

    fn trade(id: i64, ts: i64) -> TradeRecord {
        TradeRecord {
            trade_id: id,
            price: 50_000.0,
            amount: 0.01,
            side: TradeSide::Buy,
            timestamp_ms: ts,
        }
    }

    fn liq(ts: i64, amount: f64, side: LiquidationSide) -> LiquidationEvent {
        LiquidationEvent {
            side,
            quantity: amount / 2_000.0,
            avg_price: 2_000.0,
            amount_usdt: amount,
            timestamp_ms: ts,
        }
    }

    struct TestSession {
        id: Uuid,
        rx: mpsc::Receiver<String>,
        kill: oneshot::Receiver<ErrorCode>,
    }

    fn subscribe(hub: &Arc<Hub>, queue: usize) -> TestSession {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(queue);
        let (kill_tx, kill_rx) = oneshot::channel();
        hub.attach(SubscriberSpec {
            id,
            tx,
            kill: kill_tx,
            book_params: Some(BookParams {
                limit: 20,
                rounding: 0.1,
            }),
            container_width: None,
        });
        TestSession {
            id,
            rx,
            kill: kill_rx,
        }
    }

    async fn next_frame(session: &mut TestSession) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), session.rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("channel closed");
        serde_json::from_str(&frame).expect("frame is JSON")
    }

    fn hub_for(
        kind: StreamKind,
        timeframe: Option<Timeframe>,
        feed: Arc<MockFeed>,
        history: MockHistory,
    ) -> Arc<Hub> {
        Hub::new(
            HubKey::new("BTCUSDT", kind, timeframe),
            meta(),
            feed,
            Arc::new(history),
            1000,
        )
    }

    // ── Scenarios ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_frame_is_initial_and_historical_precedes_live() {
        let feed = MockFeed::new();
        let history = MockHistory {
            trades: vec![trade(1, 5), trade(2, 7)],
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let hub = hub_for(StreamKind::Trades, None, feed.clone(), history);
        let mut session = subscribe(&hub, SUBSCRIBER_QUEUE);

        // Wait for the upstream connection, then land a duplicate and a fresh
        // trade inside the reconciliation window.
        tokio::time::sleep(Duration::from_millis(20)).await;
        feed.send(UpstreamEvent::Trade(trade(2, 7))).await;
        feed.send(UpstreamEvent::Trade(trade(3, 9))).await;

        let first = next_frame(&mut session).await;
        assert_eq!(first["initial"], true);
        assert_eq!(first["isUpdate"], false);
        let ids: Vec<i64> = first["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["tradeId"].as_i64().unwrap())
            .collect();
        // Newest first, duplicates not yet present.
        assert_eq!(ids, vec![2, 1]);

        // The buffered live events drain next: T2 was deduplicated, so the
        // only live frame carries T3.
        let second = next_frame(&mut session).await;
        assert_eq!(second["initial"], false);
        assert_eq!(second["isUpdate"], true);
        assert_eq!(second["data"]["tradeId"], 3);

        assert!(hub.historical_loaded());
        assert_eq!(hub.upstream_opens(), 1);
    }

    #[tokio::test]
    async fn concurrent_attachers_share_one_upstream_connection() {
        let feed = MockFeed::new();
        let hub = hub_for(StreamKind::Trades, None, feed.clone(), MockHistory::default());

        let mut a = subscribe(&hub, SUBSCRIBER_QUEUE);
        let mut b = subscribe(&hub, SUBSCRIBER_QUEUE);

        // Both get their initial frame.
        assert_eq!(next_frame(&mut a).await["initial"], true);
        assert_eq!(next_frame(&mut b).await["initial"], true);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.upstream_opens(), 1);
        assert_eq!(feed.connections(), 1);

        feed.send(UpstreamEvent::Trade(trade(10, 100))).await;
        assert_eq!(next_frame(&mut a).await["data"]["tradeId"], 10);
        assert_eq!(next_frame(&mut b).await["data"]["tradeId"], 10);
    }

    #[tokio::test]
    async fn historical_failure_degrades_to_live_only() {
        let feed = MockFeed::new();
        let history = MockHistory {
            fail: true,
            ..Default::default()
        };
        let hub = hub_for(StreamKind::Trades, None, feed.clone(), history);
        let mut session = subscribe(&hub, SUBSCRIBER_QUEUE);

        // Initial still arrives, just empty.
        let first = next_frame(&mut session).await;
        assert_eq!(first["initial"], true);
        assert_eq!(first["data"].as_array().unwrap().len(), 0);
        assert!(!hub.historical_loaded());

        tokio::time::sleep(Duration::from_millis(20)).await;
        feed.send(UpstreamEvent::Trade(trade(1, 1))).await;
        assert_eq!(next_frame(&mut session).await["data"]["tradeId"], 1);
    }

    #[tokio::test]
    async fn liquidation_overlap_collapses_to_one_entry_and_one_frame() {
        let feed = MockFeed::new();
        let history = MockHistory {
            liquidations: vec![liq(60_000, 2_000.0, LiquidationSide::Buy)],
            ..Default::default()
        };
        let hub = hub_for(StreamKind::Liquidations, None, feed.clone(), history);
        let mut session = subscribe(&hub, SUBSCRIBER_QUEUE);

        let first = next_frame(&mut session).await;
        assert_eq!(first["initial"], true);
        assert_eq!(first["data"].as_array().unwrap().len(), 1);

        // The same event arrives live; it must not produce a second frame.
        tokio::time::sleep(Duration::from_millis(20)).await;
        feed.send(UpstreamEvent::Liquidation(liq(60_000, 2_000.0, LiquidationSide::Buy)))
            .await;
        // A distinct event afterwards is the next thing the session sees.
        feed.send(UpstreamEvent::Liquidation(liq(90_000, 4_000.0, LiquidationSide::Sell)))
            .await;

        let second = next_frame(&mut session).await;
        assert_eq!(second["isUpdate"], true);
        assert_eq!(second["data"]["timestampMs"], 90_000);
    }

    #[tokio::test]
    async fn volume_buckets_accumulate_and_emit_single_bucket_updates() {
        let feed = MockFeed::new();
        let hub = hub_for(
            StreamKind::LiquidationVolume,
            Some(Timeframe::M1),
            feed.clone(),
            MockHistory::default(),
        );
        let mut session = subscribe(&hub, SUBSCRIBER_QUEUE);

        let first = next_frame(&mut session).await;
        assert_eq!(first["initial"], true);
        assert_eq!(first["isUpdate"], false);

        tokio::time::sleep(Duration::from_millis(20)).await;
        feed.send(UpstreamEvent::Liquidation(liq(60_000, 2_000.0, LiquidationSide::Buy)))
            .await;
        feed.send(UpstreamEvent::Liquidation(liq(90_000, 4_000.0, LiquidationSide::Sell)))
            .await;

        let update1 = next_frame(&mut session).await;
        assert_eq!(update1["isUpdate"], true);
        assert_eq!(update1["data"]["bucketOpenMs"], 60_000);
        assert_eq!(update1["data"]["buyVolumeUsdt"], 2_000.0);

        let update2 = next_frame(&mut session).await;
        assert_eq!(update2["data"]["bucketOpenMs"], 60_000);
        assert_eq!(update2["data"]["buyVolumeUsdt"], 2_000.0);
        assert_eq!(update2["data"]["sellVolumeUsdt"], 4_000.0);
        assert_eq!(update2["data"]["total"], 6_000.0);
        assert_eq!(update2["data"]["delta"], -2_000.0);
        assert_eq!(update2["data"]["count"], 2);
    }

    #[tokio::test]
    async fn book_param_update_reaggregates_for_one_session_only() {
        let feed = MockFeed::new();
        let hub = hub_for(StreamKind::OrderBook, None, feed.clone(), MockHistory::default());
        let mut a = subscribe(&hub, SUBSCRIBER_QUEUE);
        let mut b = subscribe(&hub, SUBSCRIBER_QUEUE);

        // Initial snapshots (seeded from the mock depth fetch).
        next_frame(&mut a).await;
        next_frame(&mut b).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        // The mock backlog was an empty book, so the first contentful
        // snapshot arrives flagged initial.
        feed.send(UpstreamEvent::Book(BookSnapshot {
            timestamp_ms: 1,
            bids: vec![(50_000.0, 1.0), (49_999.0, 2.0)],
            asks: vec![(50_001.0, 3.0)],
        }))
        .await;
        let live_a = next_frame(&mut a).await;
        assert_eq!(live_a["initial"], true);
        assert_eq!(live_a["data"]["rounding"], 0.1);
        assert_eq!(live_a["data"]["bids"][0]["priceFormatted"], "50000.0");
        assert_eq!(live_a["data"]["bids"][0]["amountFormatted"], "1.00000000");
        next_frame(&mut b).await;

        // Later snapshots are plain replacements.
        feed.send(UpstreamEvent::Book(BookSnapshot {
            timestamp_ms: 2,
            bids: vec![(50_000.0, 1.5)],
            asks: vec![(50_001.0, 3.0)],
        }))
        .await;
        assert_eq!(next_frame(&mut a).await["initial"], false);
        next_frame(&mut b).await;

        // A changes params: exactly one initial frame to A, nothing to B.
        let new_params = BookParams {
            limit: 50,
            rounding: 1.0,
        };
        hub.update_params(a.id, new_params);
        let reagg = next_frame(&mut a).await;
        assert_eq!(reagg["initial"], true);
        assert_eq!(reagg["data"]["rounding"], 1.0);
        assert_eq!(reagg["data"]["limit"], 50);

        // Identical repeat is a no-op.
        hub.update_params(a.id, new_params);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.rx.try_recv().is_err());
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_consumer_is_evicted_while_fast_consumer_streams_on() {
        let feed = MockFeed::new();
        let hub = hub_for(StreamKind::Trades, None, feed.clone(), MockHistory::default());

        let mut fast = subscribe(&hub, SUBSCRIBER_QUEUE);
        // B's queue holds two frames and is never drained.
        let mut slow = subscribe(&hub, 2);

        next_frame(&mut fast).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..20 {
            feed.send(UpstreamEvent::Trade(trade(i, i))).await;
        }

        // Fast consumer sees every trade in order.
        for i in 0..20 {
            let frame = next_frame(&mut fast).await;
            assert_eq!(frame["data"]["tradeId"], i);
        }

        let code = tokio::time::timeout(Duration::from_secs(2), &mut slow.kill)
            .await
            .expect("timed out waiting for kill")
            .expect("kill channel dropped");
        assert_eq!(code, ErrorCode::SlowConsumer);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn reconnect_refetches_and_reemits_initial() {
        let feed = MockFeed::new();
        let history = MockHistory {
            trades: vec![trade(1, 1)],
            ..Default::default()
        };
        let hub = hub_for(StreamKind::Trades, None, feed.clone(), history);
        let mut session = subscribe(&hub, SUBSCRIBER_QUEUE);

        next_frame(&mut session).await; // initial
        tokio::time::sleep(Duration::from_millis(20)).await;

        feed.send(UpstreamEvent::Trade(trade(5, 5))).await;
        assert_eq!(next_frame(&mut session).await["data"]["tradeId"], 5);

        // Kill the connection; a clean drop reconnects immediately.
        feed.send(UpstreamEvent::Disconnected {
            reason: "test kill".into(),
        })
        .await;

        let resync = next_frame(&mut session).await;
        assert_eq!(resync["initial"], true);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hub.upstream_opens(), 2);
        assert_eq!(feed.connections(), 2);

        // Live events flow again on the new connection.
        feed.send(UpstreamEvent::Trade(trade(9, 9))).await;
        assert_eq!(next_frame(&mut session).await["data"]["tradeId"], 9);
    }

    #[tokio::test]
    async fn detach_leaves_cache_warm_until_teardown() {
        let feed = MockFeed::new();
        let hub = hub_for(StreamKind::Trades, None, feed.clone(), MockHistory::default());

        let mut a = subscribe(&hub, SUBSCRIBER_QUEUE);
        next_frame(&mut a).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(hub.detach(a.id));
        assert_eq!(hub.subscriber_count(), 0);

        // Events during the grace window keep merging into the cache.
        feed.send(UpstreamEvent::Trade(trade(1, 1))).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A re-attach within grace sees the warm cache.
        let mut b = subscribe(&hub, SUBSCRIBER_QUEUE);
        let first = next_frame(&mut b).await;
        assert_eq!(first["initial"], true);
        assert_eq!(first["data"].as_array().unwrap().len(), 1);
        assert_eq!(hub.upstream_opens(), 1);
    }

    #[tokio::test]
    async fn backoff_delay_grows_and_caps() {
        assert!(backoff_delay(1) >= Duration::from_secs(1));
        assert!(backoff_delay(1) < Duration::from_millis(1300));
        assert!(backoff_delay(3) >= Duration::from_secs(4));
        assert!(backoff_delay(10) <= Duration::from_secs(36));
    }
}
