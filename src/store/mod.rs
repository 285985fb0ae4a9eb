// =============================================================================
// Series store — the single mutable source of truth for market data
// =============================================================================
//
// Writers never touch the live map directly. Updates land in a pending buffer
// and a flush loop applies them in arrival order every `flush_interval_ms`,
// so a burst of push frames costs one map write per symbol per tick instead
// of one per frame.
// =============================================================================

pub mod series;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::indicator::IndicatorSet;
use crate::types::{now_ms, ConnStatus};

pub use series::{Candle, CandleSeries, KlineSource, MAX_SERIES_HARD_CAP};

/// TTL sweep cadence. The TTL itself is configurable; the sweep is not.
const TTL_SWEEP_INTERVAL_MS: u64 = 30_000;

// =============================================================================
// Snapshot types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepthBook {
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
}

/// Partial update for one symbol's snapshot. `None` means "leave unchanged";
/// present fields overwrite.
#[derive(Debug, Clone, Default)]
pub struct SnapshotPatch {
    pub last_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
    pub next_funding_time_ms: Option<i64>,
    pub high_24h: Option<Decimal>,
    pub low_24h: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub quote_volume_24h: Option<Decimal>,
    pub change_pct: Option<Decimal>,
    pub depth: Option<DepthBook>,
    pub indicators: Option<IndicatorSet>,
}

impl SnapshotPatch {
    /// Overlay `newer` on top of `self`: present fields of `newer` win.
    fn absorb(&mut self, newer: SnapshotPatch) {
        macro_rules! take {
            ($field:ident) => {
                if newer.$field.is_some() {
                    self.$field = newer.$field;
                }
            };
        }
        take!(last_price);
        take!(index_price);
        take!(funding_rate);
        take!(next_funding_time_ms);
        take!(high_24h);
        take!(low_24h);
        take!(volume_24h);
        take!(quote_volume_24h);
        take!(change_pct);
        take!(depth);
        take!(indicators);
    }
}

/// Full per-symbol market state. Created lazily on first write, evicted under
/// cache pressure.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
    pub next_funding_time_ms: Option<i64>,
    pub high_24h: Option<Decimal>,
    pub low_24h: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub quote_volume_24h: Option<Decimal>,
    pub change_pct: Option<Decimal>,
    pub depth: Option<DepthBook>,
    pub klines: HashMap<String, CandleSeries>,
    pub indicators: Option<IndicatorSet>,
    pub last_updated_ms: i64,
}

// =============================================================================
// Events
// =============================================================================

/// Emitted after a flush whenever a series actually changed. Consumers (the
/// indicator pool) react to these instead of being called inline, so a slow
/// consumer can never stall the ingestion path.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    KlinesMerged { symbol: String, timeframe: String },
}

// =============================================================================
// Pending buffer
// =============================================================================

#[derive(Debug)]
struct PendingKlines {
    timeframe: String,
    candles: Vec<Candle>,
    source: KlineSource,
    enforce_limit: bool,
}

#[derive(Debug, Default)]
struct PendingEntry {
    patch: SnapshotPatch,
    klines: Vec<PendingKlines>,
}

/// Keeps first-arrival order across symbols so a flush replays writes the way
/// they came in.
#[derive(Debug, Default)]
struct PendingBuffer {
    entries: HashMap<String, PendingEntry>,
    order: Vec<String>,
}

impl PendingBuffer {
    fn entry(&mut self, symbol: &str) -> &mut PendingEntry {
        if !self.entries.contains_key(symbol) {
            self.order.push(symbol.to_string());
        }
        self.entries.entry(symbol.to_string()).or_default()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn take(&mut self) -> (HashMap<String, PendingEntry>, Vec<String>) {
        (
            std::mem::take(&mut self.entries),
            std::mem::take(&mut self.order),
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheMeta {
    last_accessed_ms: i64,
    created_at_ms: i64,
}

// =============================================================================
// SeriesStore
// =============================================================================

pub struct SeriesStore {
    data: RwLock<HashMap<String, MarketSnapshot>>,
    meta: Mutex<HashMap<String, CacheMeta>>,
    pending: Mutex<PendingBuffer>,
    cache_size: usize,
    ttl_ms: i64,
    configured_kline_limit: usize,
    events: broadcast::Sender<StoreEvent>,
    status_tx: watch::Sender<ConnStatus>,
}

impl SeriesStore {
    pub fn new(cache_size: usize, ttl_ms: i64, configured_kline_limit: usize) -> Self {
        let (events, _) = broadcast::channel(256);
        let (status_tx, _) = watch::channel(ConnStatus::Disconnected);
        Self {
            data: RwLock::new(HashMap::new()),
            meta: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingBuffer::default()),
            cache_size,
            ttl_ms,
            configured_kline_limit,
            events,
            status_tx,
        }
    }

    // ── write API (buffered, never suspends) ─────────────────────────────

    pub fn update_symbol(&self, symbol: &str, patch: SnapshotPatch) {
        {
            let mut pending = self.pending.lock();
            pending.entry(symbol).patch.absorb(patch);
        }
        self.flush_if_overflowing();
    }

    pub fn update_symbol_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        candles: Vec<Candle>,
        source: KlineSource,
        enforce_limit: bool,
    ) {
        if candles.is_empty() {
            return;
        }
        {
            let mut pending = self.pending.lock();
            pending.entry(symbol).klines.push(PendingKlines {
                timeframe: timeframe.to_string(),
                candles,
                source,
                enforce_limit,
            });
        }
        self.flush_if_overflowing();
    }

    /// Stall defence: if the flush loop falls behind and the buffer piles up,
    /// apply immediately rather than letting it grow without bound.
    fn flush_if_overflowing(&self) {
        let overflowing = self.pending.lock().len() > 5 * self.cache_size;
        if overflowing {
            warn!("store pending buffer overflow, forcing flush");
            self.flush();
        }
    }

    // ── flush ────────────────────────────────────────────────────────────

    /// Apply every buffered update in arrival order, then enforce the cache
    /// cap. A failure applying one symbol is logged and does not affect the
    /// others.
    pub fn flush(&self) {
        let (mut entries, order) = self.pending.lock().take();
        if entries.is_empty() {
            return;
        }

        let mut merged_events: Vec<StoreEvent> = Vec::new();
        for symbol in order {
            let Some(entry) = entries.remove(&symbol) else {
                continue;
            };
            if let Err(err) = self.apply_entry(&symbol, entry, &mut merged_events) {
                warn!(symbol = %symbol, error = %err, "failed to apply buffered update");
            }
        }
        self.enforce_cache_limit();

        // Events go out after the locks are released.
        for event in merged_events {
            let _ = self.events.send(event);
        }
    }

    fn apply_entry(
        &self,
        symbol: &str,
        entry: PendingEntry,
        merged_events: &mut Vec<StoreEvent>,
    ) -> anyhow::Result<()> {
        if symbol.is_empty() {
            anyhow::bail!("empty symbol");
        }
        self.touch(symbol);

        let mut data = self.data.write();
        let snapshot = data
            .entry(symbol.to_string())
            .or_insert_with(|| MarketSnapshot {
                symbol: symbol.to_string(),
                ..MarketSnapshot::default()
            });
        snapshot.last_updated_ms = now_ms();

        let patch = entry.patch;
        macro_rules! apply {
            ($field:ident) => {
                if let Some(v) = patch.$field {
                    snapshot.$field = Some(v);
                }
            };
        }
        apply!(last_price);
        apply!(index_price);
        apply!(funding_rate);
        apply!(next_funding_time_ms);
        apply!(high_24h);
        apply!(low_24h);
        apply!(volume_24h);
        apply!(quote_volume_24h);
        apply!(change_pct);
        apply!(depth);
        apply!(indicators);

        for batch in entry.klines {
            let series = snapshot.klines.entry(batch.timeframe.clone()).or_default();
            let len = series.merge(
                &batch.candles,
                self.configured_kline_limit,
                batch.enforce_limit,
            );
            debug!(
                symbol = %symbol,
                timeframe = %batch.timeframe,
                source = %batch.source,
                merged = batch.candles.len(),
                total = len,
                "klines merged"
            );
            merged_events.push(StoreEvent::KlinesMerged {
                symbol: symbol.to_string(),
                timeframe: batch.timeframe,
            });
        }
        Ok(())
    }

    // ── reads ────────────────────────────────────────────────────────────

    pub fn snapshot(&self, symbol: &str) -> Option<MarketSnapshot> {
        let snap = self.data.read().get(symbol).cloned();
        if snap.is_some() {
            self.touch(symbol);
        }
        snap
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.data.read().contains_key(symbol)
    }

    pub fn symbol_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn last_updated_ms(&self, symbol: &str) -> Option<i64> {
        self.data.read().get(symbol).map(|s| s.last_updated_ms)
    }

    pub fn series_candles(&self, symbol: &str, timeframe: &str) -> Option<Vec<Candle>> {
        self.data
            .read()
            .get(symbol)
            .and_then(|s| s.klines.get(timeframe))
            .map(|series| series.candles().to_vec())
    }

    pub fn series_len(&self, symbol: &str, timeframe: &str) -> usize {
        self.data
            .read()
            .get(symbol)
            .and_then(|s| s.klines.get(timeframe))
            .map(|series| series.len())
            .unwrap_or(0)
    }

    pub fn series_oldest_time(&self, symbol: &str, timeframe: &str) -> Option<i64> {
        self.data
            .read()
            .get(symbol)
            .and_then(|s| s.klines.get(timeframe))
            .and_then(|series| series.oldest_time())
    }

    // ── connectivity status ──────────────────────────────────────────────

    pub fn set_status(&self, status: ConnStatus) {
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!(from = %current, to = %status, "push connectivity changed");
            *current = status;
            true
        });
    }

    pub fn status(&self) -> ConnStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnStatus> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // ── eviction ─────────────────────────────────────────────────────────

    fn touch(&self, symbol: &str) {
        let now = now_ms();
        let mut meta = self.meta.lock();
        let created = meta.get(symbol).map(|m| m.created_at_ms).unwrap_or(now);
        meta.insert(
            symbol.to_string(),
            CacheMeta {
                last_accessed_ms: now,
                created_at_ms: created,
            },
        );
    }

    fn enforce_cache_limit(&self) {
        let mut data = self.data.write();
        let mut meta = self.meta.lock();
        while data.len() > self.cache_size {
            let lru = meta
                .iter()
                .filter(|(symbol, _)| data.contains_key(*symbol))
                .min_by_key(|(_, m)| m.last_accessed_ms)
                .map(|(symbol, _)| symbol.clone());
            match lru {
                Some(symbol) => {
                    meta.remove(&symbol);
                    data.remove(&symbol);
                    debug!(symbol = %symbol, "evicted LRU symbol");
                }
                None => {
                    // Metadata out of sync with the data map; drop an
                    // arbitrary entry so the cap still holds.
                    if let Some(symbol) = data.keys().next().cloned() {
                        data.remove(&symbol);
                        warn!(symbol = %symbol, "evicted symbol without LRU metadata");
                    }
                    break;
                }
            }
        }
    }

    fn sweep_ttl(&self) {
        let now = now_ms();
        let stale: Vec<String> = {
            let meta = self.meta.lock();
            meta.iter()
                .filter(|(_, m)| now - m.last_accessed_ms > self.ttl_ms)
                .map(|(symbol, _)| symbol.clone())
                .collect()
        };
        if stale.is_empty() {
            return;
        }
        let mut data = self.data.write();
        let mut meta = self.meta.lock();
        for symbol in &stale {
            data.remove(symbol);
            meta.remove(symbol);
        }
        info!(count = stale.len(), "TTL sweep removed idle symbols");
    }

    // ── loops ────────────────────────────────────────────────────────────

    pub async fn run_flush_loop(self: Arc<Self>, flush_interval_ms: u64) {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(flush_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.flush();
        }
    }

    pub async fn run_ttl_sweep(self: Arc<Self>) {
        let mut tick = tokio::time::interval(std::time::Duration::from_millis(TTL_SWEEP_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.sweep_ttl();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
