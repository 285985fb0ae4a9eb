// =============================================================================
// Pull scheduler — REST polling, gap detection, and history backfill
// =============================================================================
//
// The push stream is the primary feed; polling only covers the gaps. Every
// second the scheduler looks at registered interest, skips symbols whose push
// data is fresh, and schedules bounded, staggered REST fetches for the rest.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::exchange::{FetchPriority, MarketApi, TickerData};
use crate::gateway::PushGateway;
use crate::persist::CandleStorage;
use crate::store::{Candle, KlineSource, SeriesStore, SnapshotPatch};
use crate::types::{interval_ms, kline_timeframe, now_ms, ConnStatus, RateLimitedLog};

const POLL_TICK_MS: u64 = 1_000;
/// Subscription self-heal cadence, in poll ticks.
const SYNC_EVERY_TICKS: u64 = 5;
/// A lock claimed at poll start expires here if the task hangs. Must exceed
/// the REST timeout so the request is torn down before the lock is reclaimed.
const PROACTIVE_LOCK_RELEASE_MS: i64 = 15_000;
/// A pending poll older than this is presumed dead and its bookkeeping is
/// reclaimed.
const ZOMBIE_TIMEOUT_MS: i64 = 20_000;
/// Emergency bound on the lock map.
const LOCK_MAP_LIMIT: usize = 200;
const STAGGER_MIN_MS: u64 = 20;
const STAGGER_MAX_MS: u64 = 200;
/// Exchange page maximum for kline requests.
const HISTORY_PAGE_LIMIT: usize = 1_000;
const MAX_BACKFILL_PAGES: usize = 30;
const BACKFILL_PAUSE_MS: u64 = 100;
/// Cap on synthesized flat candles per gap-fill pass.
pub const MAX_GAP_FILL: usize = 500;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub concurrency_cap: usize,
    pub staleness_ms: i64,
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            concurrency_cap: 6,
            staleness_ms: 10_000,
            history_limit: 1_000,
        }
    }
}

#[derive(Debug)]
struct PendingPoll {
    generation: Uuid,
    started_at_ms: i64,
}

enum PollOutcome {
    Ticker(TickerData),
    Klines { timeframe: String, candles: Vec<Candle> },
    Nothing,
}

// =============================================================================
// PullScheduler
// =============================================================================

pub struct PullScheduler {
    store: Arc<SeriesStore>,
    api: Arc<dyn MarketApi>,
    storage: Arc<dyn CandleStorage>,
    gateway: Arc<PushGateway>,
    config: SchedulerConfig,
    /// symbol -> channel -> interest count
    registrations: Mutex<HashMap<String, HashMap<String, u32>>>,
    /// `symbol:channel` -> locked-until wall clock ms
    fetch_locks: Mutex<HashMap<String, i64>>,
    history_locks: Mutex<HashSet<String>>,
    pending: Mutex<HashMap<String, PendingPoll>>,
    /// Synthetic timeframes currently held at the gateway, for diffing.
    synced_synthetic: Mutex<HashSet<(String, String)>>,
    in_flight: AtomicUsize,
    /// Shared by routine polling and history fetches, so backfill can never
    /// starve the poll budget (or vice versa).
    limiter: Arc<Semaphore>,
    sync_count: AtomicU64,
    running: AtomicBool,
    poll_error_log: RateLimitedLog,
}

impl PullScheduler {
    pub fn new(
        store: Arc<SeriesStore>,
        api: Arc<dyn MarketApi>,
        storage: Arc<dyn CandleStorage>,
        gateway: Arc<PushGateway>,
        mut config: SchedulerConfig,
    ) -> Arc<Self> {
        config.poll_interval_secs = config.poll_interval_secs.max(2);
        let cap = config.concurrency_cap.max(1);
        Arc::new(Self {
            store,
            api,
            storage,
            gateway,
            config,
            registrations: Mutex::new(HashMap::new()),
            fetch_locks: Mutex::new(HashMap::new()),
            history_locks: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            synced_synthetic: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            limiter: Arc::new(Semaphore::new(cap)),
            sync_count: AtomicU64::new(0),
            running: AtomicBool::new(false),
            poll_error_log: RateLimitedLog::new(10_000),
        })
    }

    // ── registration ─────────────────────────────────────────────────────

    /// Declare interest in `(symbol, channel)`. The first registration for a
    /// channel triggers one subscription sync, an immediate poll, and (for
    /// kline channels) a history load.
    pub fn register(self: &Arc<Self>, symbol: &str, channel: &str) {
        if symbol.is_empty() {
            return;
        }
        let symbol = crate::adapter::normalize_symbol(symbol);
        let first = {
            let mut registrations = self.registrations.lock();
            let channels = registrations.entry(symbol.clone()).or_default();
            let count = channels.entry(channel.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if !first {
            return;
        }

        self.sync_subscriptions();

        if let Some(tf) = kline_timeframe(channel) {
            let this = Arc::clone(self);
            let (symbol_owned, tf_owned) = (symbol.clone(), tf.to_string());
            tokio::spawn(async move {
                this.ensure_history(&symbol_owned, &tf_owned).await;
            });
        }
        self.schedule_poll(&symbol, channel);
    }

    /// Release interest. The last release removes the channel (and the symbol
    /// once empty) and triggers exactly one sync pass.
    pub fn unregister(self: &Arc<Self>, symbol: &str, channel: &str) {
        if symbol.is_empty() {
            return;
        }
        let symbol = crate::adapter::normalize_symbol(symbol);
        let removed = {
            let mut registrations = self.registrations.lock();
            let Some(channels) = registrations.get_mut(&symbol) else {
                return;
            };
            let Some(count) = channels.get_mut(channel) else {
                return;
            };
            if *count > 1 {
                *count -= 1;
                false
            } else {
                channels.remove(channel);
                if channels.is_empty() {
                    registrations.remove(&symbol);
                }
                true
            }
        };
        if removed {
            self.sync_subscriptions();
        }
    }

    pub fn active_symbols(&self) -> Vec<String> {
        self.registrations.lock().keys().cloned().collect()
    }

    /// Safety valve for desynced ref counts: drop all interest and locks.
    pub fn force_cleanup(self: &Arc<Self>) {
        warn!("force cleanup: clearing registrations and locks");
        self.registrations.lock().clear();
        self.fetch_locks.lock().clear();
        self.pending.lock().clear();
        self.in_flight.store(0, Ordering::SeqCst);
        self.sync_subscriptions();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.fetch_locks.lock().clear();
        self.pending.lock().clear();
        self.in_flight.store(0, Ordering::SeqCst);
    }

    /// Total subscription sync passes, observable so callers can assert the
    /// register/unregister contract.
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    // ── subscription sync ────────────────────────────────────────────────

    fn sync_subscriptions(&self) {
        self.sync_count.fetch_add(1, Ordering::SeqCst);

        let mut intended: HashSet<(String, String)> = HashSet::new();
        let mut synthetic: HashSet<(String, String)> = HashSet::new();
        {
            let registrations = self.registrations.lock();
            for (symbol, channels) in registrations.iter() {
                for channel in channels.keys() {
                    match kline_timeframe(channel) {
                        Some(tf) if crate::types::provider_interval(tf).is_none() => {
                            synthetic.insert((symbol.clone(), tf.to_string()));
                        }
                        _ => {
                            intended.insert((symbol.clone(), channel.clone()));
                        }
                    }
                }
            }
        }

        self.gateway.sync(intended);

        // Synthetic timeframes ride their own ref counts at the gateway.
        let mut synced = self.synced_synthetic.lock();
        let to_add: Vec<_> = synthetic.difference(&synced).cloned().collect();
        let to_remove: Vec<_> = synced.difference(&synthetic).cloned().collect();
        for (symbol, tf) in &to_add {
            self.gateway.subscribe_synthetic(symbol, tf);
        }
        for (symbol, tf) in &to_remove {
            self.gateway.unsubscribe_synthetic(symbol, tf);
        }
        *synced = synthetic;
    }

    // ── polling loop ─────────────────────────────────────────────────────

    pub async fn run(self: Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            cap = self.config.concurrency_cap,
            "pull scheduler running"
        );
        let mut tick = tokio::time::interval(Duration::from_millis(POLL_TICK_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;
        loop {
            tick.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                info!("pull scheduler stopped");
                return;
            }
            ticks += 1;
            self.prune_zombies();
            self.poll_cycle();
            if ticks % SYNC_EVERY_TICKS == 0 {
                // Self-healing: re-assert subscriptions periodically.
                self.sync_subscriptions();
            }
        }
    }

    /// One pass of gap detection: pick unlocked `(symbol, channel)` pairs
    /// whose push data is stale and schedule up to the free concurrency
    /// budget.
    pub fn poll_cycle(self: &Arc<Self>) {
        let now = now_ms();
        {
            let mut locks = self.fetch_locks.lock();
            locks.retain(|_, until| *until > now);
            if locks.len() > LOCK_MAP_LIMIT {
                warn!(count = locks.len(), "pruning stale fetch locks");
                locks.clear();
                self.in_flight.store(0, Ordering::SeqCst);
            }
        }

        let allowed = self
            .config
            .concurrency_cap
            .saturating_sub(self.in_flight.load(Ordering::SeqCst));
        if allowed == 0 {
            return;
        }

        let connected = self.store.status() == ConnStatus::Connected;
        let mut tasks: Vec<(String, String)> = Vec::new();
        {
            let registrations = self.registrations.lock();
            let locks = self.fetch_locks.lock();
            for (symbol, channels) in registrations.iter() {
                // Fresh push data means the websocket covers this symbol.
                let last_update = self.store.last_updated_ms(symbol).unwrap_or(0);
                if connected && now - last_update < self.config.staleness_ms {
                    continue;
                }
                for channel in channels.keys() {
                    let key = format!("{symbol}:{channel}");
                    if locks.get(&key).map_or(false, |until| *until > now) {
                        continue;
                    }
                    tasks.push((symbol.clone(), channel.clone()));
                }
            }
        }

        for (symbol, channel) in tasks.into_iter().take(allowed) {
            self.schedule_poll(&symbol, &channel);
        }
    }

    /// Claim the lock and bookkeeping for one poll and spawn the fetch.
    pub fn schedule_poll(self: &Arc<Self>, symbol: &str, channel: &str) {
        let key = format!("{symbol}:{channel}");
        let now = now_ms();
        {
            let mut locks = self.fetch_locks.lock();
            if locks.get(&key).map_or(false, |until| *until > now) {
                return;
            }
            locks.insert(key.clone(), now + PROACTIVE_LOCK_RELEASE_MS);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let generation = Uuid::new_v4();
        let superseded = self.pending.lock().insert(
            key.clone(),
            PendingPoll {
                generation,
                started_at_ms: now,
            },
        );
        // A record still present here means its poll outlived the proactive
        // lock without settling. Its late completion will see a generation
        // mismatch and step aside, and the pruner can no longer find the old
        // record, so the in-flight slot must be settled now.
        if superseded.is_some() {
            warn!(key = %key, "superseding unsettled poll");
            let _ = self
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(1))
                });
        }

        let this = Arc::clone(self);
        let (symbol, channel) = (symbol.to_string(), channel.to_string());
        tokio::spawn(async move {
            // Stagger so a full cycle does not land as one burst.
            let stagger = rand::thread_rng().gen_range(STAGGER_MIN_MS..=STAGGER_MAX_MS);
            tokio::time::sleep(Duration::from_millis(stagger)).await;

            let outcome = {
                let _permit = this.limiter.acquire().await;
                this.fetch_channel(&symbol, &channel).await
            };
            this.finish_poll(&key, generation, &symbol, outcome).await;
        });
    }

    async fn fetch_channel(&self, symbol: &str, channel: &str) -> Result<PollOutcome> {
        match channel {
            "price" | "ticker" => {
                let ticker = self
                    .api
                    .fetch_ticker(symbol, FetchPriority::Normal)
                    .await
                    .with_context(|| format!("ticker poll failed for {symbol}"))?;
                Ok(PollOutcome::Ticker(ticker))
            }
            _ => match kline_timeframe(channel) {
                Some(tf) if crate::types::provider_interval(tf).is_some() => {
                    let candles = self
                        .api
                        .fetch_klines(symbol, tf, HISTORY_PAGE_LIMIT, None, None)
                        .await
                        .with_context(|| format!("kline poll failed for {symbol} {tf}"))?;
                    let candles = match interval_ms(tf) {
                        Some(step) => fill_gaps(&candles, step),
                        None => candles,
                    };
                    Ok(PollOutcome::Klines {
                        timeframe: tf.to_string(),
                        candles,
                    })
                }
                // Depth and synthetic timeframes have no REST fallback; the
                // lock cycle still runs so the pair is not rescheduled every
                // tick.
                _ => Ok(PollOutcome::Nothing),
            },
        }
    }

    /// Completion protocol: whoever removes the pending record settles the
    /// in-flight counter, exactly once. A late completion whose record was
    /// already reclaimed by the zombie pruner must neither write to the store
    /// nor decrement again.
    async fn finish_poll(
        &self,
        key: &str,
        generation: Uuid,
        symbol: &str,
        outcome: Result<PollOutcome>,
    ) {
        let owns_completion = {
            let mut pending = self.pending.lock();
            match pending.get(key) {
                Some(p) if p.generation == generation => {
                    pending.remove(key);
                    true
                }
                _ => false,
            }
        };
        if !owns_completion {
            debug!(key, "late poll completion discarded");
            return;
        }

        match outcome {
            Ok(PollOutcome::Ticker(ticker)) => {
                self.store.update_symbol(symbol, ticker_patch(ticker));
            }
            Ok(PollOutcome::Klines { timeframe, candles }) => {
                if !candles.is_empty() {
                    self.store.update_symbol_klines(
                        symbol,
                        &timeframe,
                        candles.clone(),
                        KlineSource::Rest,
                        true,
                    );
                    self.storage.save_candles(symbol, &timeframe, &candles).await;
                }
            }
            Ok(PollOutcome::Nothing) => {}
            Err(err) => {
                if self.poll_error_log.allow() {
                    warn!(key, error = %err, "polling error");
                }
            }
        }

        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v.saturating_sub(1))
            });
        // Re-allow polling for this pair after the configured interval.
        self.fetch_locks.lock().insert(
            key.to_string(),
            now_ms() + (self.config.poll_interval_secs as i64) * 1_000,
        );
    }

    /// Reclaim bookkeeping from polls that never completed. The completion
    /// path will find its record gone and step aside.
    pub fn prune_zombies(&self) {
        let now = now_ms();
        let stale: Vec<String> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, p)| now - p.started_at_ms > ZOMBIE_TIMEOUT_MS)
                .map(|(key, _)| key.clone())
                .collect()
        };
        for key in stale {
            if self.pending.lock().remove(&key).is_none() {
                continue;
            }
            warn!(key = %key, "reclaiming zombie poll");
            self.fetch_locks.lock().remove(&key);
            let _ = self
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(1))
                });
        }
    }

    // ── history ──────────────────────────────────────────────────────────

    /// Bring a series up to the configured history depth: persisted candles
    /// first, then the newest REST page, then bounded backfill of older
    /// windows anchored on the oldest known timestamp.
    pub async fn ensure_history(self: &Arc<Self>, symbol: &str, tf: &str) {
        let lock_key = format!("{symbol}:{tf}");
        if !self.history_locks.lock().insert(lock_key.clone()) {
            debug!(symbol, tf, "history load already in progress");
            return;
        }
        if let Err(err) = self.ensure_history_inner(symbol, tf).await {
            warn!(symbol, tf, error = %err, "history load failed");
        }
        self.history_locks.lock().remove(&lock_key);
    }

    async fn ensure_history_inner(&self, symbol: &str, tf: &str) -> Result<()> {
        let stored = self.storage.load_candles(symbol, tf).await;
        if !stored.is_empty() {
            debug!(symbol, tf, count = stored.len(), "loaded persisted candles");
            self.store
                .update_symbol_klines(symbol, tf, stored, KlineSource::Rest, true);
            self.store.flush();
        }

        // Synthetic timeframes are built from the push stream and only ever
        // hydrate from persisted candles.
        if crate::types::provider_interval(tf).is_none() {
            debug!(symbol, tf, "timeframe has no REST interval, skipping fetch");
            return Ok(());
        }

        let page = {
            let _permit = self.limiter.acquire().await;
            self.api
                .fetch_klines(symbol, tf, HISTORY_PAGE_LIMIT, None, None)
                .await?
        };
        if page.is_empty() {
            return Ok(());
        }
        let filled = match interval_ms(tf) {
            Some(step) => fill_gaps(&page, step),
            None => page,
        };
        self.store
            .update_symbol_klines(symbol, tf, filled.clone(), KlineSource::Rest, true);
        self.store.flush();
        self.storage.save_candles(symbol, tf, &filled).await;

        // Backfill older pages only when the configured depth genuinely
        // exceeds one page.
        let target = self.config.history_limit;
        if target <= HISTORY_PAGE_LIMIT {
            return Ok(());
        }
        let mut oldest = match self.store.series_oldest_time(symbol, tf) {
            Some(t) => t,
            None => return Ok(()),
        };
        let mut pages = 0;
        while self.store.series_len(symbol, tf) < target && pages < MAX_BACKFILL_PAGES {
            pages += 1;
            let older = {
                let _permit = self.limiter.acquire().await;
                self.api
                    .fetch_klines(symbol, tf, HISTORY_PAGE_LIMIT, Some(oldest), None)
                    .await?
            };
            if older.is_empty() {
                break;
            }
            let new_oldest = older[0].time_ms;
            self.store
                .update_symbol_klines(symbol, tf, older.clone(), KlineSource::Rest, true);
            self.store.flush();
            self.storage.save_candles(symbol, tf, &older).await;

            // Non-advancing anchor means the API is repeating itself.
            if new_oldest >= oldest {
                break;
            }
            oldest = new_oldest;
            tokio::time::sleep(Duration::from_millis(BACKFILL_PAUSE_MS)).await;
        }
        info!(
            symbol,
            tf,
            total = self.store.series_len(symbol, tf),
            pages,
            "history ensured"
        );
        Ok(())
    }

    /// Fetch one page older than the current oldest candle, growing the
    /// series past the configured limit. Returns whether anything new landed.
    pub async fn load_more_history(self: &Arc<Self>, symbol: &str, tf: &str) -> bool {
        let lock_key = format!("more:{symbol}:{tf}");
        {
            let mut locks = self.history_locks.lock();
            if locks.contains(&format!("{symbol}:{tf}")) || !locks.insert(lock_key.clone()) {
                return false;
            }
        }
        let loaded = self.load_more_inner(symbol, tf).await;
        self.history_locks.lock().remove(&lock_key);
        loaded
    }

    async fn load_more_inner(&self, symbol: &str, tf: &str) -> bool {
        let Some(oldest) = self.store.series_oldest_time(symbol, tf) else {
            return false;
        };
        let older = {
            let _permit = self.limiter.acquire().await;
            self.api
                .fetch_klines(symbol, tf, HISTORY_PAGE_LIMIT, Some(oldest), None)
                .await
        };
        match older {
            Ok(candles) if !candles.is_empty() => {
                self.store
                    .update_symbol_klines(symbol, tf, candles, KlineSource::Rest, false);
                self.store.flush();
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!(symbol, tf, error = %err, "load-more failed");
                false
            }
        }
    }
}

fn ticker_patch(ticker: TickerData) -> SnapshotPatch {
    SnapshotPatch {
        last_price: ticker.last_price,
        high_24h: ticker.high_24h,
        low_24h: ticker.low_24h,
        volume_24h: ticker.volume_24h,
        quote_volume_24h: ticker.quote_volume_24h,
        change_pct: ticker.change_pct,
        ..Default::default()
    }
}

// =============================================================================
// Gap filling
// =============================================================================

/// Replace missing buckets with flat candles carrying the previous close and
/// zero volume, so consumers see a continuous series. Input may be unsorted;
/// duplicate timestamps are dropped and never produce fills.
pub fn fill_gaps(candles: &[Candle], step_ms: i64) -> Vec<Candle> {
    if step_ms <= 0 {
        error!(step_ms, "invalid interval for gap fill");
        return candles.to_vec();
    }
    if candles.is_empty() {
        return Vec::new();
    }

    let mut sorted = candles.to_vec();
    sorted.sort_by_key(|c| c.time_ms);

    let mut out: Vec<Candle> = Vec::with_capacity(sorted.len());
    let mut filled = 0usize;
    for candle in sorted {
        if let Some(prev) = out.last() {
            if candle.time_ms <= prev.time_ms {
                continue;
            }
            let prev_close = prev.close;
            let mut expected = prev.time_ms + step_ms;
            while expected < candle.time_ms && filled < MAX_GAP_FILL {
                out.push(Candle::flat(expected, prev_close));
                filled += 1;
                expected += step_ms;
            }
        }
        out.push(candle);
    }
    if filled > 0 {
        debug!(filled, "synthesized flat candles for gaps");
    }
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::GatewayConfig;
    use crate::persist::MemoryStorage;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn candle(time_ms: i64, close: Decimal) -> Candle {
        Candle {
            time_ms,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
        }
    }

    struct StaticApi {
        klines: Vec<Candle>,
    }

    #[async_trait]
    impl MarketApi for StaticApi {
        async fn fetch_ticker(&self, _symbol: &str, _priority: FetchPriority) -> Result<TickerData> {
            Ok(TickerData {
                last_price: Some(dec!(100)),
                ..Default::default()
            })
        }

        async fn fetch_klines(
            &self,
            _symbol: &str,
            _timeframe: &str,
            _limit: usize,
            end_time_ms: Option<i64>,
            _start_time_ms: Option<i64>,
        ) -> Result<Vec<Candle>> {
            // Backfill requests get nothing so history loads terminate.
            if end_time_ms.is_some() {
                return Ok(Vec::new());
            }
            Ok(self.klines.clone())
        }
    }

    fn scheduler_with(api: Arc<dyn MarketApi>) -> Arc<PullScheduler> {
        let store = Arc::new(SeriesStore::new(20, 600_000, 1_000));
        let gateway = PushGateway::new(Arc::clone(&store), GatewayConfig::default());
        PullScheduler::new(
            store,
            api,
            Arc::new(MemoryStorage::new()),
            gateway,
            SchedulerConfig::default(),
        )
    }

    // ── fill_gaps ────────────────────────────────────────────────────────

    #[test]
    fn fill_gaps_synthesizes_flat_candles() {
        let step = 60_000;
        let t0 = 1_000_000_000_000;
        let input = vec![candle(t0, dec!(102)), candle(t0 + 3 * step, dec!(106))];

        let filled = fill_gaps(&input, step);
        assert_eq!(filled.len(), 4);
        assert_eq!(filled[1].time_ms, t0 + step);
        assert_eq!(filled[1].open, dec!(102));
        assert_eq!(filled[1].high, dec!(102));
        assert_eq!(filled[1].low, dec!(102));
        assert_eq!(filled[1].close, dec!(102));
        assert_eq!(filled[1].volume, Decimal::ZERO);
        assert_eq!(filled[2].time_ms, t0 + 2 * step);
        assert_eq!(filled[3], input[1]);
    }

    #[test]
    fn fill_gaps_sorts_unsorted_input() {
        let step = 60_000;
        let input = vec![candle(2 * step, dec!(2)), candle(0, dec!(1))];
        let filled = fill_gaps(&input, step);
        assert_eq!(filled.len(), 3);
        assert_eq!(filled[0].time_ms, 0);
        assert_eq!(filled[1].close, dec!(1));
        assert_eq!(filled[2].time_ms, 2 * step);
    }

    #[test]
    fn fill_gaps_rejects_nonpositive_interval() {
        let input = vec![candle(0, dec!(1)), candle(180_000, dec!(2))];
        assert_eq!(fill_gaps(&input, 0), input);
        assert_eq!(fill_gaps(&input, -60_000), input);
    }

    #[test]
    fn fill_gaps_drops_duplicates_without_filling() {
        let step = 60_000;
        let input = vec![candle(0, dec!(1)), candle(0, dec!(9)), candle(step, dec!(2))];
        let filled = fill_gaps(&input, step);
        assert_eq!(filled.len(), 2);
        assert_eq!(filled[0].time_ms, 0);
        assert_eq!(filled[1].time_ms, step);
    }

    #[test]
    fn fill_gaps_caps_synthesized_candles() {
        let step = 60_000;
        let input = vec![
            candle(0, dec!(1)),
            candle((MAX_GAP_FILL as i64 + 100) * step, dec!(2)),
        ];
        let filled = fill_gaps(&input, step);
        assert_eq!(filled.len(), 2 + MAX_GAP_FILL);
    }

    // ── registration ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn register_refcounts_and_syncs_once_per_transition() {
        let sched = scheduler_with(Arc::new(StaticApi { klines: vec![] }));

        sched.register("BTCUSDT", "price");
        let after_first = sched.sync_count();
        assert_eq!(after_first, 1);

        // Second registration of the same pair must not sync again.
        sched.register("BTCUSDT", "price");
        assert_eq!(sched.sync_count(), after_first);
        assert_eq!(sched.active_symbols(), vec!["BTCUSDT".to_string()]);

        // First release: still one holder, no sync.
        sched.unregister("BTCUSDT", "price");
        assert_eq!(sched.sync_count(), after_first);

        // Last release: symbol gone, exactly one more sync.
        sched.unregister("BTCUSDT", "price");
        assert_eq!(sched.sync_count(), after_first + 1);
        assert!(sched.active_symbols().is_empty());

        // Unregistering an unknown pair is a no-op.
        sched.unregister("BTCUSDT", "price");
        assert_eq!(sched.sync_count(), after_first + 1);
    }

    #[tokio::test]
    async fn register_normalizes_symbols() {
        let sched = scheduler_with(Arc::new(StaticApi { klines: vec![] }));
        sched.register("btc", "price");
        assert_eq!(sched.active_symbols(), vec!["BTCUSDT".to_string()]);
    }

    #[tokio::test]
    async fn poll_cycle_arbitrates_between_push_and_pull() {
        let sched = scheduler_with(Arc::new(StaticApi { klines: vec![] }));
        sched
            .registrations
            .lock()
            .entry("BTCUSDT".to_string())
            .or_default()
            .insert("price".to_string(), 1);

        // Connected with a fresh snapshot: the push stream covers the pair,
        // so nothing is scheduled.
        sched.store.set_status(ConnStatus::Connected);
        sched.store.update_symbol(
            "BTCUSDT",
            SnapshotPatch {
                last_price: Some(dec!(1)),
                ..Default::default()
            },
        );
        sched.store.flush();
        sched.poll_cycle();
        assert!(sched.fetch_locks.lock().is_empty());
        assert_eq!(sched.in_flight(), 0);

        // Connected but with no data yet for a second pair: stale, polled.
        sched
            .registrations
            .lock()
            .entry("ETHUSDT".to_string())
            .or_default()
            .insert("price".to_string(), 1);
        sched.poll_cycle();
        assert!(sched.fetch_locks.lock().contains_key("ETHUSDT:price"));
        assert!(!sched.fetch_locks.lock().contains_key("BTCUSDT:price"));

        // Disconnected: freshness no longer counts, REST takes over.
        sched.store.set_status(ConnStatus::Disconnected);
        sched.poll_cycle();
        assert!(sched.fetch_locks.lock().contains_key("BTCUSDT:price"));
    }

    // ── zombie protocol ──────────────────────────────────────────────────

    #[tokio::test]
    async fn zombie_prune_reclaims_and_late_completion_steps_aside() {
        let sched = scheduler_with(Arc::new(StaticApi { klines: vec![] }));
        let key = "BTCUSDT:price".to_string();
        let generation = Uuid::new_v4();

        sched.fetch_locks.lock().insert(key.clone(), now_ms() + 15_000);
        sched.pending.lock().insert(
            key.clone(),
            PendingPoll {
                generation,
                started_at_ms: now_ms() - ZOMBIE_TIMEOUT_MS - 1,
            },
        );
        sched.in_flight.store(1, Ordering::SeqCst);

        sched.prune_zombies();
        assert_eq!(sched.in_flight(), 0);
        assert!(sched.pending.lock().is_empty());
        assert!(sched.fetch_locks.lock().is_empty());

        // The late completion finds its record gone: no store write, no
        // second decrement.
        sched
            .finish_poll(
                &key,
                generation,
                "BTCUSDT",
                Ok(PollOutcome::Ticker(TickerData {
                    last_price: Some(dec!(42)),
                    ..Default::default()
                })),
            )
            .await;
        assert_eq!(sched.in_flight(), 0);
        sched.store.flush();
        assert!(sched.store.snapshot("BTCUSDT").is_none());
    }

    #[tokio::test]
    async fn rescheduling_over_stale_pending_settles_its_slot() {
        let sched = scheduler_with(Arc::new(StaticApi { klines: vec![] }));
        let key = "BTCUSDT:price".to_string();
        let old_generation = Uuid::new_v4();

        // A poll whose proactive lock has expired but whose record has not
        // yet aged past the zombie threshold.
        sched.pending.lock().insert(
            key.clone(),
            PendingPoll {
                generation: old_generation,
                started_at_ms: now_ms() - 16_000,
            },
        );
        sched.in_flight.store(1, Ordering::SeqCst);

        sched.schedule_poll("BTCUSDT", "price");
        // The superseded record's slot is settled immediately; only the new
        // poll remains in flight.
        assert_eq!(sched.in_flight(), 1);
        let new_generation = sched.pending.lock().get(&key).unwrap().generation;
        assert_ne!(new_generation, old_generation);

        // The stale poll's late completion steps aside without a second
        // decrement.
        sched
            .finish_poll(&key, old_generation, "BTCUSDT", Ok(PollOutcome::Nothing))
            .await;
        assert_eq!(sched.in_flight(), 1);

        // Once the live poll completes nothing is left in flight, and the
        // pruner finds nothing to reclaim.
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if sched.in_flight() == 0 {
                break;
            }
        }
        assert_eq!(sched.in_flight(), 0);
        sched.prune_zombies();
        assert_eq!(sched.in_flight(), 0);
    }

    #[tokio::test]
    async fn completion_applies_when_generation_matches() {
        let sched = scheduler_with(Arc::new(StaticApi { klines: vec![] }));
        let key = "BTCUSDT:price".to_string();
        let generation = Uuid::new_v4();
        sched.pending.lock().insert(
            key.clone(),
            PendingPoll {
                generation,
                started_at_ms: now_ms(),
            },
        );
        sched.in_flight.store(1, Ordering::SeqCst);

        sched
            .finish_poll(
                &key,
                generation,
                "BTCUSDT",
                Ok(PollOutcome::Ticker(TickerData {
                    last_price: Some(dec!(42)),
                    ..Default::default()
                })),
            )
            .await;

        assert_eq!(sched.in_flight(), 0);
        sched.store.flush();
        assert_eq!(
            sched.store.snapshot("BTCUSDT").unwrap().last_price,
            Some(dec!(42))
        );
        // The pair is locked out for the poll interval.
        assert!(sched.fetch_locks.lock().get(&key).copied().unwrap() > now_ms());
    }

    #[tokio::test]
    async fn lock_map_overflow_resets_state() {
        let sched = scheduler_with(Arc::new(StaticApi { klines: vec![] }));
        {
            let mut locks = sched.fetch_locks.lock();
            for i in 0..(LOCK_MAP_LIMIT + 10) {
                locks.insert(format!("SYM{i}:price"), now_ms() + 60_000);
            }
        }
        sched.in_flight.store(4, Ordering::SeqCst);
        sched.poll_cycle();
        assert!(sched.fetch_locks.lock().is_empty());
        assert_eq!(sched.in_flight(), 0);
    }

    // ── history ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ensure_history_merges_and_persists() {
        let step = 3_600_000;
        let api = Arc::new(StaticApi {
            klines: vec![candle(0, dec!(1)), candle(step, dec!(2))],
        });
        let sched = scheduler_with(api);

        sched.ensure_history("BTCUSDT", "1h").await;
        assert_eq!(sched.store.series_len("BTCUSDT", "1h"), 2);
        assert_eq!(
            sched.storage.load_candles("BTCUSDT", "1h").await.len(),
            2
        );
        // Lock released.
        assert!(sched.history_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn load_more_history_reports_whether_data_landed() {
        let step = 3_600_000;
        let api = Arc::new(StaticApi {
            klines: vec![candle(10 * step, dec!(1))],
        });
        let sched = scheduler_with(api);
        // Nothing in the store yet.
        assert!(!sched.load_more_history("BTCUSDT", "1h").await);

        sched.ensure_history("BTCUSDT", "1h").await;
        // StaticApi returns nothing for end-bounded requests.
        assert!(!sched.load_more_history("BTCUSDT", "1h").await);
    }
}
