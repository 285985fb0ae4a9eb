// =============================================================================
// Push gateway — WebSocket market-data ingestion
// =============================================================================
//
// Two independent connections (public market data, private account stream),
// each owned by a reconnecting task in `conn`. The gateway itself owns the
// subscription bookkeeping and the frame -> store path; the connection tasks
// only move bytes and keep the link alive.
// =============================================================================

mod conn;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::adapter::{self, AdapterError, FastParse, NormalizedUpdate};
use crate::store::{KlineSource, SeriesStore};
use crate::types::{kline_timeframe, now_ms, provider_interval, RateLimitedLog};

pub use conn::ConnKind;

/// Minimum spacing between applied updates per `symbol:channel`.
pub const THROTTLE_INTERVAL_MS: i64 = 200;
/// Bound on the throttle map; oldest-inserted keys are evicted first.
pub const THROTTLE_MAX_KEYS: usize = 1024;

/// Base timeframe a synthetic (non-native) kline subscription rides on.
const SYNTHETIC_BASE_TF: &str = "1m";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub public_url: String,
    pub private_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            public_url: "wss://fapi.bitunix.com/public/".to_string(),
            private_url: "wss://fapi.bitunix.com/private/".to_string(),
            api_key: None,
            api_secret: None,
        }
    }
}

/// `(symbol, user-facing channel)` as held in the intended/active sets.
pub type SubKey = (String, String);

// =============================================================================
// Throttle
// =============================================================================

#[derive(Default)]
struct ThrottleInner {
    last_sent: HashMap<String, i64>,
    insertion_order: VecDeque<String>,
}

/// Per-key minimum-interval gate with a hard size bound. Eviction is FIFO by
/// insertion so the map can never grow past `capacity` no matter how many
/// symbols stream at once.
pub struct ThrottleGate {
    inner: Mutex<ThrottleInner>,
    min_interval_ms: i64,
    capacity: usize,
}

impl ThrottleGate {
    pub fn new(min_interval_ms: i64, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ThrottleInner::default()),
            min_interval_ms,
            capacity,
        }
    }

    /// True when the update for `key` should be applied now.
    pub fn should_pass(&self, key: &str) -> bool {
        let now = now_ms();
        let mut inner = self.inner.lock();
        if let Some(last) = inner.last_sent.get(key) {
            if now - last < self.min_interval_ms {
                return false;
            }
            inner.last_sent.insert(key.to_string(), now);
            return true;
        }

        while inner.last_sent.len() >= self.capacity {
            let Some(oldest) = inner.insertion_order.pop_front() else {
                break;
            };
            inner.last_sent.remove(&oldest);
        }
        inner.last_sent.insert(key.to_string(), now);
        inner.insertion_order.push_back(key.to_string());
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().last_sent.len()
    }
}

// =============================================================================
// PushGateway
// =============================================================================

pub struct PushGateway {
    store: Arc<SeriesStore>,
    config: GatewayConfig,
    intended: Mutex<HashSet<SubKey>>,
    active: Mutex<HashSet<SubKey>>,
    synthetic: Mutex<HashMap<String, u32>>,
    throttle: ThrottleGate,
    public_tx: mpsc::UnboundedSender<String>,
    public_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    private_tx: mpsc::UnboundedSender<String>,
    private_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    fallback_log: RateLimitedLog,
    invalid_log: RateLimitedLog,
}

impl PushGateway {
    pub fn new(store: Arc<SeriesStore>, config: GatewayConfig) -> Arc<Self> {
        let (public_tx, public_rx) = mpsc::unbounded_channel();
        let (private_tx, private_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            store,
            config,
            intended: Mutex::new(HashSet::new()),
            active: Mutex::new(HashSet::new()),
            synthetic: Mutex::new(HashMap::new()),
            throttle: ThrottleGate::new(THROTTLE_INTERVAL_MS, THROTTLE_MAX_KEYS),
            public_tx,
            public_rx: Mutex::new(Some(public_rx)),
            private_tx,
            private_rx: Mutex::new(Some(private_rx)),
            fallback_log: RateLimitedLog::new(10_000),
            invalid_log: RateLimitedLog::new(10_000),
        })
    }

    /// Spawn the connection tasks. The private side only runs when
    /// credentials are configured.
    pub fn start(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(rx) = self.public_rx.lock().take() {
            let gateway = Arc::clone(self);
            handles.push(tokio::spawn(conn::run_connection(
                gateway,
                ConnKind::Public,
                rx,
            )));
        }
        if self.config.api_key.is_some() && self.config.api_secret.is_some() {
            if let Some(rx) = self.private_rx.lock().take() {
                let gateway = Arc::clone(self);
                handles.push(tokio::spawn(conn::run_connection(
                    gateway,
                    ConnKind::Private,
                    rx,
                )));
            }
        }
        handles
    }

    // ── subscription sync ────────────────────────────────────────────────

    /// Reconcile the exchange subscriptions with `intended`: send only the
    /// incremental subscribe/unsubscribe ops. The one exception is right
    /// after a fresh open, when `on_open` clears the active set and this
    /// naturally degenerates into a full resend.
    pub fn sync(&self, intended: HashSet<SubKey>) {
        let (to_sub, to_unsub) = {
            let active = self.active.lock();
            let to_sub: Vec<SubKey> = intended.difference(&active).cloned().collect();
            let to_unsub: Vec<SubKey> = active.difference(&intended).cloned().collect();
            (to_sub, to_unsub)
        };
        *self.intended.lock() = intended.clone();

        if !to_sub.is_empty() {
            self.send_sub_op("subscribe", &to_sub);
        }
        if !to_unsub.is_empty() {
            self.send_sub_op("unsubscribe", &to_unsub);
        }
        *self.active.lock() = intended;
    }

    fn send_sub_op(&self, op: &str, keys: &[SubKey]) {
        let args: Vec<Value> = keys
            .iter()
            .filter_map(|(symbol, channel)| {
                provider_channel(channel).map(|ch| json!({ "symbol": symbol, "ch": ch }))
            })
            .collect();
        if args.is_empty() {
            return;
        }
        debug!(op, count = args.len(), "subscription ops queued");
        let frame = json!({ "op": op, "args": args }).to_string();
        let _ = self.public_tx.send(frame);
    }

    // ── synthetic subscriptions ──────────────────────────────────────────

    /// Ref-count a non-native timeframe. The first reference subscribes the
    /// base-timeframe stream the synthetic candles are aggregated from; the
    /// native subscription counts are never touched.
    pub fn subscribe_synthetic(&self, symbol: &str, timeframe: &str) {
        let key = format!("{symbol}:{timeframe}");
        let first = {
            let mut synthetic = self.synthetic.lock();
            let count = synthetic.entry(key).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first && !self.base_stream_needed_elsewhere(symbol, timeframe) {
            let base = (symbol.to_string(), format!("kline_{SYNTHETIC_BASE_TF}"));
            self.send_sub_op("subscribe", std::slice::from_ref(&base));
        }
    }

    pub fn unsubscribe_synthetic(&self, symbol: &str, timeframe: &str) {
        let key = format!("{symbol}:{timeframe}");
        let last = {
            let mut synthetic = self.synthetic.lock();
            match synthetic.get_mut(&key) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    synthetic.remove(&key);
                    true
                }
                None => false,
            }
        };
        if last && !self.base_stream_needed_elsewhere(symbol, timeframe) {
            let base = (symbol.to_string(), format!("kline_{SYNTHETIC_BASE_TF}"));
            self.send_sub_op("unsubscribe", std::slice::from_ref(&base));
        }
    }

    /// The base stream must stay up while a native subscription or another
    /// synthetic timeframe on the same symbol still uses it.
    fn base_stream_needed_elsewhere(&self, symbol: &str, timeframe: &str) -> bool {
        let base_key = (
            symbol.to_string(),
            format!("kline_{SYNTHETIC_BASE_TF}"),
        );
        if self.intended.lock().contains(&base_key) {
            return true;
        }
        let prefix = format!("{symbol}:");
        let own = format!("{symbol}:{timeframe}");
        self.synthetic
            .lock()
            .keys()
            .any(|k| k.starts_with(&prefix) && *k != own)
    }

    #[cfg(test)]
    fn synthetic_count(&self, symbol: &str, timeframe: &str) -> u32 {
        self.synthetic
            .lock()
            .get(&format!("{symbol}:{timeframe}"))
            .copied()
            .unwrap_or(0)
    }

    // ── connection callbacks ─────────────────────────────────────────────

    fn on_open(&self, kind: ConnKind) {
        match kind {
            ConnKind::Public => {
                // Fresh socket knows nothing; resend the whole intended set.
                self.active.lock().clear();
                let intended = self.intended.lock().clone();
                info!(subscriptions = intended.len(), "public stream open, resubscribing");
                self.sync(intended);
                self.resend_synthetic_bases();
            }
            ConnKind::Private => {
                if let (Some(key), Some(secret)) =
                    (self.config.api_key.as_ref(), self.config.api_secret.as_ref())
                {
                    let _ = self.private_tx.send(login_frame(key, secret));
                }
            }
        }
    }

    /// Base streams held only through synthetic ref counts are not part of
    /// the intended set, so the fresh-open resend must cover them separately.
    fn resend_synthetic_bases(&self) {
        let mut symbols: Vec<String> = self
            .synthetic
            .lock()
            .keys()
            .filter_map(|k| k.split_once(':').map(|(symbol, _)| symbol.to_string()))
            .collect();
        symbols.sort();
        symbols.dedup();

        let base_channel = format!("kline_{SYNTHETIC_BASE_TF}");
        let bases: Vec<SubKey> = {
            let intended = self.intended.lock();
            symbols
                .into_iter()
                .map(|symbol| (symbol, base_channel.clone()))
                .filter(|key| !intended.contains(key))
                .collect()
        };
        if !bases.is_empty() {
            self.send_sub_op("subscribe", &bases);
        }
    }

    /// Parse and apply one inbound text frame. An `Err` marks a structurally
    /// broken frame; the connection task counts those toward its forced
    /// reconnect threshold.
    fn handle_frame(&self, kind: ConnKind, text: &str) -> Result<(), AdapterError> {
        let frame: Value =
            serde_json::from_str(text).map_err(|e| AdapterError::Malformed(e.to_string()))?;

        let update = match adapter::fast_parse_frame(&frame) {
            FastParse::Ok(update) => update,
            FastParse::NeedsFullValidation => {
                match adapter::parse_frame(&frame) {
                    Ok(update) => {
                        // Only interesting when a hot-path frame fell through.
                        if frame.get("ch").map_or(false, |ch| ch == "price" || ch == "ticker")
                            && self.fallback_log.allow()
                        {
                            debug!("hot-path frame took the full validation path");
                        }
                        update
                    }
                    Err(err) => {
                        if self.invalid_log.allow() {
                            warn!(error = %err, "dropping invalid frame");
                        }
                        return Err(err);
                    }
                }
            }
        };
        self.apply_update(kind, &frame, update);
        Ok(())
    }

    fn apply_update(&self, kind: ConnKind, frame: &Value, update: NormalizedUpdate) {
        match update {
            NormalizedUpdate::Snapshot { symbol, patch } => {
                let channel = frame.get("ch").and_then(Value::as_str).unwrap_or("?");
                if self.throttle.should_pass(&format!("{symbol}:{channel}")) {
                    self.store.update_symbol(&symbol, patch);
                }
            }
            NormalizedUpdate::Kline {
                symbol,
                timeframe,
                candle,
            } => {
                self.store.update_symbol_klines(
                    &symbol,
                    &timeframe,
                    vec![candle],
                    KlineSource::Push,
                    true,
                );
            }
            NormalizedUpdate::Pong => {}
            NormalizedUpdate::LoginOk => {
                info!("private stream authenticated");
                self.subscribe_private();
            }
            NormalizedUpdate::LoginFailed(msg) => {
                // The socket stays up unauthenticated; public data is
                // unaffected.
                error!(kind = %kind, msg = %msg, "private login failed");
            }
            NormalizedUpdate::Ignored => {}
        }
    }

    fn subscribe_private(&self) {
        let args: Vec<Value> = ["position", "order", "wallet"]
            .iter()
            .map(|ch| json!({ "ch": ch }))
            .collect();
        let frame = json!({ "op": "subscribe", "args": args }).to_string();
        let _ = self.private_tx.send(frame);
    }

    fn set_status(&self, kind: ConnKind, status: crate::types::ConnStatus) {
        // The public stream is the user-visible connectivity signal; private
        // transitions are log-only.
        match kind {
            ConnKind::Public => self.store.set_status(status),
            ConnKind::Private => debug!(status = %status, "private stream status"),
        }
    }

    fn url(&self, kind: ConnKind) -> &str {
        match kind {
            ConnKind::Public => &self.config.public_url,
            ConnKind::Private => &self.config.private_url,
        }
    }
}

/// Map a user-facing channel to the provider token. Non-native kline
/// timeframes have no direct stream; they are covered by the synthetic path.
fn provider_channel(channel: &str) -> Option<String> {
    match channel {
        "price" | "ticker" | "depth_book5" => Some(channel.to_string()),
        _ => {
            let tf = kline_timeframe(channel)?;
            provider_interval(tf).map(|interval| format!("market_kline_{interval}"))
        }
    }
}

/// Exchange login signature: `sha256(sha256(nonce + ts + api_key) + secret)`,
/// both digests hex-encoded.
fn login_frame(api_key: &str, api_secret: &str) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let timestamp = now_ms() / 1000;
    let first = hex::encode(Sha256::digest(format!("{nonce}{timestamp}{api_key}")));
    let sign = hex::encode(Sha256::digest(format!("{first}{api_secret}")));
    json!({
        "op": "login",
        "args": [{ "apiKey": api_key, "timestamp": timestamp, "nonce": nonce, "sign": sign }]
    })
    .to_string()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn gateway() -> Arc<PushGateway> {
        let store = Arc::new(SeriesStore::new(20, 600_000, 1_000));
        PushGateway::new(store, GatewayConfig::default())
    }

    fn take_public_ops(gw: &PushGateway) -> Vec<Value> {
        let mut rx = gw.public_rx.lock().take().unwrap();
        let mut ops = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            ops.push(serde_json::from_str(&frame).unwrap());
        }
        *gw.public_rx.lock() = Some(rx);
        ops
    }

    fn key(symbol: &str, channel: &str) -> SubKey {
        (symbol.to_string(), channel.to_string())
    }

    #[test]
    fn sync_sends_incremental_diff() {
        let gw = gateway();
        gw.sync(HashSet::from([key("BTCUSDT", "price"), key("BTCUSDT", "ticker")]));
        let ops = take_public_ops(&gw);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["op"], "subscribe");
        assert_eq!(ops[0]["args"].as_array().unwrap().len(), 2);

        // Adding one channel sends only that one; dropping one sends only
        // the removal.
        gw.sync(HashSet::from([
            key("BTCUSDT", "price"),
            key("BTCUSDT", "ticker"),
            key("ETHUSDT", "price"),
        ]));
        let ops = take_public_ops(&gw);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["op"], "subscribe");
        assert_eq!(ops[0]["args"].as_array().unwrap().len(), 1);
        assert_eq!(ops[0]["args"][0]["symbol"], "ETHUSDT");

        gw.sync(HashSet::from([key("BTCUSDT", "price"), key("BTCUSDT", "ticker")]));
        let ops = take_public_ops(&gw);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["op"], "unsubscribe");
    }

    #[test]
    fn open_triggers_full_resend() {
        let gw = gateway();
        let intended = HashSet::from([key("BTCUSDT", "price"), key("BTCUSDT", "kline_1h")]);
        gw.sync(intended);
        take_public_ops(&gw);

        // No diff, nothing to send.
        let same = gw.intended.lock().clone();
        gw.sync(same);
        assert!(take_public_ops(&gw).is_empty());

        // Fresh open clears the active set and resends everything.
        gw.on_open(ConnKind::Public);
        let ops = take_public_ops(&gw);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["op"], "subscribe");
        assert_eq!(ops[0]["args"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn kline_channel_maps_to_provider_interval() {
        assert_eq!(
            provider_channel("kline_1h").as_deref(),
            Some("market_kline_60min")
        );
        assert_eq!(provider_channel("price").as_deref(), Some("price"));
        assert_eq!(provider_channel("kline_2h"), None);
        assert_eq!(provider_channel("bogus"), None);
    }

    #[test]
    fn synthetic_refcounts_are_separate_from_native() {
        let gw = gateway();
        gw.sync(HashSet::from([key("BTCUSDT", "price")]));
        take_public_ops(&gw);

        gw.subscribe_synthetic("BTCUSDT", "2h");
        gw.subscribe_synthetic("BTCUSDT", "2h");
        assert_eq!(gw.synthetic_count("BTCUSDT", "2h"), 2);
        // Only the first reference subscribed the base stream.
        let ops = take_public_ops(&gw);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["args"][0]["ch"], "market_kline_1min");

        gw.unsubscribe_synthetic("BTCUSDT", "2h");
        assert!(take_public_ops(&gw).is_empty());
        gw.unsubscribe_synthetic("BTCUSDT", "2h");
        let ops = take_public_ops(&gw);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["op"], "unsubscribe");

        // Native intents were never disturbed.
        assert!(gw.intended.lock().contains(&key("BTCUSDT", "price")));
    }

    #[test]
    fn synthetic_release_keeps_base_needed_by_native() {
        let gw = gateway();
        gw.sync(HashSet::from([key("BTCUSDT", "kline_1m")]));
        take_public_ops(&gw);

        gw.subscribe_synthetic("BTCUSDT", "2h");
        // Base already intended natively; no extra subscribe.
        assert!(take_public_ops(&gw).is_empty());
        gw.unsubscribe_synthetic("BTCUSDT", "2h");
        // And no unsubscribe either.
        assert!(take_public_ops(&gw).is_empty());
    }

    #[test]
    fn open_resends_synthetic_base_streams() {
        let gw = gateway();
        gw.subscribe_synthetic("BTCUSDT", "2h");
        take_public_ops(&gw);

        // A fresh open must restore the base stream the synthetic timeframe
        // rides on, even though it lives outside the intended set.
        gw.on_open(ConnKind::Public);
        let ops = take_public_ops(&gw);
        let restored = ops
            .iter()
            .flat_map(|op| op["args"].as_array().unwrap().iter())
            .any(|a| a["symbol"] == "BTCUSDT" && a["ch"] == "market_kline_1min");
        assert!(restored, "base stream missing from resend: {ops:?}");

        // A base already intended natively is sent once, by the sync.
        gw.sync(HashSet::from([key("ETHUSDT", "kline_1m")]));
        gw.subscribe_synthetic("ETHUSDT", "2h");
        take_public_ops(&gw);
        gw.on_open(ConnKind::Public);
        let ops = take_public_ops(&gw);
        let eth_base_count = ops
            .iter()
            .flat_map(|op| op["args"].as_array().unwrap().iter())
            .filter(|a| a["symbol"] == "ETHUSDT" && a["ch"] == "market_kline_1min")
            .count();
        assert_eq!(eth_base_count, 1);
    }

    #[test]
    fn throttle_spaces_updates_and_bounds_keys() {
        let gate = ThrottleGate::new(60_000, 3);
        assert!(gate.should_pass("A:price"));
        assert!(!gate.should_pass("A:price"));

        assert!(gate.should_pass("B:price"));
        assert!(gate.should_pass("C:price"));
        assert_eq!(gate.len(), 3);

        // Fourth key evicts the oldest-inserted (A), which then passes again
        // as a brand-new key.
        assert!(gate.should_pass("D:price"));
        assert_eq!(gate.len(), 3);
        assert!(gate.should_pass("A:price"));
    }

    #[test]
    fn frame_path_writes_to_store() {
        let gw = gateway();
        let frame = json!({
            "ch": "price",
            "symbol": "BTCUSDT",
            "data": { "mp": "50000" }
        })
        .to_string();
        gw.handle_frame(ConnKind::Public, &frame).unwrap();
        gw.store.flush();
        assert_eq!(
            gw.store.snapshot("BTCUSDT").unwrap().last_price,
            Some(dec!(50000))
        );
    }

    #[test]
    fn invalid_frame_is_an_error_but_not_fatal() {
        let gw = gateway();
        assert!(gw.handle_frame(ConnKind::Public, "not json").is_err());
        assert!(gw
            .handle_frame(
                ConnKind::Public,
                &json!({ "ch": "fills", "symbol": "X", "data": {} }).to_string()
            )
            .is_err());
        // Store untouched.
        gw.store.flush();
        assert_eq!(gw.store.symbol_count(), 0);
    }

    #[test]
    fn login_frame_shape() {
        let frame: Value = serde_json::from_str(&login_frame("key", "secret")).unwrap();
        assert_eq!(frame["op"], "login");
        let arg = &frame["args"][0];
        assert_eq!(arg["apiKey"], "key");
        assert_eq!(arg["sign"].as_str().unwrap().len(), 64);
        assert_eq!(arg["nonce"].as_str().unwrap().len(), 32);
    }
}
