// =============================================================================
// Data adapter — wire payloads in, typed updates out. No state, no I/O.
// =============================================================================

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::store::{Candle, DepthBook, DepthLevel, SnapshotPatch};
use crate::types::{now_ms, timeframe_from_interval};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a valid number: {raw}")]
    BadNumber { field: &'static str, raw: String },
    #[error("unknown channel `{0}`")]
    UnknownChannel(String),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// A wire frame reduced to what the engine acts on.
#[derive(Debug, Clone)]
pub enum NormalizedUpdate {
    Snapshot {
        symbol: String,
        patch: SnapshotPatch,
    },
    Kline {
        symbol: String,
        timeframe: String,
        candle: Candle,
    },
    Pong,
    LoginOk,
    LoginFailed(String),
    /// Structurally valid but of no interest to this engine (private
    /// account/order/position pushes, subscribe acks).
    Ignored,
}

/// Outcome of the fast path. Anything but `Ok` is handed to the full
/// validation path; the fast path itself never rejects a frame outright.
#[derive(Debug)]
pub enum FastParse {
    Ok(NormalizedUpdate),
    NeedsFullValidation,
}

// =============================================================================
// Symbol normalization
// =============================================================================

/// Canonicalize a provider symbol: uppercase, perp/quote suffix noise
/// stripped, bare bases expanded to their USDT pair.
pub fn normalize_symbol(raw: &str) -> String {
    let mut s = raw.trim().to_uppercase().replace(['/', '_'], "");
    // Perp suffixes come in several spellings; strip at most one.
    for suffix in ["-PERP", "PERP", ".P", "-P"] {
        if let Some(stripped) = s.strip_suffix(suffix) {
            s = stripped.to_string();
            break;
        }
    }
    s = s.replace(":USDT", "");

    // "BTC" -> "BTCUSDT"; "USDCUSDT"-style pairs are left alone.
    if !s.contains("USDT") && !s.contains("USDC") && s.len() <= 5 && !s.is_empty() {
        s.push_str("USDT");
    }

    s = s.replace("-USDT", "USDT");
    if s.ends_with("USDTP") {
        s.truncate(s.len() - 1);
    }
    s
}

// =============================================================================
// Numeric parsing
// =============================================================================

/// Accepts a JSON string or finite number. Numbers go through their exact
/// JSON text so no binary-float rounding sneaks into a `Decimal`.
pub fn parse_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) if !s.trim().is_empty() => s.trim().parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn parse_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// =============================================================================
// Fast path
// =============================================================================

/// Cheap hand-rolled extraction for the two highest-rate channels (price and
/// ticker). Accepts only non-null string/number values for a fixed field set;
/// any surprise defers to the schema validator instead of guessing.
pub fn fast_parse_frame(frame: &Value) -> FastParse {
    let Some(ch) = frame.get("ch").and_then(Value::as_str) else {
        return FastParse::NeedsFullValidation;
    };
    let Some(raw_symbol) = frame.get("symbol").and_then(Value::as_str) else {
        return FastParse::NeedsFullValidation;
    };
    let Some(data) = frame.get("data").filter(|d| d.is_object()) else {
        return FastParse::NeedsFullValidation;
    };

    let symbol = normalize_symbol(raw_symbol);
    if symbol.is_empty() {
        return FastParse::NeedsFullValidation;
    }

    // A field that is present but unparseable bails to full validation, so
    // the fast path can never half-apply a frame.
    macro_rules! num {
        ($key:literal) => {
            match data.get($key) {
                None | Some(Value::Null) => None,
                Some(v) => match parse_decimal(v) {
                    Some(d) => Some(d),
                    None => return FastParse::NeedsFullValidation,
                },
            }
        };
    }

    match ch {
        "price" => {
            let mut patch = SnapshotPatch {
                last_price: num!("mp"),
                index_price: num!("ip"),
                funding_rate: num!("fr"),
                ..Default::default()
            };
            patch.next_funding_time_ms = match data.get("nft") {
                None | Some(Value::Null) => None,
                Some(v) => match parse_millis(v) {
                    Some(t) => Some(t),
                    None => return FastParse::NeedsFullValidation,
                },
            };
            FastParse::Ok(NormalizedUpdate::Snapshot { symbol, patch })
        }
        "ticker" => {
            let last = num!("la");
            let open = num!("o");
            let ratio = num!("r");
            let patch = SnapshotPatch {
                last_price: last,
                high_24h: num!("h"),
                low_24h: num!("l"),
                volume_24h: num!("b"),
                quote_volume_24h: num!("q"),
                change_pct: percent_change(last, open, ratio),
                ..Default::default()
            };
            FastParse::Ok(NormalizedUpdate::Snapshot { symbol, patch })
        }
        _ => FastParse::NeedsFullValidation,
    }
}

/// 24h change in percent: derived from open/last when possible, otherwise the
/// provider's ratio field scaled to percent.
fn percent_change(
    last: Option<Decimal>,
    open: Option<Decimal>,
    ratio: Option<Decimal>,
) -> Option<Decimal> {
    match (last, open) {
        (Some(last), Some(open)) if !open.is_zero() => {
            Some((last - open) / open * Decimal::ONE_HUNDRED)
        }
        _ => ratio.map(|r| r * Decimal::ONE_HUNDRED),
    }
}

// =============================================================================
// Full validation path
// =============================================================================

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    code: Option<Value>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    pong: Option<Value>,
    #[serde(default)]
    ch: Option<String>,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    o: Value,
    h: Value,
    l: Value,
    c: Value,
    #[serde(default)]
    b: Option<Value>,
    #[serde(default)]
    v: Option<Value>,
    #[serde(default)]
    t: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    ts: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct DepthData {
    #[serde(default)]
    b: Vec<Value>,
    #[serde(default)]
    a: Vec<Value>,
}

/// The strict path: serde-typed envelope, required fields enforced, every
/// numeric checked. This is where frames the fast path declined end up.
pub fn parse_frame(frame: &Value) -> Result<NormalizedUpdate, AdapterError> {
    let wire: WireFrame = serde_json::from_value(frame.clone())
        .map_err(|e| AdapterError::Malformed(e.to_string()))?;

    // Control frames first.
    if wire.op.as_deref() == Some("pong")
        || wire.op.as_deref() == Some("ping")
        || wire.pong.is_some()
    {
        return Ok(NormalizedUpdate::Pong);
    }
    if wire.event.as_deref() == Some("login") {
        let ok = matches!(&wire.code, Some(Value::Number(n)) if n.as_i64() == Some(0))
            || matches!(&wire.code, Some(Value::String(s)) if s == "0")
            || wire.msg.as_deref() == Some("success");
        return Ok(if ok {
            NormalizedUpdate::LoginOk
        } else {
            NormalizedUpdate::LoginFailed(wire.msg.unwrap_or_else(|| "login rejected".into()))
        });
    }
    // Subscribe/unsubscribe acks carry an op and no channel payload.
    if wire.ch.is_none() && wire.op.is_some() {
        return Ok(NormalizedUpdate::Ignored);
    }

    let ch = wire
        .ch
        .as_deref()
        .ok_or(AdapterError::MissingField("ch"))?;
    let data = wire.data.as_ref().ok_or(AdapterError::MissingField("data"))?;
    let symbol = normalize_symbol(wire.symbol.as_deref().unwrap_or(""));

    match ch {
        "price" | "ticker" => {
            if symbol.is_empty() {
                return Err(AdapterError::MissingField("symbol"));
            }
            let patch = if ch == "price" {
                SnapshotPatch {
                    last_price: opt_num(data, "mp")?,
                    index_price: opt_num(data, "ip")?,
                    funding_rate: opt_num(data, "fr")?,
                    next_funding_time_ms: data.get("nft").and_then(parse_millis),
                    ..Default::default()
                }
            } else {
                let last = opt_num(data, "la")?;
                let open = opt_num(data, "o")?;
                let ratio = opt_num(data, "r")?;
                SnapshotPatch {
                    last_price: last,
                    high_24h: opt_num(data, "h")?,
                    low_24h: opt_num(data, "l")?,
                    volume_24h: opt_num(data, "b")?,
                    quote_volume_24h: opt_num(data, "q")?,
                    change_pct: percent_change(last, open, ratio),
                    ..Default::default()
                }
            };
            Ok(NormalizedUpdate::Snapshot { symbol, patch })
        }
        "depth_book5" => {
            if symbol.is_empty() {
                return Err(AdapterError::MissingField("symbol"));
            }
            let depth: DepthData = serde_json::from_value(data.clone())
                .map_err(|e| AdapterError::Malformed(e.to_string()))?;
            let patch = SnapshotPatch {
                depth: Some(DepthBook {
                    bids: parse_levels(&depth.b)?,
                    asks: parse_levels(&depth.a)?,
                }),
                ..Default::default()
            };
            Ok(NormalizedUpdate::Snapshot { symbol, patch })
        }
        _ if ch.starts_with("market_kline_") || ch == "mark_kline_1day" => {
            if symbol.is_empty() {
                return Err(AdapterError::MissingField("symbol"));
            }
            let timeframe = if ch == "mark_kline_1day" {
                "1d".to_string()
            } else {
                let interval = &ch["market_kline_".len()..];
                timeframe_from_interval(interval).to_string()
            };
            let kline: KlineData = serde_json::from_value(data.clone())
                .map_err(|e| AdapterError::Malformed(e.to_string()))?;
            let candle = kline_to_candle(&kline)?;
            Ok(NormalizedUpdate::Kline {
                symbol,
                timeframe,
                candle,
            })
        }
        "position" | "order" | "wallet" => Ok(NormalizedUpdate::Ignored),
        other => Err(AdapterError::UnknownChannel(other.to_string())),
    }
}

fn opt_num(data: &Value, field: &'static str) -> Result<Option<Decimal>, AdapterError> {
    match data.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => parse_decimal(v)
            .map(Some)
            .ok_or_else(|| AdapterError::BadNumber {
                field,
                raw: v.to_string(),
            }),
    }
}

fn req_num(value: &Value, field: &'static str) -> Result<Decimal, AdapterError> {
    parse_decimal(value).ok_or_else(|| AdapterError::BadNumber {
        field,
        raw: value.to_string(),
    })
}

fn kline_to_candle(kline: &KlineData) -> Result<Candle, AdapterError> {
    // Volume under `b` on push, `v` on some REST payloads.
    let volume = kline
        .b
        .as_ref()
        .or(kline.v.as_ref())
        .map(|v| req_num(v, "b"))
        .transpose()?
        .unwrap_or(Decimal::ZERO);
    // Bucket time under `t`, `id`, or `ts` depending on endpoint; a live
    // candle with none of them is stamped with receipt time.
    let time_ms = kline
        .t
        .as_ref()
        .or(kline.id.as_ref())
        .or(kline.ts.as_ref())
        .and_then(parse_millis)
        .unwrap_or_else(now_ms);
    Ok(Candle {
        time_ms,
        open: req_num(&kline.o, "o")?,
        high: req_num(&kline.h, "h")?,
        low: req_num(&kline.l, "l")?,
        close: req_num(&kline.c, "c")?,
        volume,
    })
}

fn parse_levels(raw: &[Value]) -> Result<Vec<DepthLevel>, AdapterError> {
    raw.iter()
        .map(|level| {
            let pair = level
                .as_array()
                .filter(|a| a.len() >= 2)
                .ok_or_else(|| AdapterError::Malformed(format!("depth level {level}")))?;
            Ok(DepthLevel {
                price: req_num(&pair[0], "depth.price")?,
                qty: req_num(&pair[1], "depth.qty")?,
            })
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
