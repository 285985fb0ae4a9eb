// =============================================================================
// Bitunix REST API client — public market-data endpoints (unsigned)
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::adapter::parse_decimal;
use crate::store::Candle;
use crate::types::provider_interval;

/// REST timeout. Shorter than the scheduler's proactive lock release (15 s) so
/// a hung request is always torn down before the lock is reclaimed.
pub const REST_TIMEOUT_SECS: u64 = 10;

const DEFAULT_BASE_URL: &str = "https://fapi.bitunix.com";

/// Hint passed down so an implementation can prioritize the user's focus
/// symbol when requests queue up. The default client treats both the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPriority {
    High,
    Normal,
}

/// 24h ticker snapshot as the REST API reports it.
#[derive(Debug, Clone, Default)]
pub struct TickerData {
    pub last_price: Option<Decimal>,
    pub high_24h: Option<Decimal>,
    pub low_24h: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub quote_volume_24h: Option<Decimal>,
    pub change_pct: Option<Decimal>,
}

/// Seam between the scheduler and the exchange REST API, mockable in tests.
#[async_trait]
pub trait MarketApi: Send + Sync {
    async fn fetch_ticker(&self, symbol: &str, priority: FetchPriority) -> Result<TickerData>;

    /// `end_time_ms` bounds the page from above and drives backfill
    /// pagination; `start_time_ms` bounds it from below.
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
        end_time_ms: Option<i64>,
        start_time_ms: Option<i64>,
    ) -> Result<Vec<Candle>>;
}

// =============================================================================
// BitunixRest
// =============================================================================

#[derive(Clone)]
pub struct BitunixRest {
    base_url: String,
    client: reqwest::Client,
}

impl BitunixRest {
    pub fn new(base_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client,
        }
    }

    async fn get_envelope(&self, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("GET {url}: response was not JSON"))?;
        if !status.is_success() {
            anyhow::bail!("GET {url} returned {status}: {body}");
        }
        check_envelope_code(&body)?;
        Ok(body)
    }
}

/// Bitunix wraps every response in `{code, msg, data}`; code 0 is success.
fn check_envelope_code(body: &Value) -> Result<()> {
    let ok = match body.get("code") {
        Some(Value::Number(n)) => n.as_i64() == Some(0),
        Some(Value::String(s)) => s == "0",
        _ => false,
    };
    if !ok {
        let msg = body
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        anyhow::bail!("API error code {:?}: {}", body.get("code"), msg);
    }
    Ok(())
}

fn parse_ticker_payload(body: &Value) -> Result<TickerData> {
    let ticker = body
        .get("data")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
        .context("ticker response has no data")?;

    let field = |name: &str| ticker.get(name).and_then(parse_decimal);
    let last = field("lastPrice");
    let open = field("open");
    let change_pct = match (last, open) {
        (Some(last), Some(open)) if !open.is_zero() => {
            Some((last - open) / open * Decimal::ONE_HUNDRED)
        }
        _ => None,
    };

    Ok(TickerData {
        last_price: last,
        high_24h: field("high"),
        low_24h: field("low"),
        volume_24h: field("baseVol"),
        quote_volume_24h: field("quoteVol"),
        change_pct,
    })
}

fn parse_kline_payload(body: &Value) -> Result<Vec<Candle>> {
    let rows = body
        .get("data")
        .and_then(Value::as_array)
        .context("kline response has no data array")?;

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        // Field names vary by endpoint version: long names or single letters,
        // volume under `vol`/`v`, bucket time under `id`/`ts`/`time`.
        let num = |long: &str, short: &str| {
            row.get(long)
                .or_else(|| row.get(short))
                .and_then(parse_decimal)
        };
        let time_ms = ["id", "ts", "time", "t"]
            .iter()
            .find_map(|k| row.get(*k))
            .and_then(Value::as_i64);

        let (Some(open), Some(high), Some(low), Some(close), Some(time_ms)) = (
            num("open", "o"),
            num("high", "h"),
            num("low", "l"),
            num("close", "c"),
            time_ms,
        ) else {
            debug!(row = %row, "skipping malformed kline row");
            continue;
        };
        candles.push(Candle {
            time_ms,
            open,
            high,
            low,
            close,
            volume: num("vol", "v").unwrap_or(Decimal::ZERO),
        });
    }
    candles.sort_by_key(|c| c.time_ms);
    Ok(candles)
}

#[async_trait]
impl MarketApi for BitunixRest {
    #[instrument(skip(self), name = "rest::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str, _priority: FetchPriority) -> Result<TickerData> {
        let url = format!(
            "{}/api/v1/futures/market/tickers?symbols={}",
            self.base_url, symbol
        );
        let body = self.get_envelope(&url).await?;
        parse_ticker_payload(&body).with_context(|| format!("ticker parse failed for {symbol}"))
    }

    #[instrument(skip(self), name = "rest::fetch_klines")]
    async fn fetch_klines(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
        end_time_ms: Option<i64>,
        start_time_ms: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let interval = provider_interval(timeframe)
            .with_context(|| format!("no provider interval for timeframe {timeframe}"))?;
        let mut url = format!(
            "{}/api/v1/futures/market/kline?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        if let Some(start) = start_time_ms {
            url.push_str(&format!("&startTime={start}"));
        }
        if let Some(end) = end_time_ms {
            url.push_str(&format!("&endTime={end}"));
        }

        let body = self.get_envelope(&url).await?;
        let candles = parse_kline_payload(&body)
            .with_context(|| format!("kline parse failed for {symbol} {timeframe}"))?;
        debug!(symbol, timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

impl std::fmt::Debug for BitunixRest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitunixRest")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn envelope_code_accepts_zero_number_and_string() {
        assert!(check_envelope_code(&json!({ "code": 0 })).is_ok());
        assert!(check_envelope_code(&json!({ "code": "0" })).is_ok());
        assert!(check_envelope_code(&json!({ "code": 2, "msg": "system error" })).is_err());
        assert!(check_envelope_code(&json!({})).is_err());
    }

    #[test]
    fn ticker_payload_parses_and_derives_change() {
        let body = json!({
            "code": 0,
            "data": [{
                "lastPrice": "110",
                "open": "100",
                "high": "115",
                "low": "95",
                "baseVol": "1000",
                "quoteVol": "105000"
            }]
        });
        let ticker = parse_ticker_payload(&body).unwrap();
        assert_eq!(ticker.last_price, Some(dec!(110)));
        assert_eq!(ticker.change_pct, Some(dec!(10)));
        assert_eq!(ticker.volume_24h, Some(dec!(1000)));
    }

    #[test]
    fn kline_payload_accepts_both_field_styles_and_sorts() {
        let body = json!({
            "code": 0,
            "data": [
                { "open": "2", "high": "3", "low": "1", "close": "2.5", "vol": "10", "time": 120000 },
                { "o": 1, "h": 2, "l": 0.5, "c": "1.5", "v": "20", "ts": 60000 }
            ]
        });
        let candles = parse_kline_payload(&body).unwrap();
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].time_ms, 60_000);
        assert_eq!(candles[0].close, dec!(1.5));
        assert_eq!(candles[1].volume, dec!(10));
    }

    #[test]
    fn malformed_kline_rows_are_skipped() {
        let body = json!({
            "code": 0,
            "data": [
                { "open": "1" },
                { "open": "1", "high": "2", "low": "0.5", "close": "1.5", "time": 60000 }
            ]
        });
        let candles = parse_kline_payload(&body).unwrap();
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].volume, Decimal::ZERO);
    }
}
