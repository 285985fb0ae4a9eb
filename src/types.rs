// =============================================================================
// Shared types used across the marketfeed engine
// =============================================================================

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// User-visible connectivity status of the push channel.
///
/// This is the only connectivity signal surfaced outside the engine;
/// individual fetch or validation failures stay in the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Degraded: the error-rate circuit breaker tripped and the connection is
    /// in slow-retry mode.
    Error,
}

impl Default for ConnStatus {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Prefix for user-facing kline channels, e.g. `kline_1h`.
pub const KLINE_CHANNEL_PREFIX: &str = "kline_";

/// Timeframes the exchange streams natively, with their provider interval
/// tokens. Anything else is handled as a synthetic subscription.
const NATIVE_TIMEFRAMES: &[(&str, &str)] = &[
    ("1m", "1min"),
    ("5m", "5min"),
    ("15m", "15min"),
    ("30m", "30min"),
    ("1h", "60min"),
    ("4h", "4h"),
    ("1d", "1day"),
    ("1w", "1week"),
    ("1M", "1month"),
];

/// Map a user-facing timeframe to the provider's interval token
/// (`"1h"` -> `"60min"`). Returns `None` for non-native timeframes.
pub fn provider_interval(timeframe: &str) -> Option<&'static str> {
    NATIVE_TIMEFRAMES
        .iter()
        .find(|(tf, _)| *tf == timeframe)
        .map(|(_, iv)| *iv)
}

/// Reverse map: provider interval token back to the user-facing timeframe
/// (`"60min"` -> `"1h"`). Unknown tokens are passed through unchanged.
pub fn timeframe_from_interval(interval: &str) -> &str {
    NATIVE_TIMEFRAMES
        .iter()
        .find(|(_, iv)| *iv == interval)
        .map(|(tf, _)| *tf)
        .unwrap_or(interval)
}

/// Bucket width of a timeframe in milliseconds. `None` for unknown tokens.
pub fn interval_ms(timeframe: &str) -> Option<i64> {
    let ms = match timeframe {
        "1m" => 60_000,
        "5m" => 5 * 60_000,
        "15m" => 15 * 60_000,
        "30m" => 30 * 60_000,
        "1h" => 60 * 60_000,
        "4h" => 4 * 60 * 60_000,
        "1d" => 24 * 60 * 60_000,
        "1w" => 7 * 24 * 60 * 60_000,
        "1M" => 30 * 24 * 60 * 60_000,
        _ => return None,
    };
    Some(ms)
}

/// Extract the timeframe from a user-facing kline channel name
/// (`"kline_1h"` -> `Some("1h")`).
pub fn kline_timeframe(channel: &str) -> Option<&str> {
    channel.strip_prefix(KLINE_CHANNEL_PREFIX)
}

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Rate-limited logging gate
// =============================================================================

/// Gate for warn-level logs on hot paths. `allow()` returns true at most once
/// per configured interval so a burst of identical failures produces a single
/// log line instead of a storm.
pub struct RateLimitedLog {
    last_ms: Mutex<i64>,
    min_interval_ms: i64,
}

impl RateLimitedLog {
    pub fn new(min_interval_ms: i64) -> Self {
        Self {
            last_ms: Mutex::new(0),
            min_interval_ms,
        }
    }

    pub fn allow(&self) -> bool {
        let now = now_ms();
        let mut last = self.last_ms.lock();
        if now - *last >= self.min_interval_ms {
            *last = now;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_round_trip() {
        assert_eq!(provider_interval("1h"), Some("60min"));
        assert_eq!(timeframe_from_interval("60min"), "1h");
        assert_eq!(provider_interval("2h"), None);
        // Unknown provider tokens pass through so the caller can decide.
        assert_eq!(timeframe_from_interval("2h"), "2h");
    }

    #[test]
    fn interval_ms_values() {
        assert_eq!(interval_ms("1m"), Some(60_000));
        assert_eq!(interval_ms("1h"), Some(3_600_000));
        assert_eq!(interval_ms("bogus"), None);
    }

    #[test]
    fn kline_channel_parsing() {
        assert_eq!(kline_timeframe("kline_1h"), Some("1h"));
        assert_eq!(kline_timeframe("ticker"), None);
    }

    #[test]
    fn rate_limited_log_gates_bursts() {
        let gate = RateLimitedLog::new(60_000);
        assert!(gate.allow());
        assert!(!gate.allow());
        assert!(!gate.allow());
    }
}
