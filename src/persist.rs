// =============================================================================
// Candle persistence seam
// =============================================================================

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::store::Candle;

/// Optional warm-start storage for candle history. Loads run before the first
/// REST fetch so a chart is populated immediately; saves are best-effort and
/// must never fail the caller.
#[async_trait]
pub trait CandleStorage: Send + Sync {
    /// Returns an empty vec when nothing is stored for the key.
    async fn load_candles(&self, symbol: &str, timeframe: &str) -> Vec<Candle>;

    async fn save_candles(&self, symbol: &str, timeframe: &str, candles: &[Candle]);
}

/// In-process storage, the default wiring. Survives reconnects within one
/// run; nothing outlives the process.
#[derive(Default)]
pub struct MemoryStorage {
    series: RwLock<HashMap<(String, String), Vec<Candle>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CandleStorage for MemoryStorage {
    async fn load_candles(&self, symbol: &str, timeframe: &str) -> Vec<Candle> {
        self.series
            .read()
            .get(&(symbol.to_string(), timeframe.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    async fn save_candles(&self, symbol: &str, timeframe: &str, candles: &[Candle]) {
        if candles.is_empty() {
            return;
        }
        self.series
            .write()
            .insert((symbol.to_string(), timeframe.to_string()), candles.to_vec());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(time_ms: i64) -> Candle {
        Candle {
            time_ms,
            open: dec!(1),
            high: dec!(1),
            low: dec!(1),
            close: dec!(1),
            volume: dec!(0),
        }
    }

    #[tokio::test]
    async fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert!(storage.load_candles("BTCUSDT", "1h").await.is_empty());

        storage
            .save_candles("BTCUSDT", "1h", &[candle(0), candle(3_600_000)])
            .await;
        let loaded = storage.load_candles("BTCUSDT", "1h").await;
        assert_eq!(loaded.len(), 2);

        // Keys are (symbol, timeframe) pairs.
        assert!(storage.load_candles("BTCUSDT", "1m").await.is_empty());
    }

    #[tokio::test]
    async fn empty_save_does_not_clobber() {
        let storage = MemoryStorage::new();
        storage.save_candles("BTCUSDT", "1h", &[candle(0)]).await;
        storage.save_candles("BTCUSDT", "1h", &[]).await;
        assert_eq!(storage.load_candles("BTCUSDT", "1h").await.len(), 1);
    }
}
