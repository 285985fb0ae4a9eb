// =============================================================================
// Indicator collaborator — computed off the hot path via store events
// =============================================================================
//
// Pure calculators behind a trait; a small worker pool subscribes to
// `StoreEvent`s and writes results back through the store's buffered write
// API. Indicator writes do not emit merge events, so there is no feedback
// loop.
// =============================================================================

use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::store::{Candle, SeriesStore, SnapshotPatch, StoreEvent};
use crate::types::now_ms;

#[derive(Debug, Clone)]
pub struct IndicatorConfig {
    pub sma_period: usize,
    pub roc_period: usize,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            sma_period: 20,
            roc_period: 14,
        }
    }
}

/// Derived values attached to a symbol snapshot. `None` means insufficient
/// data, never zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndicatorSet {
    pub timeframe: String,
    pub sma: Option<Decimal>,
    pub roc: Option<Decimal>,
    pub computed_at_ms: i64,
}

pub trait IndicatorCalculator: Send + Sync {
    fn compute(&self, candles: &[Candle], config: &IndicatorConfig) -> IndicatorSet;
}

// =============================================================================
// Default calculator
// =============================================================================

/// Simple moving average of the last `period` closes.
pub fn current_sma(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let sum: Decimal = candles[candles.len() - period..]
        .iter()
        .map(|c| c.close)
        .sum();
    Some(sum / Decimal::from(period as u64))
}

/// Percentage change in close over a look-back of `period` candles.
pub fn current_roc(candles: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || candles.len() <= period {
        return None;
    }
    let prev = candles[candles.len() - 1 - period].close;
    if prev.is_zero() {
        return Some(Decimal::ZERO);
    }
    let last = candles[candles.len() - 1].close;
    Some((last - prev) / prev * Decimal::ONE_HUNDRED)
}

#[derive(Debug, Default)]
pub struct BasicCalculator;

impl IndicatorCalculator for BasicCalculator {
    fn compute(&self, candles: &[Candle], config: &IndicatorConfig) -> IndicatorSet {
        IndicatorSet {
            timeframe: String::new(),
            sma: current_sma(candles, config.sma_period),
            roc: current_roc(candles, config.roc_period),
            computed_at_ms: now_ms(),
        }
    }
}

// =============================================================================
// Worker pool
// =============================================================================

/// Run `workers` tasks over the store's event stream. Each worker owns its
/// own broadcast receiver and handles the shard of symbols that hash to its
/// index, so every event is computed exactly once.
pub fn spawn_indicator_pool(
    store: Arc<SeriesStore>,
    calculator: Arc<dyn IndicatorCalculator>,
    config: IndicatorConfig,
    workers: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    let workers = workers.max(1);
    (0..workers)
        .map(|index| {
            let store = Arc::clone(&store);
            let calculator = Arc::clone(&calculator);
            let config = config.clone();
            let mut events = store.subscribe_events();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(StoreEvent::KlinesMerged { symbol, timeframe }) => {
                            if shard(&symbol, workers) != index {
                                continue;
                            }
                            handle_merge(&store, calculator.as_ref(), &config, &symbol, &timeframe);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(worker = index, missed, "indicator worker lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        })
        .collect()
}

fn shard(symbol: &str, workers: usize) -> usize {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    symbol.hash(&mut hasher);
    (hasher.finish() as usize) % workers
}

fn handle_merge(
    store: &SeriesStore,
    calculator: &dyn IndicatorCalculator,
    config: &IndicatorConfig,
    symbol: &str,
    timeframe: &str,
) {
    let Some(candles) = store.series_candles(symbol, timeframe) else {
        return;
    };
    let mut set = calculator.compute(&candles, config);
    set.timeframe = timeframe.to_string();
    debug!(symbol = %symbol, timeframe = %timeframe, "indicators recomputed");
    store.update_symbol(
        symbol,
        SnapshotPatch {
            indicators: Some(set),
            ..Default::default()
        },
    );
}

// =============================================================================
// Tests
// =============================================================================
