// =============================================================================
// Candle series — ordered, deduplicated OHLCV storage with a high-water-mark
// =============================================================================
//
// All numeric fields are `rust_decimal::Decimal`: derived calculations must
// not accumulate binary-float rounding error.
// =============================================================================

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Hard ceiling on candles kept per (symbol, timeframe), applied even when a
/// caller opts out of the configured limit (`enforce_limit = false`).
pub const MAX_SERIES_HARD_CAP: usize = 50_000;

/// One OHLCV data point. `time_ms` is the exchange-aligned bucket open time
/// and the unique key within a series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub time_ms: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Candle {
    /// A synthesized flat candle: open = high = low = close, zero volume.
    /// Used by gap-filling to stand in for buckets the exchange never sent.
    pub fn flat(time_ms: i64, close: Decimal) -> Self {
        Self {
            time_ms,
            open: close,
            high: close,
            low: close,
            close,
            volume: Decimal::ZERO,
        }
    }
}

/// Where a kline batch came from. Only used for logging and diagnostics; the
/// merge treats both sources identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlineSource {
    Push,
    Rest,
}

impl std::fmt::Display for KlineSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::Rest => write!(f, "rest"),
        }
    }
}

// =============================================================================
// CandleSeries
// =============================================================================

/// An ordered candle sequence keyed by `time_ms`: strictly ascending, one
/// candle per timestamp.
///
/// The `high_water_mark` records the largest retention the series has ever
/// been granted. A deliberate deep-history load (`enforce_limit = false`)
/// raises it, and every later enforced merge truncates to
/// `max(high_water_mark, configured_limit)` — so a small live update can
/// never silently throw away history that was already loaded.
#[derive(Debug, Clone, Default)]
pub struct CandleSeries {
    candles: Vec<Candle>,
    high_water_mark: usize,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn oldest_time(&self) -> Option<i64> {
        self.candles.first().map(|c| c.time_ms)
    }

    pub fn newest_time(&self) -> Option<i64> {
        self.candles.last().map(|c| c.time_ms)
    }

    /// Merge an incoming batch into the series.
    ///
    /// The batch may be unsorted, contain duplicate timestamps, and overlap
    /// any part of the existing data. For timestamps present on both sides
    /// the batch value wins (in-place update of a live candle); within the
    /// batch itself the last occurrence wins. The result is re-sorted and
    /// deduplicated, then truncated tail-first (newest kept) to the
    /// effective limit.
    ///
    /// Idempotent: merging the same batch twice yields the same series.
    pub fn merge(&mut self, batch: &[Candle], configured_limit: usize, enforce_limit: bool) -> usize {
        if batch.is_empty() {
            return self.candles.len();
        }

        // BTreeMap gives us the sort + dedupe in one pass; later inserts
        // overwrite earlier ones, which is exactly the last-writer rule.
        let mut merged: BTreeMap<i64, Candle> = self
            .candles
            .drain(..)
            .map(|c| (c.time_ms, c))
            .collect();
        for candle in batch {
            merged.insert(candle.time_ms, candle.clone());
        }

        let mut candles: Vec<Candle> = merged.into_values().collect();

        let effective_limit = if enforce_limit {
            self.high_water_mark.max(configured_limit)
        } else {
            MAX_SERIES_HARD_CAP
        };

        if candles.len() > effective_limit {
            // Keep the tail: most recent candles survive.
            candles.drain(..candles.len() - effective_limit);
        }

        self.candles = candles;
        // The mark never decreases, and defaults to the configured limit so a
        // short series still has headroom up to the user's setting.
        self.high_water_mark = self
            .high_water_mark
            .max(configured_limit)
            .max(self.candles.len());

        self.candles.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
