// =============================================================================
// marketfeed — hybrid push/pull market-data ingestion engine
// =============================================================================
//
// Live WebSocket streams are the primary feed; a REST polling scheduler
// covers staleness gaps and loads candle history. Everything lands in one
// bounded in-memory store that downstream consumers read from.
// =============================================================================

pub mod adapter;
pub mod config;
pub mod exchange;
pub mod gateway;
pub mod indicator;
pub mod persist;
pub mod scheduler;
pub mod store;
pub mod types;
