// =============================================================================
// marketfeed — entry point
// =============================================================================

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use marketfeed::config::EngineConfig;
use marketfeed::exchange::BitunixRest;
use marketfeed::gateway::{GatewayConfig, PushGateway};
use marketfeed::indicator::{self, BasicCalculator, IndicatorConfig};
use marketfeed::persist::MemoryStorage;
use marketfeed::scheduler::{PullScheduler, SchedulerConfig};
use marketfeed::store::SeriesStore;

const CONFIG_PATH: &str = "marketfeed.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = EngineConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    if let Ok(syms) = std::env::var("MARKETFEED_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    info!(symbols = ?config.symbols, channels = ?config.channels, "configured watch list");

    // Credentials only via environment; never persisted to the config file.
    let api_key = std::env::var("BITUNIX_API_KEY").ok().filter(|s| !s.is_empty());
    let api_secret = std::env::var("BITUNIX_API_SECRET").ok().filter(|s| !s.is_empty());

    // ── 2. Series store ──────────────────────────────────────────────────
    let store = Arc::new(SeriesStore::new(
        config.cache_size,
        (config.cache_ttl_secs as i64) * 1_000,
        config.history_limit,
    ));
    tokio::spawn(Arc::clone(&store).run_flush_loop(config.flush_interval_ms));
    tokio::spawn(Arc::clone(&store).run_ttl_sweep());

    // ── 3. Push gateway ──────────────────────────────────────────────────
    let gateway = PushGateway::new(
        Arc::clone(&store),
        GatewayConfig {
            public_url: config.public_ws_url.clone(),
            private_url: config.private_ws_url.clone(),
            api_key,
            api_secret,
        },
    );
    gateway.start();

    // ── 4. Pull scheduler ────────────────────────────────────────────────
    let scheduler = PullScheduler::new(
        Arc::clone(&store),
        Arc::new(BitunixRest::new(None)),
        Arc::new(MemoryStorage::new()),
        Arc::clone(&gateway),
        SchedulerConfig {
            poll_interval_secs: config.poll_interval_secs,
            concurrency_cap: config.poll_concurrency,
            staleness_ms: config.staleness_ms,
            history_limit: config.history_limit,
        },
    );
    tokio::spawn(Arc::clone(&scheduler).run());

    // ── 5. Indicator workers ─────────────────────────────────────────────
    indicator::spawn_indicator_pool(
        Arc::clone(&store),
        Arc::new(BasicCalculator),
        IndicatorConfig::default(),
        config.indicator_workers,
    );

    // ── 6. Register the configured watch list ────────────────────────────
    for symbol in &config.symbols {
        for channel in &config.channels {
            scheduler.register(symbol, channel);
        }
    }

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler.stop();
    store.flush();
    if let Err(e) = config.save(CONFIG_PATH) {
        warn!(error = %e, "failed to save config on shutdown");
    }
    Ok(())
}
