// =============================================================================
// Risk Sentinel — Main Entry Point
// =============================================================================
//
// The engine starts in Demo mode against the local fill simulator. Set
// `demo_mode: false` in the config (plus the exchange key env vars) to trade
// against the signed REST gateway.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod accounting;
mod api;
mod config;
mod engine_state;
mod exchange;
mod feed;
mod guard;
mod ledger;
mod retry;
mod scan;
mod sizer;
mod tracker;
mod types;
mod underwater;

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::EngineConfig;
use crate::engine_state::{AuditSink, EngineState};
use crate::exchange::{FeeSchedule, OrderGateway, RestGateway, SimGateway};
use crate::feed::{CachedPriceFeed, PriceFeed};
use crate::guard::ExitGuard;
use crate::ledger::TradeLedger;
use crate::scan::PositionScanner;
use crate::sizer::PositionSizer;
use crate::tracker::{ErosionTracker, RegimeCapTable};

const CONFIG_PATH: &str = "risk_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Risk Sentinel — Starting Up                      ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = EngineConfig::load_or_create(Path::new(CONFIG_PATH)).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        EngineConfig::default()
    });

    // Override pairs from env if available.
    if let Ok(pairs) = std::env::var("SENTINEL_PAIRS") {
        config.pairs = pairs
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.pairs.is_empty() {
        config.pairs = vec!["BTCUSDT".into()];
    }

    info!(
        bot_id = %config.bot_id,
        pairs = ?config.pairs,
        demo_mode = config.demo_mode,
        "Engine configuration loaded"
    );

    // ── 2. Build core components ─────────────────────────────────────────
    let ledger = Arc::new(TradeLedger::new());
    let sizer = Arc::new(PositionSizer::new(config.sizer, config.starting_balance));
    let feed = Arc::new(CachedPriceFeed::new());
    let tracker = Arc::new(ErosionTracker::new(RegimeCapTable));
    let fees = FeeSchedule::flat(config.taker_fee_rate);
    let audit = AuditSink::default();

    let gateway: Arc<dyn OrderGateway> = if config.demo_mode {
        info!("Demo mode: orders go to the local fill simulator");
        Arc::new(SimGateway::new(config.taker_fee_rate, config.starting_balance))
    } else {
        let api_key = std::env::var("EXCHANGE_API_KEY").unwrap_or_default();
        let api_secret = std::env::var("EXCHANGE_API_SECRET").unwrap_or_default();
        if api_key.is_empty() || api_secret.is_empty() {
            warn!("Live mode without exchange credentials — orders will be rejected");
        }
        let base_url = std::env::var("EXCHANGE_BASE_URL")
            .unwrap_or_else(|_| "https://api.binance.com".into());
        Arc::new(RestGateway::new(api_key, api_secret, base_url))
    };

    let guard = Arc::new(ExitGuard::new(
        config.bot_id.clone(),
        Arc::clone(&ledger),
        Arc::clone(&sizer),
        Arc::clone(&gateway),
        Arc::clone(&feed) as Arc<dyn PriceFeed>,
        fees.clone(),
        config.retry.policy(),
        config.max_quote_age_secs,
        audit.clone(),
    ));

    // Live accounts track the real exchange balance instead of the local
    // running total.
    if !config.demo_mode {
        match gateway.account_balance("USDT").await {
            Ok(balance) => {
                sizer.resync_balance(balance);
                info!(balance, "Balance resynced from exchange");
            }
            Err(e) => warn!(error = %e, "Could not resync balance — using configured start"),
        }
    }

    // ── 3. Shared state & API server ─────────────────────────────────────
    let state = Arc::new(EngineState::new(
        config.clone(),
        Arc::clone(&ledger),
        Arc::clone(&sizer),
        Arc::clone(&feed),
        Arc::clone(&guard),
        Arc::clone(&tracker),
        audit.clone(),
    ));

    let api_state = state.clone();
    let bind_addr =
        std::env::var("SENTINEL_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    // ── 4. Position scanner ──────────────────────────────────────────────
    let scanner = Arc::new(PositionScanner::new(
        Arc::clone(&ledger),
        Arc::clone(&feed) as Arc<dyn PriceFeed>,
        Arc::clone(&tracker),
        Arc::clone(&guard),
        fees,
        config.max_quote_age_secs,
        config.max_concurrent_closes,
        audit,
    ));
    tokio::spawn(Arc::clone(&scanner).run(config.scan_interval_secs));

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.config.read().save(Path::new(CONFIG_PATH)) {
        error!(error = %e, "Failed to save config on shutdown");
    }

    info!("Risk Sentinel shut down complete.");
    Ok(())
}
