// =============================================================================
// Meridian — Main Entry Point
// =============================================================================
//
// Boots the state store, registers the exchanges a pair can reference,
// starts one market feed per exchange, replays persisted pairs through the
// bot manager, and serves the operator API. Pairs only ever run after an
// explicit `start` call (or `auto_resume_running_pairs` on their own
// settings) — nothing trades just because the process started.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod backtest;
mod bot_manager;
mod config;
mod domain;
mod exchange;
mod indicators;
mod market_feed;
mod order_manager;
mod pair_worker;
mod risk;
mod store;
mod strategy;
mod types;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::bot_manager::BotManager;
use crate::config::AppConfig;
use crate::exchange::binance::BinanceClient;
use crate::exchange::stub::StubExchange;
use crate::exchange::ExchangeClient;
use crate::market_feed::MarketFeed;
use crate::store::StateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("meridian starting up");

    let config = AppConfig::load_or_init("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load app config, using defaults");
        AppConfig::default()
    });

    let db_path = std::env::var("MERIDIAN_DB_PATH").unwrap_or_else(|_| "meridian.db".to_string());
    let bind_addr = std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| config.bind_addr.clone());

    info!(db_path = %db_path, default_symbols = ?config.default_symbols, "configuration loaded");

    // ── 2. State store ────────────────────────────────────────────────────
    let store = StateStore::init(db_path).await?;

    // ── 3. Exchange registry ──────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let requests_per_second = (config.rate_limit_weight_per_minute / 60).max(1);

    let binance = Arc::new(BinanceClient::with_rate_limit(api_key, api_secret, requests_per_second));

    let mut exchanges: HashMap<String, Arc<dyn ExchangeClient>> = HashMap::new();
    exchanges.insert("binance_spot".to_string(), binance.clone());
    exchanges.insert("binance_futures".to_string(), binance.clone());
    exchanges.insert("paper".to_string(), Arc::new(StubExchange::new("paper")));

    // ── 4. Market feeds: one per exchange, shared by every pair on it ────
    let mut feeds: HashMap<String, Arc<MarketFeed>> = HashMap::new();
    for name in exchanges.keys() {
        let feed = Arc::new(MarketFeed::new());
        feed.start();
        feeds.insert(name.clone(), feed);
    }

    // ── 5. Bot manager: loads persisted pairs and resumes the ones flagged
    //    for auto-resume ───────────────────────────────────────────────────
    let manager = BotManager::new(store, exchanges, feeds);
    manager.startup().await?;

    // ── 6. Operator API ───────────────────────────────────────────────────
    let api_state = ApiState::new(manager.clone(), binance);
    let app = api::router(api_state);

    info!(addr = %bind_addr, "operator API listening");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    let shutdown_manager = manager.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received — stopping gracefully");
        shutdown_manager.shutdown().await;
    });

    server.await?;
    info!("meridian shut down complete");
    Ok(())
}
