// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Public endpoints (health) require no
// authentication. All other endpoints require a valid Bearer token checked via
// the `AuthBearer` extractor.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::backtest::{fetch_history, run_backtest, run_grid_search, BacktestReport, GridAxis, GridResult};
use crate::bot_manager::{AddPairError, BotManager};
use crate::domain::{PairRecord, StrategySettings};
use crate::exchange::binance::BinanceClient;
use crate::types::Market;

/// Shared state for the REST + WS API: the bot manager plus a standalone
/// Binance client used only to pull historical klines for backtests
/// (the live exchange registry inside `BotManager` is for order placement,
/// not history downloads).
pub struct ApiState {
    pub manager: Arc<BotManager>,
    pub binance: Arc<BinanceClient>,
    optimize_runs: RwLock<HashMap<String, Vec<GridResult>>>,
    next_run_id: AtomicU64,
}

impl ApiState {
    pub fn new(manager: Arc<BotManager>, binance: Arc<BinanceClient>) -> Arc<Self> {
        Arc::new(Self {
            manager,
            binance,
            optimize_runs: RwLock::new(HashMap::new()),
            next_run_id: AtomicU64::new(1),
        })
    }

    fn store_run(&self, results: Vec<GridResult>) -> String {
        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let run_id = format!("opt-{id}");
        self.optimize_runs.write().insert(run_id.clone(), results);
        run_id
    }
}

fn err_response(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn market_for(exchange: &str) -> Market {
    if exchange.ends_with("_futures") {
        Market::Futures
    } else {
        Market::Spot
    }
}

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Pair lifecycle (authenticated) ──────────────────────────
        .route("/api/v1/pairs", get(list_pairs))
        .route("/api/v1/pairs", post(add_pair))
        .route("/api/v1/pairs/:id", delete(remove_pair))
        .route("/api/v1/pairs/:id/start", post(start_pair))
        .route("/api/v1/pairs/:id/stop", post(stop_pair))
        .route("/api/v1/pairs/:id/settings", put(update_settings))
        .route("/api/v1/pairs/:id/close", post(close_pair))
        .route("/api/v1/pairs/:id/protection/refresh", post(refresh_protection))
        .route("/api/v1/pairs/:id/protection/cancel", post(cancel_protection))
        .route("/api/v1/pairs/:id/orders/cancel", post(cancel_orders))
        // ── Global control (authenticated) ──────────────────────────
        .route("/api/v1/control/emergency-stop", post(emergency_stop))
        // ── Backtest / optimizer (authenticated) ────────────────────
        .route("/api/v1/backtest", post(run_backtest_endpoint))
        .route("/api/v1/optimize", post(run_optimize_endpoint))
        .route("/api/v1/optimize/:id/apply", post(apply_optimize_result))
        // ── WebSocket (handled separately in ws module but mounted here) ─
        .route("/api/v1/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    active_pairs: usize,
    server_time: i64,
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        active_pairs: state.manager.list_pairs().len(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Pair lifecycle
// =============================================================================

async fn list_pairs(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let pairs: Vec<PairRecord> = state.manager.list_pairs();
    Json(pairs)
}

#[derive(Deserialize)]
struct AddPairRequest {
    pair_id: String,
    exchange: String,
    settings: StrategySettings,
}

async fn add_pair(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Json(req): Json<AddPairRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    state
        .manager
        .add_pair(&req.pair_id, &req.exchange, req.settings)
        .await
        .map_err(|e| match e {
            AddPairError::AlreadyExists => err_response(StatusCode::CONFLICT, e.to_string()),
            AddPairError::BacktestRunModeForbidden => err_response(StatusCode::BAD_REQUEST, e.to_string()),
            AddPairError::UnknownExchange(_) => err_response(StatusCode::BAD_REQUEST, e.to_string()),
        })?;
    info!(pair_id = %req.pair_id, "pair added via API");
    Ok(Json(serde_json::json!({ "pair_id": req.pair_id, "status": "added" })))
}

async fn remove_pair(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    state.manager.remove_pair(&id);
    info!(pair_id = %id, "pair removed via API");
    Json(serde_json::json!({ "pair_id": id, "status": "removed" }))
}

async fn start_pair(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let started = state.manager.start_pair(&id);
    if !started {
        return err_response(StatusCode::NOT_FOUND, format!("unknown pair {id}")).into_response();
    }
    Json(serde_json::json!({ "pair_id": id, "status": "started" })).into_response()
}

async fn stop_pair(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let stopped = state.manager.stop_pair(&id);
    if !stopped {
        return err_response(StatusCode::NOT_FOUND, format!("unknown pair {id}")).into_response();
    }
    Json(serde_json::json!({ "pair_id": id, "status": "stopped" })).into_response()
}

async fn update_settings(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(settings): Json<StrategySettings>,
) -> impl IntoResponse {
    match state.manager.update_pair_settings(&id, settings).await {
        Ok(()) => Json(serde_json::json!({ "pair_id": id, "status": "updated" })).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn close_pair(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.close_pair_now(&id).await {
        Ok(()) => Json(serde_json::json!({ "pair_id": id, "status": "closed" })).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn refresh_protection(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.refresh_protection(&id).await {
        Ok(()) => Json(serde_json::json!({ "pair_id": id, "status": "protection_refreshed" })).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn cancel_protection(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.cancel_protection(&id).await {
        Ok(()) => Json(serde_json::json!({ "pair_id": id, "status": "protection_cancelled" })).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn cancel_orders(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.manager.cancel_orders(&id).await {
        Ok(()) => Json(serde_json::json!({ "pair_id": id, "status": "orders_cancelled" })).into_response(),
        Err(e) => err_response(StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

// =============================================================================
// Global control
// =============================================================================

async fn emergency_stop(_auth: AuthBearer, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    warn!("emergency stop requested via API");
    state.manager.emergency_stop_all().await;
    Json(serde_json::json!({ "status": "all pairs stopped" }))
}

// =============================================================================
// Backtest / optimizer
// =============================================================================

#[derive(Deserialize)]
struct HistoryRequest {
    exchange: String,
    symbol: String,
    interval: String,
    start_time_ms: i64,
    #[serde(default = "default_initial_balance")]
    initial_balance: f64,
}

fn default_initial_balance() -> f64 {
    10_000.0
}

#[derive(Deserialize)]
struct BacktestRequest {
    #[serde(flatten)]
    history: HistoryRequest,
    settings: StrategySettings,
}

async fn run_backtest_endpoint(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Json(req): Json<BacktestRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let market = market_for(&req.history.exchange);
    let candles = fetch_history(
        &state.binance,
        market,
        &req.history.symbol,
        &req.history.interval,
        req.history.start_time_ms,
    )
    .await
    .map_err(|e| err_response(StatusCode::BAD_GATEWAY, e.to_string()))?;

    let report: BacktestReport = run_backtest(&req.settings, &candles, req.history.initial_balance);
    Ok(Json(report))
}

#[derive(Deserialize)]
struct OptimizeRequest {
    #[serde(flatten)]
    history: HistoryRequest,
    base_settings: StrategySettings,
    axes: Vec<GridAxis>,
    #[serde(default = "crate::backtest::optimizer::default_max_parallel_tasks")]
    max_parallel_tasks: usize,
}

#[derive(Serialize)]
struct OptimizeResponse {
    run_id: String,
    results: Vec<GridResult>,
}

async fn run_optimize_endpoint(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Json(req): Json<OptimizeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let market = market_for(&req.history.exchange);
    let candles = fetch_history(
        &state.binance,
        market,
        &req.history.symbol,
        &req.history.interval,
        req.history.start_time_ms,
    )
    .await
    .map_err(|e| err_response(StatusCode::BAD_GATEWAY, e.to_string()))?;

    let results = run_grid_search(
        req.base_settings,
        &req.axes,
        Arc::new(candles),
        req.history.initial_balance,
        req.max_parallel_tasks,
    )
    .await;

    let run_id = state.store_run(results.clone());
    Ok(Json(OptimizeResponse { run_id, results }))
}

#[derive(Deserialize)]
struct ApplyOptimizeRequest {
    pair_id: String,
    result_index: usize,
}

async fn apply_optimize_result(
    _auth: AuthBearer,
    State(state): State<Arc<ApiState>>,
    Path(run_id): Path<String>,
    Json(req): Json<ApplyOptimizeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let settings = {
        let runs = state.optimize_runs.read();
        let Some(results) = runs.get(&run_id) else {
            return Err(err_response(StatusCode::NOT_FOUND, format!("unknown optimize run {run_id}")));
        };
        let Some(result) = results.get(req.result_index) else {
            return Err(err_response(StatusCode::BAD_REQUEST, "result_index out of range"));
        };
        result.settings.clone()
    };

    state
        .manager
        .update_pair_settings(&req.pair_id, settings)
        .await
        .map_err(|e| err_response(StatusCode::BAD_REQUEST, e.to_string()))?;

    info!(run_id = %run_id, pair_id = %req.pair_id, "optimize result applied to pair");
    Ok(Json(serde_json::json!({ "pair_id": req.pair_id, "status": "settings_applied" })))
}
