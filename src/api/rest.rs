// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. This service fronts a single bot
// instance on a private network, so there is no authentication layer; CORS
// is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::engine_state::EngineState;
use crate::guard::CloseOutcome;
use crate::scan::evaluate_position;
use crate::sizer::SizingError;
use crate::types::{ExitIntent, ExitReason};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<EngineState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/positions/:id/health", get(position_health))
        .route("/api/v1/positions/:id/close", post(close_position))
        .route("/api/v1/size", post(size_position))
        .route("/api/v1/journal", get(journal))
        .route("/api/v1/journal/stats", get(journal_stats))
        .route("/api/v1/events", get(events))
        .route("/api/v1/errors", get(errors))
        .layer(cors)
        .with_state(state)
}

fn not_found(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
}

// =============================================================================
// Health & state
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.version(),
        server_time: Utc::now().timestamp_millis(),
    })
}

async fn full_state(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.snapshot())
}

// =============================================================================
// Positions
// =============================================================================

async fn positions(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.ledger.open_positions())
}

async fn position_health(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let pos = state
        .ledger
        .get(id)
        .ok_or_else(|| not_found("no open position with this id"))?;
    let report = evaluate_position(state.tracker.as_ref(), &pos, Utc::now());
    Ok(Json(report))
}

// =============================================================================
// Close
// =============================================================================

#[derive(Deserialize)]
struct CloseRequest {
    reason: ExitReason,
    #[serde(default)]
    price: Option<f64>,
}

async fn close_position(
    State(state): State<Arc<EngineState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<CloseRequest>,
) -> impl IntoResponse {
    let intent = match req.price {
        Some(p) => ExitIntent::at_price(req.reason, p),
        None => ExitIntent::new(req.reason),
    };
    info!(id = %id, reason = %req.reason, "close requested via API");
    state
        .audit
        .event(Some(id), "close_requested", format!("via API ({})", req.reason));

    // The guard records the outcome itself, reason included.
    let outcome = state.guard.close_position(id, intent).await;
    let status = match &outcome {
        CloseOutcome::Closed { .. } => StatusCode::OK,
        CloseOutcome::Deferred { .. } => StatusCode::ACCEPTED,
        CloseOutcome::Rejected { .. } => StatusCode::CONFLICT,
    };
    (status, Json(outcome))
}

// =============================================================================
// Sizing
// =============================================================================

#[derive(Deserialize)]
struct SizeRequest {
    /// Signal confidence in percent.
    confidence: f64,
    /// Current asset price.
    price: f64,
    /// Stop-loss distance from entry, in percent.
    stop_loss_pct: f64,
}

async fn size_position(
    State(state): State<Arc<EngineState>>,
    Json(req): Json<SizeRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let open_risk = state.ledger.open_risk_total();
    match state
        .sizer
        .size_position(req.confidence, req.price, req.stop_loss_pct, open_risk)
    {
        Ok(size) => Ok(Json(size)),
        Err(e @ SizingError::Validation(_)) => Err((
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
        Err(e @ SizingError::ExposureExceeded { .. }) => Err((
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": e.to_string() })),
        )),
    }
}

// =============================================================================
// Trade journal
// =============================================================================

#[derive(Deserialize)]
struct JournalQuery {
    #[serde(default = "default_journal_limit")]
    limit: usize,
}

fn default_journal_limit() -> usize {
    500
}

async fn journal(
    State(state): State<Arc<EngineState>>,
    Query(q): Query<JournalQuery>,
) -> impl IntoResponse {
    Json(state.ledger.closed_trades(q.limit))
}

async fn journal_stats(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    let closed = state.ledger.closed_trades(500);
    let total_trades = closed.len();
    if total_trades == 0 {
        return Json(serde_json::json!({
            "total_trades": 0,
            "win_rate": 0.0,
            "total_net_pnl": 0.0,
            "total_fees": 0.0,
            "profit_factor": 0.0,
        }));
    }
    let wins = closed.iter().filter(|t| t.net_pnl > 0.0).count();
    let win_rate = wins as f64 / total_trades as f64;
    let total_net_pnl: f64 = closed.iter().map(|t| t.net_pnl).sum();
    let total_fees: f64 = closed.iter().map(|t| t.total_fees).sum();
    let gross_profit: f64 = closed
        .iter()
        .filter(|t| t.net_pnl > 0.0)
        .map(|t| t.net_pnl)
        .sum();
    let gross_loss: f64 = closed
        .iter()
        .filter(|t| t.net_pnl < 0.0)
        .map(|t| t.net_pnl.abs())
        .sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    Json(serde_json::json!({
        "total_trades": total_trades,
        "win_rate": win_rate,
        "total_net_pnl": total_net_pnl,
        "total_fees": total_fees,
        "profit_factor": profit_factor,
    }))
}

// =============================================================================
// Events & errors
// =============================================================================

async fn events(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.audit.events.recent(100))
}

async fn errors(State(state): State<Arc<EngineState>>) -> impl IntoResponse {
    Json(state.audit.errors.recent(100))
}
