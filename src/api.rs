//! HTTP monitoring and manual approval surface.
//!
//! Four endpoints over the outcome store and the pending queue. No
//! authentication here: the service deploys behind a reverse proxy that
//! handles it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::Mode;
use crate::decision::{DecisionCounters, DecisionEngine};
use crate::error::{ApiError, ApiResult};
use crate::models::OutcomeRecord;
use crate::orchestrator::{ApproveError, Orchestrator};
use crate::pending::PendingQueue;
use crate::store::{OutcomeStatistics, OutcomeStore};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RECENT_LIMIT: i64 = 20;
const STATS_WINDOW_DAYS: i64 = 30;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: OutcomeStore,
    pub engine: Arc<DecisionEngine>,
    pub pending: Arc<PendingQueue>,
    pub orchestrator: Arc<Orchestrator>,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
}

/// Build the router with all routes and layers.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/decisions/recent", get(recent_decisions))
        .route("/stats", get(stats))
        .route("/approve/:kill_id", post(approve))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    mode: &'static str,
    version: &'static str,
    uptime_seconds: f64,
    pending_reviews: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = (Utc::now() - state.started_at).num_milliseconds() as f64 / 1000.0;
    Json(HealthResponse {
        status: "ok",
        mode: state.mode.as_str(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime,
        pending_reviews: state.pending.len(),
    })
}

#[derive(Serialize)]
struct RecentResponse {
    count: usize,
    decisions: Vec<OutcomeRecord>,
}

async fn recent_decisions(State(state): State<AppState>) -> ApiResult<Json<RecentResponse>> {
    let decisions = state
        .store
        .list_recent(RECENT_LIMIT)
        .await
        .map_err(|_| ApiError::StoreUnavailable)?;
    Ok(Json(RecentResponse {
        count: decisions.len(),
        decisions,
    }))
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    outcomes: OutcomeStatistics,
    decision_engine: DecisionCounters,
    auto_min_confidence: f64,
    mode: &'static str,
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<StatsResponse>> {
    let outcomes = state
        .store
        .statistics(STATS_WINDOW_DAYS)
        .await
        .map_err(|_| ApiError::StoreUnavailable)?;
    Ok(Json(StatsResponse {
        outcomes,
        decision_engine: state.engine.counters(),
        auto_min_confidence: state.engine.auto_min_confidence(),
        mode: state.mode.as_str(),
    }))
}

#[derive(Serialize)]
struct ApproveResponse {
    status: &'static str,
    kill_id: String,
    outcome_id: String,
    outcome_type: &'static str,
    result: &'static str,
}

async fn approve(
    State(state): State<AppState>,
    Path(kill_id): Path<String>,
) -> ApiResult<Json<ApproveResponse>> {
    let (record, result) = state
        .orchestrator
        .approve_pending(&kill_id)
        .await
        .map_err(|e| match e {
            ApproveError::NotPending => {
                ApiError::NotFound(format!("No pending review for kill_id: {kill_id}"))
            }
            ApproveError::InFlight => {
                ApiError::Conflict(format!("Approval already in flight for kill_id: {kill_id}"))
            }
            ApproveError::Store(_) => ApiError::StoreUnavailable,
        })?;

    Ok(Json(ApproveResponse {
        status: "approved",
        kill_id,
        outcome_id: record.outcome_id.to_string(),
        outcome_type: record.outcome_type.as_str(),
        result: result.as_str(),
    }))
}
