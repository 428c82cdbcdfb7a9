use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::error::{ErrorReport, PipelineError};
use crate::llm::{HealthReport, UsageStat};
use crate::pipeline::{BatchSummary, Orchestrator, RunPhase};
use crate::scheduler::RunLock;
use crate::telemetry::{DailyStat, RunRecord};

/// Records included in each `/status` list.
const STATUS_HISTORY_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub status_token: String,
    pub run_lock: RunLock,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/run", post(run_handler))
        .route("/run/test", post(run_test_handler))
        .with_state(state)
}

#[derive(serde::Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

#[derive(Serialize)]
struct DayStat {
    day: NaiveDate,
    #[serde(flatten)]
    stat: DailyStat,
}

#[derive(Serialize)]
struct DayUsage {
    day: NaiveDate,
    #[serde(flatten)]
    stat: UsageStat,
}

#[derive(Serialize)]
struct StatusReport {
    phase: RunPhase,
    schedule: &'static str,
    health: HealthReport,
    totals: DailyStat,
    daily: Vec<DayStat>,
    recent_runs: Vec<RunRecord>,
    recent_errors: Vec<RunRecord>,
    usage: Vec<DayUsage>,
}

fn error_response(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    let report = ErrorReport {
        kind: kind.to_string(),
        message: message.into(),
    };
    (status, Json(report)).into_response()
}

fn unauthorized() -> Response {
    error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing or invalid status token")
}

fn pipeline_status(err: &PipelineError) -> StatusCode {
    match err.kind() {
        "missing_credential" => StatusCode::SERVICE_UNAVAILABLE,
        "rate_limit_exceeded" | "rate_limited" => StatusCode::TOO_MANY_REQUESTS,
        "storage" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_GATEWAY,
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReport> {
    Json(state.orchestrator.llm().health())
}

async fn status_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    if !authenticate(&state.status_token, &query, &headers) {
        return unauthorized();
    }

    let orchestrator = &state.orchestrator;
    let telemetry = orchestrator.telemetry();
    let history = async {
        Ok::<_, anyhow::Error>((
            telemetry.totals().await?,
            telemetry.daily_stats().await?,
            telemetry.recent_runs(STATUS_HISTORY_LIMIT).await?,
            telemetry.recent_errors(STATUS_HISTORY_LIMIT).await?,
        ))
    };
    let (totals, daily, recent_runs, recent_errors) = match history.await {
        Ok(history) => history,
        Err(e) => {
            warn!(error = %e, "failed to read telemetry");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage", "failed to read telemetry");
        }
    };

    let report = StatusReport {
        phase: orchestrator.phase(),
        schedule: orchestrator.schedule().as_str(),
        health: orchestrator.llm().health(),
        totals,
        daily: daily.into_iter().map(|(day, stat)| DayStat { day, stat }).collect(),
        recent_runs,
        recent_errors,
        usage: orchestrator
            .llm()
            .usage_stats()
            .into_iter()
            .map(|(day, stat)| DayUsage { day, stat })
            .collect(),
    };
    Json(report).into_response()
}

async fn run_handler(State(state): State<AppState>, Query(query): Query<TokenQuery>, headers: HeaderMap) -> Response {
    if !authenticate(&state.status_token, &query, &headers) {
        return unauthorized();
    }
    let Ok(_guard) = state.run_lock.try_lock() else {
        return error_response(StatusCode::CONFLICT, "busy", "a generation run is already in progress");
    };
    summary_response(state.orchestrator.run_manual().await)
}

async fn run_test_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    if !authenticate(&state.status_token, &query, &headers) {
        return unauthorized();
    }
    let Ok(_guard) = state.run_lock.try_lock() else {
        return error_response(StatusCode::CONFLICT, "busy", "a generation run is already in progress");
    };
    summary_response(state.orchestrator.run_test().await)
}

fn summary_response(result: Result<BatchSummary, PipelineError>) -> Response {
    match result {
        Ok(summary) => Json(summary).into_response(),
        Err(err) => (pipeline_status(&err), Json(err.report())).into_response(),
    }
}

fn authenticate(status_token: &str, query: &TokenQuery, headers: &HeaderMap) -> bool {
    if let Some(ref token) = query.token
        && constant_time_eq(token, status_token)
    {
        debug!("authenticated via query param");
        return true;
    }

    if let Some(auth_header) = headers.get(header::AUTHORIZATION)
        && let Ok(auth_str) = auth_header.to_str()
        && let Some(token) = auth_str.strip_prefix("Bearer ")
        && constant_time_eq(token.trim(), status_token)
    {
        debug!("authenticated via bearer token");
        return true;
    }

    false
}

/// Constant-time string comparison to prevent timing attacks on token validation.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
