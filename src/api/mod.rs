//! HTTP facade — thin JSON-body endpoints over the run subsystem.
//!
//! Every non-stream response uses the `{success, code?, message?, data?,
//! error?}` envelope; paged listings wrap their content as `{content, page,
//! size, totalElements, totalPages}`. The stream endpoint lives in
//! `api::sse` and is the only long-lived response, so the request timeout
//! layer wraps everything except it.

pub mod sse;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::error::ApiError;
use crate::hierarchy::{AgentProfile, Hierarchy, Team};
use crate::run::RunManager;
use crate::store::events::EventRepository;
use crate::store::hierarchies::HierarchyRepository;
use crate::store::runs::{RunFilter, RunRepository, RunStatus};
use crate::stream::StreamRegistry;

/// Maximum request body size — run tasks are text, not uploads.
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout for everything except the stream endpoint.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub runs: RunRepository,
    pub hierarchies: HierarchyRepository,
    pub events: EventRepository,
    pub manager: Arc<RunManager>,
    pub registry: Arc<StreamRegistry>,
    pub api_base: String,
}

/// Build the full router, endpoints nested under `api_base`.
pub fn router(state: AppState) -> Router {
    let api_base = state.api_base.clone();
    let api = Router::new()
        .route("/runs/start", post(start_run))
        .route("/runs/list", post(list_runs))
        .route("/runs/get", post(get_run))
        .route("/runs/cancel", post(cancel_run))
        .route("/runs/events", post(run_events))
        .route("/hierarchies/create", post(create_hierarchy))
        .route("/hierarchies/get", post(get_hierarchy))
        .route("/hierarchies/list", post(list_hierarchies))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
        // Registered after the timeout layer: an SSE response outlives any
        // sane request deadline.
        .route("/runs/stream", post(sse::stream_run));

    Router::new()
        .route("/health", get(health))
        .nest(&api_base, api)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .with_state(state)
}

fn ok(data: serde_json::Value) -> Json<serde_json::Value> {
    Json(serde_json::json!({"success": true, "data": data}))
}

fn ok_message(message: &str, data: serde_json::Value) -> Json<serde_json::Value> {
    Json(serde_json::json!({"success": true, "message": message, "data": data}))
}

fn page_response(
    content: Vec<serde_json::Value>,
    page: u32,
    size: u32,
    total: u64,
) -> Json<serde_json::Value> {
    let total_pages = total.div_ceil(u64::from(size.max(1)));
    Json(serde_json::json!({
        "success": true,
        "data": {
            "content": content,
            "page": page,
            "size": size,
            "totalElements": total,
            "totalPages": total_pages,
        }
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

// ── Runs ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    hierarchy_id: String,
    task: String,
}

#[derive(Debug, Deserialize)]
struct IdRequest {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListRunsRequest {
    #[serde(default = "default_page")]
    page: u32,
    #[serde(default = "default_size")]
    size: u32,
    #[serde(default)]
    hierarchy_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

fn default_page() -> u32 {
    1
}

fn default_size() -> u32 {
    20
}

async fn start_run(
    State(state): State<AppState>,
    Json(body): Json<StartRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.hierarchy_id.trim().is_empty() {
        return Err(ApiError::Validation("hierarchy_id is required".into()));
    }
    if body.task.trim().is_empty() {
        return Err(ApiError::Validation("task is required".into()));
    }

    let run = state.manager.start_run(&body.hierarchy_id, &body.task)?;
    let stream_url = format!("{}/runs/stream", state.api_base);
    Ok(ok_message(
        "Run started",
        serde_json::json!({
            "id": run.id,
            "hierarchy_id": run.hierarchy_id,
            "task": run.task,
            "status": run.status.as_str(),
            "stream_url": stream_url,
            "created_at": crate::event::format_timestamp(run.created_at),
        }),
    ))
}

async fn list_runs(
    State(state): State<AppState>,
    Json(body): Json<ListRunsRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let status = body
        .status
        .as_deref()
        .map(str::parse::<RunStatus>)
        .transpose()
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    let filter = RunFilter {
        hierarchy_id: body.hierarchy_id,
        status,
    };
    let (runs, total) = state.runs.list(body.page, body.size, &filter)?;
    let content = runs.iter().map(|r| r.to_json()).collect();
    Ok(page_response(content, body.page.max(1), body.size, total))
}

async fn get_run(
    State(state): State<AppState>,
    Json(body): Json<IdRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .runs
        .get(&body.id)?
        .ok_or_else(|| ApiError::not_found(format!("Run '{}' not found", body.id)))?;
    Ok(ok(run.to_json()))
}

async fn cancel_run(
    State(state): State<AppState>,
    Json(body): Json<IdRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .runs
        .get(&body.id)?
        .ok_or_else(|| ApiError::not_found(format!("Run '{}' not found", body.id)))?;

    if !matches!(run.status, RunStatus::Pending | RunStatus::Running) {
        return Err(ApiError::conflict(format!(
            "Run status is {}, cannot cancel",
            run.status
        )));
    }

    if !state.manager.cancel_run(&body.id) {
        // No executor state (e.g. scheduled before a restart): repair the
        // row directly.
        state.runs.update_status(
            &body.id,
            RunStatus::Cancelled,
            crate::store::runs::StatusChanges::default(),
        )?;
    }
    Ok(ok_message(
        "Run cancelled",
        serde_json::json!({"id": body.id}),
    ))
}

async fn run_events(
    State(state): State<AppState>,
    Json(body): Json<IdRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .runs
        .get(&body.id)?
        .ok_or_else(|| ApiError::not_found(format!("Run '{}' not found", body.id)))?;
    let events = state.events.list(&body.id)?;
    Ok(ok(serde_json::json!({
        "run_id": run.id,
        "status": run.status.as_str(),
        "events": events.iter().map(|e| e.to_wire()).collect::<Vec<_>>(),
    })))
}

// ── Hierarchies ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateHierarchyRequest {
    name: String,
    supervisor: AgentProfile,
    #[serde(default)]
    teams: Vec<Team>,
}

async fn create_hierarchy(
    State(state): State<AppState>,
    Json(body): Json<CreateHierarchyRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("name is required".into()));
    }
    let hierarchy = state.hierarchies.create(Hierarchy {
        id: String::new(),
        name: body.name,
        supervisor: body.supervisor,
        teams: body.teams,
    })?;
    Ok((
        StatusCode::CREATED,
        ok_message(
            "Hierarchy created",
            serde_json::to_value(&hierarchy).unwrap_or_default(),
        ),
    ))
}

async fn get_hierarchy(
    State(state): State<AppState>,
    Json(body): Json<IdRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let hierarchy = state
        .hierarchies
        .get(&body.id)?
        .ok_or_else(|| ApiError::not_found(format!("Hierarchy '{}' not found", body.id)))?;
    Ok(ok(serde_json::to_value(&hierarchy).unwrap_or_default()))
}

async fn list_hierarchies(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let hierarchies = state.hierarchies.list()?;
    let total = hierarchies.len();
    Ok(ok(serde_json::json!({
        "content": hierarchies,
        "totalElements": total,
    })))
}
