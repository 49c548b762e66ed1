//! REST API for task admission and status readback
//!
//! A thin synchronous boundary over the orchestrator: handlers validate,
//! delegate to the queue/registry/store, and translate outcomes into the
//! JSON envelope. No business logic lives here.
//!
//! Every response is `{"success": true, "data": ...}` or
//! `{"success": false, "error": {"kind": ..., "message": ...}}` with the
//! error kind one of `not_found`, `invalid_argument`, `unavailable`,
//! `internal`.

use crate::queue::{AdmissionError, TaskQueue};
use crate::registry::WorkerRegistry;
use crate::store::Store;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use shared::config::NodeConfig;
use shared::task::{TaskParams, TaskStatus};
use shared::utils::current_timestamp_secs_f64;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Application state shared across all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    pub store: Arc<Mutex<Store>>,
    pub queue: Arc<Mutex<TaskQueue>>,
    pub registry: Arc<Mutex<WorkerRegistry>>,
    /// Startup instant for the uptime figure.
    pub started_at: f64,
}

/// Creates the API router with all routes. Called once at startup.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks/submit", post(submit_task))
        .route("/api/tasks/{task_id}/status", get(get_task_status))
        .route("/api/tasks/{task_id}/cancel", post(cancel_task))
        .route("/api/tasks", get(list_tasks))
        .route("/api/workers", get(list_workers))
        .route("/api/status", get(get_status))
        .route("/api/health", get(health_check))
        .with_state(state)
}

/// Body of a task submission.
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    /// Mandatory; its absence is the one admission error callers see often.
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<u64>,
    pub task_id: Option<String>,
    pub model_name: Option<String>,
}

/// Success envelope.
fn ok(data: serde_json::Value) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "success": true, "data": data }))
}

async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let prompt = match request.prompt {
        Some(prompt) if !prompt.trim().is_empty() => prompt,
        _ => {
            return Err(ApiError::InvalidArgument("prompt required".to_string()));
        }
    };

    let params = TaskParams {
        prompt,
        negative_prompt: request.negative_prompt.unwrap_or_default(),
        width: request.width.unwrap_or_else(shared::defaults::default_width),
        height: request
            .height
            .unwrap_or_else(shared::defaults::default_height),
        steps: request.steps.unwrap_or_else(shared::defaults::default_steps),
        guidance_scale: request
            .cfg_scale
            .unwrap_or_else(shared::defaults::default_guidance_scale),
        seed: request.seed,
        model_name: request
            .model_name
            .unwrap_or_else(|| state.config.processing.default_model.clone()),
    };

    // Empty string means "mint one for me", same as absent.
    let task_id = request.task_id.filter(|id| !id.is_empty());

    let submitted = {
        let mut queue = state.queue.lock().await;
        queue.submit(task_id, params).await
    };

    match submitted {
        Ok(task_id) => {
            info!(task_id = %task_id, "Task submitted via API");
            Ok(ok(serde_json::json!({
                "task_id": task_id,
                "status": "queued",
            })))
        }
        Err(e @ AdmissionError::DuplicateTaskId(_)) => {
            warn!("Task admission failed: {}", e);
            Err(ApiError::InvalidArgument(e.to_string()))
        }
    }
}

async fn get_task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // In-memory records first; they are fresher than the Store.
    {
        let queue = state.queue.lock().await;
        if let Some(record) = queue.get(&task_id) {
            return Ok(ok(serde_json::json!({
                "task_id": task_id,
                "status": record.status,
                "details": record,
            })));
        }
    }

    // Older tasks may only survive in the Store.
    let row = {
        let mut store = state.store.lock().await;
        store
            .get_task(&task_id)
            .await
            .map_err(|e| ApiError::Unavailable(format!("store lookup failed: {}", e)))?
    };

    match row {
        Some(row) => {
            // A row whose status is not a known lifecycle label is corrupt
            // durable state, not a transient store outage.
            if TaskStatus::parse(&row.status).is_none() {
                error!(
                    task_id = %task_id,
                    status = %row.status,
                    "Task row carries an unknown status label"
                );
                return Err(ApiError::Internal(format!(
                    "Task {} has an unrecognized status",
                    task_id
                )));
            }
            Ok(ok(serde_json::json!({
                "task_id": task_id,
                "status": row.status,
                "details": row,
            })))
        }
        None => Err(ApiError::NotFound(format!("Task {} not found", task_id))),
    }
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let cancelled = {
        let mut queue = state.queue.lock().await;
        queue.cancel(&task_id)
    };

    if !cancelled {
        return Err(ApiError::InvalidArgument(format!(
            "Task {} cannot be cancelled",
            task_id
        )));
    }

    // Best-effort durable write; the in-memory record is already terminal.
    {
        let mut store = state.store.lock().await;
        if let Err(e) = store
            .update_task_status(
                &task_id,
                TaskStatus::Cancelled,
                None,
                None,
                None,
                None,
                None,
            )
            .await
        {
            error!("Failed to persist cancellation of {}: {}", task_id, e);
        }
    }

    Ok(ok(serde_json::json!({
        "task_id": task_id,
        "status": "cancelled",
    })))
}

async fn list_tasks(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.queue.lock().await.stats();
    Ok(ok(serde_json::json!({
        "tasks": stats,
        "timestamp": current_timestamp_secs_f64(),
    })))
}

async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.registry.lock().await.stats();
    Ok(ok(serde_json::json!({
        "workers": stats,
        "timestamp": current_timestamp_secs_f64(),
    })))
}

async fn get_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = current_timestamp_secs_f64();
    let task_stats = state.queue.lock().await.stats();
    let worker_stats = state.registry.lock().await.stats();

    Ok(ok(serde_json::json!({
        "status": {
            "uptime": now - state.started_at,
            "running": true,
            "tasks": task_stats,
            "workers": worker_stats,
            "api": {
                "host": state.config.api.host,
                "port": state.config.api.port,
            },
        },
        "timestamp": now,
    })))
}

/// Constant-ok health endpoint for load balancers and probes.
async fn health_check() -> impl IntoResponse {
    ok(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API errors with their machine-readable kind.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn kind(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::InvalidArgument(_) => "invalid_argument",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal(_) => "internal",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = match &self {
            ApiError::NotFound(m)
            | ApiError::InvalidArgument(m)
            | ApiError::Unavailable(m)
            | ApiError::Internal(m) => m.clone(),
        };

        let body = Json(serde_json::json!({
            "success": false,
            "error": {
                "kind": self.kind(),
                "message": message,
            },
        }));

        (self.status_code(), body).into_response()
    }
}
