//! HTTP API handlers: the control facade as JSON.
//!
//! Facade calls read files and send datagrams synchronously, so each one
//! runs on the blocking pool.

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use trove_services::{Control, ControlError};

#[derive(Clone)]
pub struct ApiState {
    pub control: Arc<dyn Control>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn error_response(e: ControlError) -> (StatusCode, String) {
    let status = if e.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, e.to_string())
}

async fn run_blocking<T, F>(f: F) -> Result<T, (StatusCode, String)>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ControlError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(error_response)
}

// ── Requests / responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct BackupRequest {
    pub path: PathBuf,
    pub replication: u8,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReclaimRequest {
    pub max_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FileResponse {
    pub file_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReclaimResponse {
    pub evicted: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateResponse {
    pub state: String,
}

// ── /backup /restore /delete ─────────────────────────────────────────────────

pub async fn handle_backup(
    State(state): State<ApiState>,
    Json(req): Json<BackupRequest>,
) -> ApiResult<FileResponse> {
    tracing::info!(path = %req.path.display(), replication = req.replication, "backup requested");
    let control = state.control.clone();
    let file_id = run_blocking(move || control.backup(&req.path, req.replication)).await?;
    Ok(Json(FileResponse {
        file_id: file_id.to_string(),
    }))
}

pub async fn handle_restore(
    State(state): State<ApiState>,
    Json(req): Json<PathRequest>,
) -> ApiResult<FileResponse> {
    tracing::info!(path = %req.path.display(), "restore requested");
    let control = state.control.clone();
    let file_id = run_blocking(move || control.restore(&req.path)).await?;
    Ok(Json(FileResponse {
        file_id: file_id.to_string(),
    }))
}

pub async fn handle_delete(
    State(state): State<ApiState>,
    Json(req): Json<PathRequest>,
) -> ApiResult<FileResponse> {
    tracing::info!(path = %req.path.display(), "delete requested");
    let control = state.control.clone();
    let file_id = run_blocking(move || control.delete(&req.path)).await?;
    Ok(Json(FileResponse {
        file_id: file_id.to_string(),
    }))
}

// ── /reclaim ─────────────────────────────────────────────────────────────────

pub async fn handle_reclaim(
    State(state): State<ApiState>,
    Json(req): Json<ReclaimRequest>,
) -> ApiResult<ReclaimResponse> {
    tracing::info!(max_bytes = req.max_bytes, "reclaim requested");
    let control = state.control.clone();
    let evicted = run_blocking(move || control.reclaim(req.max_bytes)).await?;
    Ok(Json(ReclaimResponse { evicted }))
}

// ── /state ───────────────────────────────────────────────────────────────────

pub async fn handle_state(State(state): State<ApiState>) -> Json<StateResponse> {
    Json(StateResponse {
        state: state.control.state(),
    })
}
