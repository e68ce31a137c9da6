//! Worker routes: registration, heartbeats, health, executors and kill.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use super::AppState;
use super::resolve::{resolve_build, resolve_executor, resolve_repo};
use crate::cancel::KillOutcome;
use crate::error::Result;
use crate::fleet::{Executor, HeartbeatReport, Worker, WorkerHealth, WorkerRegistration};
use crate::types::{BuildRef, WorkerName};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatBody {
    /// Builds the worker is currently running.
    #[serde(default)]
    pub executors: Vec<BuildRef>,
}

pub async fn register(
    State(state): State<AppState>,
    Json(registration): Json<WorkerRegistration>,
) -> Result<(StatusCode, Json<Worker>)> {
    let worker = state.fleet.register(registration).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

pub async fn list(State(state): State<AppState>) -> Json<serde_json::Value> {
    let workers = state.fleet.workers().await;
    Json(json!({
        "workers": workers,
        "count": workers.len(),
    }))
}

pub async fn get_worker(
    State(state): State<AppState>,
    Path(worker): Path<WorkerName>,
) -> Result<Json<Worker>> {
    Ok(Json(state.fleet.worker(&worker).await?))
}

pub async fn health(
    State(state): State<AppState>,
    Path(worker): Path<WorkerName>,
) -> Result<Json<WorkerHealth>> {
    Ok(Json(state.fleet.health(&worker).await?))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(worker): Path<WorkerName>,
    Json(body): Json<HeartbeatBody>,
) -> Result<Json<HeartbeatReport>> {
    Ok(Json(state.fleet.heartbeat(&worker, body.executors).await?))
}

pub async fn list_executors(
    State(state): State<AppState>,
    Path(worker): Path<WorkerName>,
) -> Result<Json<serde_json::Value>> {
    let executors = state.fleet.executors(&worker).await?;
    Ok(Json(json!({
        "executors": executors,
        "count": executors.len(),
    })))
}

pub async fn assign(
    State(state): State<AppState>,
    Path(worker): Path<WorkerName>,
    Json(build): Json<BuildRef>,
) -> Result<(StatusCode, Json<Executor>)> {
    resolve_repo(build.org.as_str(), build.repo.as_str())?;
    let executor = state.fleet.assign(&worker, build).await?;
    Ok((StatusCode::CREATED, Json(executor)))
}

/// `DELETE /workers/{worker}/{org}/{repo}/{build}`
pub async fn kill(
    State(state): State<AppState>,
    Path((worker, org, repo, number)): Path<(WorkerName, String, String, String)>,
) -> Result<Response> {
    let (org, repo) = resolve_repo(&org, &repo)?;
    let build = resolve_build(org, repo, &number)?;
    let executor = resolve_executor(&state.fleet, &worker, &build).await?;

    info!(worker = %worker, build = %build, "Kill requested");
    let outcome = state.dispatcher.kill_executor(&build, executor.id).await?;

    let response = match outcome {
        KillOutcome::Cancelled(executor) => (
            StatusCode::OK,
            Json(json!({
                "status": "cancelled",
                "executor": executor,
            })),
        ),
        KillOutcome::CancelRequested(executor) => (
            StatusCode::OK,
            Json(json!({
                "status": "cancel_requested",
                "executor": executor,
            })),
        ),
        KillOutcome::AlreadyTerminal(executor) => (
            StatusCode::CONFLICT,
            Json(json!({
                "status": "already_terminal",
                "note": format!("build {} already {}", executor.build, executor.state),
                "executor": executor,
            })),
        ),
    };
    Ok(response.into_response())
}
