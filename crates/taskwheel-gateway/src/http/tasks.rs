//! Task CRUD plus the manual run and toggle actions.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use taskwheel_engine::{AccountDirectory, FireOutcome, FireReason};
use taskwheel_store::{Task, TaskDraft, TaskPatch, TaskResult};

use crate::app::AppState;
use crate::http::ApiError;

/// A task with its most recent result embedded, as the list/detail endpoints
/// return it.
#[derive(Serialize)]
struct TaskView {
    #[serde(flatten)]
    task: Task,
    latest_result: Option<TaskResult>,
}

fn with_latest(state: &AppState, task: Task) -> Result<TaskView, ApiError> {
    let latest_result = state.store.latest_result(task.id)?;
    Ok(TaskView {
        task,
        latest_result,
    })
}

/// Reject accounts outside the allowed groups before anything is persisted.
/// The runner re-checks at execution time; this is the write-time gate.
fn check_account(state: &AppState, account: &str) -> Result<(), ApiError> {
    if AccountDirectory::posix_supported() && !state.accounts.is_allowed(account) {
        return Err(ApiError::bad_request(format!(
            "account '{account}' must belong to group 0/1000/1001"
        )));
    }
    Ok(())
}

/// GET /api/tasks
pub async fn list_tasks(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let mut views = Vec::new();
    for task in state.store.list_tasks()? {
        views.push(with_latest(&state, task)?);
    }
    Ok(Json(json!({ "data": views })))
}

/// POST /api/tasks
pub async fn create_task(
    State(state): State<Arc<AppState>>,
    Json(mut draft): Json<TaskDraft>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if draft.account.trim().is_empty() {
        draft.account = AccountDirectory::default_account();
    }
    check_account(&state, draft.account.trim())?;
    let task = state.store.insert_task(draft)?;
    Ok((StatusCode::CREATED, Json(json!({ "data": task }))))
}

/// GET /api/tasks/:id
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .store
        .get_task(id)?
        .ok_or_else(|| ApiError::not_found("task"))?;
    let view = with_latest(&state, task)?;
    Ok(Json(json!({ "data": view })))
}

/// PUT /api/tasks/:id
pub async fn update_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<Value>, ApiError> {
    if let Some(account) = patch.account.as_deref() {
        check_account(&state, account.trim())?;
    }
    let task = state.store.update_task(id, patch)?;
    Ok(Json(json!({ "data": task })))
}

/// DELETE /api/tasks/:id
pub async fn delete_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete_task(id)?;
    Ok(Json(json!({ "data": { "deleted": true } })))
}

/// POST /api/tasks/:id/run — enqueue a manual fire.
pub async fn run_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    match state.runner.fire(id, FireReason::Manual)? {
        FireOutcome::Queued { result_id } => {
            Ok(Json(json!({ "data": { "queued": true, "result_id": result_id } })))
        }
        FireOutcome::AlreadyRunning => Err(ApiError::new(
            StatusCode::CONFLICT,
            "task is already running",
        )),
        FireOutcome::Blocked { unmet } => Err(ApiError::bad_request(format!(
            "prerequisite tasks have not succeeded yet: {unmet:?}"
        ))),
        FireOutcome::NotFound => Err(ApiError::not_found("task")),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ToggleBody {
    pub is_active: Option<bool>,
}

/// POST /api/tasks/:id/toggle — flip or set `is_active`.
pub async fn toggle_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Option<Json<ToggleBody>>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .store
        .get_task(id)?
        .ok_or_else(|| ApiError::not_found("task"))?;
    let target = body
        .and_then(|Json(b)| b.is_active)
        .unwrap_or(!task.is_active);
    state.store.set_active(id, target)?;
    let task = state
        .store
        .get_task(id)?
        .ok_or_else(|| ApiError::not_found("task"))?;
    Ok(Json(json!({ "data": task })))
}
