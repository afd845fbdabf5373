//! Result history endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;
use crate::http::ApiError;

const MAX_PAGE: u32 = 500;

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    50
}

/// GET /api/tasks/:id/results?limit=N&offset=M — newest first, capped.
pub async fn list_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<ResultsQuery>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_task(id)?.is_none() {
        return Err(ApiError::not_found("task"));
    }
    let results = state
        .store
        .list_results(id, query.limit.min(MAX_PAGE), query.offset)?;
    Ok(Json(json!({ "data": results })))
}

/// DELETE /api/tasks/:id/results/:rid
pub async fn delete_result(
    State(state): State<Arc<AppState>>,
    Path((id, rid)): Path<(i64, i64)>,
) -> Result<Json<Value>, ApiError> {
    state.store.delete_result(id, rid)?;
    Ok(Json(json!({ "data": { "deleted": true } })))
}

/// DELETE /api/tasks/:id/results — clear the task's history.
pub async fn clear_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_task(id)?.is_none() {
        return Err(ApiError::not_found("task"));
    }
    let deleted = state.store.clear_results(id)?;
    Ok(Json(json!({ "data": { "deleted": deleted } })))
}
