//! POST /api/tasks/batch — bulk delete/enable/disable/run.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use taskwheel_engine::{apply_batch, BatchRequest};

use crate::app::AppState;
use crate::http::ApiError;

pub async fn batch_tasks(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BatchRequest>,
) -> Result<Json<Value>, ApiError> {
    let action = request.action;
    let outcome = apply_batch(&state.store, &state.runner, request)?;
    Ok(Json(json!({ "action": action, "result": outcome })))
}
