//! GET /api/health — liveness probe.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use taskwheel_core::time;

use crate::app::AppState;
use crate::http::ApiError;

pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let task_count = state.store.count_tasks()?;
    Ok(Json(json!({
        "data": {
            "time": time::now_ts(),
            "task_count": task_count,
        }
    })))
}
