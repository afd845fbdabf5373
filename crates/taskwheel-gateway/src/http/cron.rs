//! GET /api/cron/preview — upcoming fire times for an expression, used by
//! the task editor.

use axum::extract::Query;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use taskwheel_core::time;
use taskwheel_cron::CronExpr;

use crate::http::ApiError;

const MAX_PREVIEW: usize = 50;

#[derive(Debug, Deserialize)]
pub struct PreviewQuery {
    pub expr: String,
    #[serde(default = "default_count")]
    pub count: usize,
}

fn default_count() -> usize {
    5
}

pub async fn preview(Query(query): Query<PreviewQuery>) -> Result<Json<Value>, ApiError> {
    let cron: CronExpr = query
        .expr
        .parse()
        .map_err(|e| ApiError::bad_request(format!("invalid cron expression: {e}")))?;
    let times: Vec<String> = cron
        .next_times(time::now(), query.count.clamp(1, MAX_PREVIEW))
        .into_iter()
        .map(time::format_ts)
        .collect();
    Ok(Json(json!({ "data": times })))
}
