//! GET /api/accounts — accounts eligible to own tasks.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use taskwheel_engine::AccountDirectory;

use crate::app::AppState;

pub async fn list_accounts(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "data": state.accounts.list_allowed(),
        "meta": {
            "posix_supported": AccountDirectory::posix_supported(),
            "default_account": AccountDirectory::default_account(),
        },
    }))
}
