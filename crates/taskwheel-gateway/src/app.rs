use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

use taskwheel_core::config::{normalize_base_path, TaskwheelConfig};
use taskwheel_engine::{AccountDirectory, RunnerHandle};
use taskwheel_store::TaskStore;

use crate::auth::AuthConfig;

/// Central shared state — passed as `Arc<AppState>` to all axum handlers.
pub struct AppState {
    pub config: TaskwheelConfig,
    pub store: Arc<TaskStore>,
    pub runner: RunnerHandle,
    pub accounts: AccountDirectory,
    pub auth: Option<AuthConfig>,
}

/// Assemble the full router, mounted under the configured base path.
pub fn build_router(state: Arc<AppState>) -> Router {
    let base_path = normalize_base_path(&state.config.server.base_path);

    let router = Router::new()
        .route("/", get(crate::http::ui::ui_handler))
        .route("/api/health", get(crate::http::health::health))
        .route("/api/accounts", get(crate::http::accounts::list_accounts))
        .route("/api/cron/preview", get(crate::http::cron::preview))
        .route(
            "/api/tasks",
            get(crate::http::tasks::list_tasks).post(crate::http::tasks::create_task),
        )
        .route("/api/tasks/batch", post(crate::http::batch::batch_tasks))
        .route(
            "/api/tasks/:id",
            get(crate::http::tasks::get_task)
                .put(crate::http::tasks::update_task)
                .delete(crate::http::tasks::delete_task),
        )
        .route("/api/tasks/:id/run", post(crate::http::tasks::run_task))
        .route("/api/tasks/:id/toggle", post(crate::http::tasks::toggle_task))
        .route(
            "/api/tasks/:id/results",
            get(crate::http::results::list_results).delete(crate::http::results::clear_results),
        )
        .route(
            "/api/tasks/:id/results/:rid",
            delete(crate::http::results::delete_result),
        )
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            crate::auth::require_auth,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    if base_path == "/" {
        router
    } else {
        Router::new().nest(&base_path, router)
    }
}
