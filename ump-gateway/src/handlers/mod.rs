use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::jobs::JobManager;
use crate::processes::ProcessManager;

pub mod jobs;
pub mod processes;

#[derive(Clone)]
pub struct AppState {
    pub processes: Arc<ProcessManager>,
    pub jobs: Arc<JobManager>,
    /// Public base of the versioned API, no trailing slash.
    pub api_base: String,
}

pub async fn index() -> &'static str {
    "urban model platform gateway"
}

pub fn add_routes(router: Router, state: AppState) -> Router {
    let api = Router::new()
        .route("/processes", get(processes::list))
        .route("/processes/:id", get(processes::get))
        .route("/processes/:id/execution", post(processes::execute))
        .route("/jobs", get(jobs::list))
        .route("/jobs/:id", get(jobs::get).delete(jobs::dismiss))
        .route("/jobs/:id/results", get(jobs::results))
        .with_state(state);

    router
        .route("/", get(index))
        .nest("/v1.0", api)
        .layer(TraceLayer::new_for_http())
}
