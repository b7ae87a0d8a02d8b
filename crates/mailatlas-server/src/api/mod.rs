//! HTTP API for the dashboard. The handlers are a thin read/submit layer:
//! job state transitions happen in the supervisor, never here.

pub mod jobs;
pub mod tree;

use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .nest("/pipeline", jobs::pipeline_router())
        .nest("/jobs", jobs::jobs_router())
        .nest("/tree", tree::router())
}
