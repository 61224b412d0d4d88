use axum::{
    routing::{get, post},
    Router,
};

pub mod alerts;
pub mod cards;
pub mod jobs;
pub mod outcomes;
pub mod pipeline;
pub mod system;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/pipeline/run", post(pipeline::run_pipeline))
        .route("/rules/detect", post(alerts::detect))
        .route("/outcomes/evaluate", post(outcomes::evaluate))
        .route("/outcomes/stats", get(outcomes::stats))
        .route("/jobs", get(jobs::list_jobs))
        .nest("/alerts", alerts::router())
        .nest("/cards", cards::router())
}
