use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Extension, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use vantage_auth::permissions::JOBS_READ;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::RequestContext;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

/// Recent job runs, newest first, with per-status counts.
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<dto::JobQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_query", rejection.body_text());
        }
    };

    if let Err(e) = crate::authz::authorize_permission(&ctx, &JOBS_READ) {
        return errors::authz_error_to_response(e);
    }

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let jobs = match services.registry.list_jobs(ctx.tenant_id(), query.status, limit).await {
        Ok(jobs) => jobs,
        Err(e) => return errors::registry_error_to_response(e),
    };
    let stats = match services.registry.stats(ctx.tenant_id()).await {
        Ok(stats) => stats,
        Err(e) => return errors::registry_error_to_response(e),
    };

    (StatusCode::OK, Json(json!({ "jobs": jobs, "stats": stats }))).into_response()
}
