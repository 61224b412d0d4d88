use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Extension, Path, Query,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

use vantage_auth::permissions::{ALERTS_READ, ALERTS_WRITE};
use vantage_core::AlertId;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_alerts))
        .route("/:id/acknowledge", post(acknowledge_alert))
        .route("/:id/resolve", post(resolve_alert))
}

/// Standalone detection pass, outside the pipeline, under its own job lock
/// for the tenant and period.
pub async fn detect(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    body: Result<Json<dto::DetectRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    if let Err(e) = crate::authz::authorize_command(&ctx, &body) {
        return errors::authz_error_to_response(e);
    }
    if let Err(e) = crate::authz::authorize_target_tenant(&ctx, body.tenant_id) {
        return errors::authz_error_to_response(e);
    }

    let period = body.period.unwrap_or_else(|| services.clock.today());
    match services
        .engine
        .detect_exclusive(&services.registry, body.tenant_id, period)
        .await
    {
        Ok(run) => errors::exclusive_run_to_response(run, "a detection pass"),
        Err(e) => errors::rule_engine_error_to_response(e),
    }
}

pub async fn list_alerts(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<dto::AlertQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_query", rejection.body_text());
        }
    };

    if let Err(e) = crate::authz::authorize_permission(&ctx, &ALERTS_READ) {
        return errors::authz_error_to_response(e);
    }

    match services.engine.list_alerts(ctx.tenant_id(), query.status).await {
        Ok(alerts) => (StatusCode::OK, Json(alerts)).into_response(),
        Err(e) => errors::rule_engine_error_to_response(e),
    }
}

pub async fn acknowledge_alert(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Response {
    let alert_id: AlertId = match id.parse() {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };

    if let Err(e) = crate::authz::authorize_permission(&ctx, &ALERTS_WRITE) {
        return errors::authz_error_to_response(e);
    }

    match services.engine.acknowledge(ctx.tenant_id(), alert_id).await {
        Ok(alert) => (StatusCode::OK, Json(alert)).into_response(),
        Err(e) => errors::rule_engine_error_to_response(e),
    }
}

pub async fn resolve_alert(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Response {
    let alert_id: AlertId = match id.parse() {
        Ok(v) => v,
        Err(e) => return errors::domain_error_to_response(e),
    };

    if let Err(e) = crate::authz::authorize_permission(&ctx, &ALERTS_WRITE) {
        return errors::authz_error_to_response(e);
    }

    match services.engine.resolve(ctx.tenant_id(), alert_id).await {
        Ok(alert) => (StatusCode::OK, Json(alert)).into_response(),
        Err(e) => errors::rule_engine_error_to_response(e),
    }
}
