use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use vantage_auth::permissions::OUTCOMES_READ;
use vantage_infra::outcomes::DEFAULT_EVALUATION_WINDOW_DAYS;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::RequestContext;

/// Score decisions past their window. One evaluation per tenant and day runs
/// at a time; an overlapping call answers 409.
pub async fn evaluate(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    body: Result<Json<dto::EvaluateOutcomesRequest>, JsonRejection>,
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

    let window_days = body.evaluation_window_days.unwrap_or(DEFAULT_EVALUATION_WINDOW_DAYS);
    match services
        .evaluator
        .evaluate_exclusive(&services.registry, body.tenant_id, window_days)
        .await
    {
        Ok(run) => errors::exclusive_run_to_response(run, "an outcome evaluation"),
        Err(e) => errors::outcome_error_to_response(e),
    }
}

pub async fn stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    if let Err(e) = crate::authz::authorize_permission(&ctx, &OUTCOMES_READ) {
        return errors::authz_error_to_response(e);
    }

    match services.evaluator.stats(ctx.tenant_id()).await {
        Ok(stats) => (StatusCode::OK, Json(stats)).into_response(),
        Err(e) => errors::outcome_error_to_response(e),
    }
}
