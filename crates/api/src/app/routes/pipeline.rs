use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use vantage_infra::pipeline::PipelineOutcome;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::RequestContext;

/// Run the pipeline for the body's tenant.
///
/// A run already holding the lock for the same tenant and end date answers
/// 409 with the holder's job id instead of starting a second run.
pub async fn run_pipeline(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    body: Result<Json<dto::RunPipelineRequest>, JsonRejection>,
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

    match services.pipeline.run(body.into_pipeline_request()).await {
        Ok(PipelineOutcome::Completed(report)) => (StatusCode::OK, Json(report)).into_response(),
        Ok(PipelineOutcome::AlreadyRunning { job_id, lock_key }) => errors::already_running_response(
            job_id,
            &lock_key,
            "a pipeline run for this tenant and date is already in progress",
        ),
        Ok(PipelineOutcome::LockFailed { lock_key, reason }) => errors::lock_failed_response(&lock_key, reason),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
