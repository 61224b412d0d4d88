use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

use vantage_auth::AuthzError;
use vantage_core::DomainError;
use vantage_infra::cards::{CardServiceError, CardStoreError};
use vantage_infra::detection::{RuleEngineError, RuleStoreError};
use vantage_infra::jobs::{ExclusiveRun, JobRunId, JobStoreError, LockKey, RegistryError};
use vantage_infra::outcomes::OutcomeError;
use vantage_infra::pipeline::PipelineError;

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn rejection_to_response(rejection: JsonRejection) -> Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text())
}

pub fn authz_error_to_response(err: AuthzError) -> Response {
    json_error(StatusCode::FORBIDDEN, "forbidden", err.to_string())
}

pub fn domain_error_to_response(err: DomainError) -> Response {
    let status = match err {
        DomainError::Validation(_) | DomainError::InvalidId(_) => StatusCode::BAD_REQUEST,
        DomainError::InvariantViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        DomainError::InvalidTransition(_) | DomainError::Conflict(_) => StatusCode::CONFLICT,
        DomainError::NotFound => StatusCode::NOT_FOUND,
        DomainError::Unauthorized => StatusCode::FORBIDDEN,
    };
    json_error(status, err.code(), err.to_string())
}

fn storage_error(message: impl Into<String>) -> Response {
    let message = message.into();
    tracing::error!(error = %message, "storage failure");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", message)
}

/// 409 for a job whose lock is held by a running invocation.
pub fn already_running_response(job_id: JobRunId, lock_key: &LockKey, message: &str) -> Response {
    (
        StatusCode::CONFLICT,
        axum::Json(json!({
            "error": "already_running",
            "message": message,
            "job_id": job_id,
            "lock_key": lock_key.as_str(),
        })),
    )
        .into_response()
}

/// 409 for a lost lock insert race.
pub fn lock_failed_response(lock_key: &LockKey, reason: String) -> Response {
    (
        StatusCode::CONFLICT,
        axum::Json(json!({
            "error": "lock_failed",
            "message": reason,
            "lock_key": lock_key.as_str(),
        })),
    )
        .into_response()
}

/// 200 with the run's value, or 409 when another run holds the lock.
pub fn exclusive_run_to_response<T: Serialize>(run: ExclusiveRun<T>, what: &str) -> Response {
    match run {
        ExclusiveRun::Ran { value, .. } => (StatusCode::OK, axum::Json(value)).into_response(),
        ExclusiveRun::AlreadyRunning { job_id, lock_key } => {
            already_running_response(job_id, &lock_key, &format!("{what} for this tenant is already in progress"))
        }
        ExclusiveRun::LockFailed { lock_key, reason } => lock_failed_response(&lock_key, reason),
    }
}

pub fn registry_error_to_response(err: RegistryError) -> Response {
    match err {
        RegistryError::Invalid(e) => domain_error_to_response(e),
        RegistryError::Store(e @ JobStoreError::NotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", e.to_string())
        }
        RegistryError::Store(e @ (JobStoreError::AlreadyTerminal { .. } | JobStoreError::LockHeld(_))) => {
            json_error(StatusCode::CONFLICT, "conflict", e.to_string())
        }
        RegistryError::Store(JobStoreError::Storage(msg)) => storage_error(msg),
    }
}

pub fn pipeline_error_to_response(err: PipelineError) -> Response {
    match err {
        PipelineError::Validation(e) => domain_error_to_response(e),
        PipelineError::Aborted { job_id, message } => {
            tracing::error!(job_id = %job_id, error = %message, "pipeline aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                axum::Json(json!({
                    "error": "pipeline_aborted",
                    "message": message,
                    "job_id": job_id,
                })),
            )
                .into_response()
        }
        PipelineError::Registry(e) => registry_error_to_response(e),
    }
}

pub fn rule_engine_error_to_response(err: RuleEngineError) -> Response {
    match err {
        RuleEngineError::Domain(e) => domain_error_to_response(e),
        RuleEngineError::Store(e @ RuleStoreError::AlertNotFound(_)) => {
            json_error(StatusCode::NOT_FOUND, "not_found", e.to_string())
        }
        RuleEngineError::Store(RuleStoreError::Storage(msg)) => storage_error(msg),
        RuleEngineError::Registry(e) => registry_error_to_response(e),
    }
}

pub fn card_store_error_to_response(err: CardStoreError) -> Response {
    let message = err.to_string();
    match err {
        CardStoreError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        CardStoreError::DuplicateTrigger(_) => json_error(StatusCode::CONFLICT, "duplicate_trigger", message),
        CardStoreError::Conflict(_) => json_error(StatusCode::CONFLICT, "conflict", message),
        CardStoreError::Storage(_) => storage_error(message),
    }
}

pub fn card_error_to_response(err: CardServiceError) -> Response {
    match err {
        CardServiceError::Domain(e) => domain_error_to_response(e),
        CardServiceError::Store(e) => card_store_error_to_response(e),
    }
}

pub fn outcome_error_to_response(err: OutcomeError) -> Response {
    match err {
        OutcomeError::Cards(e) => card_store_error_to_response(e),
        OutcomeError::Ledger(e) => storage_error(e.to_string()),
        OutcomeError::Registry(e) => registry_error_to_response(e),
    }
}
