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
use serde_json::json;

use vantage_auth::permissions::{CARDS_READ, CARDS_WRITE};
use vantage_core::CardId;

use crate::app::{dto, errors};
use crate::app::services::AppServices;
use crate::context::RequestContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(actionable_queue))
        .route("/resume-due", post(resume_due))
        .route("/:id/start", post(start_card))
        .route("/:id/decide", post(decide_card))
        .route("/:id/dismiss", post(dismiss_card))
        .route("/:id/snooze", post(snooze_card))
}

fn parse_card_id(id: &str) -> Result<CardId, Response> {
    id.parse().map_err(errors::domain_error_to_response)
}

/// OPEN and IN_PROGRESS cards, most urgent first.
pub async fn actionable_queue(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
) -> Response {
    if let Err(e) = crate::authz::authorize_permission(&ctx, &CARDS_READ) {
        return errors::authz_error_to_response(e);
    }

    match services.cards.actionable_queue(ctx.tenant_id()).await {
        Ok(cards) => (StatusCode::OK, Json(cards)).into_response(),
        Err(e) => errors::card_error_to_response(e),
    }
}

pub async fn start_card(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
) -> Response {
    let card_id = match parse_card_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if let Err(e) = crate::authz::authorize_permission(&ctx, &CARDS_WRITE) {
        return errors::authz_error_to_response(e);
    }

    match services.cards.start(ctx.tenant_id(), card_id).await {
        Ok(card) => (StatusCode::OK, Json(card)).into_response(),
        Err(e) => errors::card_error_to_response(e),
    }
}

pub async fn decide_card(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Result<Json<dto::DecideCardRequest>, JsonRejection>,
) -> Response {
    let card_id = match parse_card_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    if let Err(e) = crate::authz::authorize_command(&ctx, &body) {
        return errors::authz_error_to_response(e);
    }

    match services
        .cards
        .decide(ctx.tenant_id(), card_id, body.action_type, body.comment)
        .await
    {
        Ok(card) => (StatusCode::OK, Json(card)).into_response(),
        Err(e) => errors::card_error_to_response(e),
    }
}

pub async fn dismiss_card(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Result<Json<dto::DismissCardRequest>, JsonRejection>,
) -> Response {
    let card_id = match parse_card_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    if let Err(e) = crate::authz::authorize_command(&ctx, &body) {
        return errors::authz_error_to_response(e);
    }

    match services
        .cards
        .dismiss(ctx.tenant_id(), card_id, body.reason_code, body.comment)
        .await
    {
        Ok(card) => (StatusCode::OK, Json(card)).into_response(),
        Err(e) => errors::card_error_to_response(e),
    }
}

pub async fn snooze_card(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    Path(id): Path<String>,
    body: Result<Json<dto::SnoozeCardRequest>, JsonRejection>,
) -> Response {
    let card_id = match parse_card_id(&id) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    if let Err(e) = crate::authz::authorize_command(&ctx, &body) {
        return errors::authz_error_to_response(e);
    }

    match services
        .cards
        .snooze(ctx.tenant_id(), card_id, body.hours, body.reason)
        .await
    {
        Ok(card) => (StatusCode::OK, Json(card)).into_response(),
        Err(e) => errors::card_error_to_response(e),
    }
}

/// Reopen snoozed cards whose resume time has passed. The scheduler may
/// name another tenant with `?tenant_id=`.
pub async fn resume_due(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    query: Result<Query<dto::TenantQuery>, QueryRejection>,
) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "invalid_query", rejection.body_text());
        }
    };
    let target = query.tenant_id.unwrap_or(ctx.tenant_id());

    if let Err(e) = crate::authz::authorize_permission(&ctx, &CARDS_WRITE) {
        return errors::authz_error_to_response(e);
    }
    if let Err(e) = crate::authz::authorize_target_tenant(&ctx, target) {
        return errors::authz_error_to_response(e);
    }

    match services.cards.resume_due(target).await {
        Ok(resumed) => (StatusCode::OK, Json(json!({ "tenant_id": target, "resumed": resumed }))).into_response(),
        Err(e) => errors::card_error_to_response(e),
    }
}
