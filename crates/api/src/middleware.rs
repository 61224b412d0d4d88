use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::debug;

use vantage_auth::JwtValidator;
use vantage_core::Clock;

use crate::app::errors::json_error;
use crate::context::RequestContext;

#[derive(Clone)]
pub struct AuthState {
    pub jwt: Arc<dyn JwtValidator>,
    pub clock: Arc<dyn Clock>,
}

/// Validates the bearer token and attaches tenant and principal context.
/// Anything missing or invalid is a 401 before any handler runs.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let token = extract_bearer(req.headers()).map_err(unauthorized)?;

    let claims = state.jwt.validate(token, state.clock.now()).map_err(|e| {
        debug!(error = %e, "rejected bearer token");
        unauthorized("invalid or expired token")
    })?;

    let ctx = RequestContext::from_claims(claims);
    debug!(principal = %ctx.principal_id(), tenant = %ctx.tenant_id(), "request authenticated");
    req.extensions_mut().insert(ctx);

    Ok(next.run(req).await)
}

fn unauthorized(reason: &'static str) -> Response {
    json_error(StatusCode::UNAUTHORIZED, "unauthorized", reason)
}

fn extract_bearer(headers: &HeaderMap) -> Result<&str, &'static str> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .ok_or("missing authorization header")?;

    let header = header.to_str().map_err(|_| "malformed authorization header")?;

    let token = header
        .strip_prefix("Bearer ")
        .ok_or("expected a bearer token")?
        .trim();
    if token.is_empty() {
        return Err("empty bearer token");
    }

    Ok(token)
}
