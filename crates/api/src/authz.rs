//! API-side authorization guard.
//!
//! Checks run in the handler before any service call, so the services stay
//! auth-agnostic. Two questions per request: does the token grant the
//! permission, and may it act on the tenant the request names?

use vantage_auth::{authorize, authorize_tenant_access, AuthzError, CommandAuthorization, Permission};
use vantage_core::TenantId;

use crate::context::RequestContext;

/// Check every permission a request body declares.
pub fn authorize_command<C: CommandAuthorization>(ctx: &RequestContext, command: &C) -> Result<(), AuthzError> {
    let principal = ctx.principal();
    for perm in command.required_permissions() {
        authorize(&principal, perm)?;
    }
    Ok(())
}

pub fn authorize_permission(ctx: &RequestContext, permission: &Permission) -> Result<(), AuthzError> {
    authorize(&ctx.principal(), permission)
}

/// A body `tenant_id` must be the token tenant unless the caller is the scheduler.
pub fn authorize_target_tenant(ctx: &RequestContext, target: TenantId) -> Result<(), AuthzError> {
    authorize_tenant_access(&ctx.principal(), target)
}
