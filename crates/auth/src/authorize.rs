use std::collections::HashSet;

use thiserror::Error;

use vantage_core::TenantId;

use crate::{Permission, PrincipalId, Role, TenantMembership};

/// A fully resolved principal for authorization decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub principal_id: PrincipalId,
    pub active_tenant_id: TenantId,
    pub membership: TenantMembership,
}

impl Principal {
    pub fn has_role(&self, name: &str) -> bool {
        self.membership.roles.iter().any(|r| r.is(name))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("access to tenant {0} denied")]
    TenantAccessDenied(TenantId),

    #[error("forbidden: missing permission '{0}'")]
    Forbidden(String),
}

/// Permissions a request needs before it reaches a service.
pub trait CommandAuthorization {
    fn required_permissions(&self) -> &[Permission];
}

/// Authorize a principal within its active tenant context. Pure policy check.
pub fn authorize(principal: &Principal, required: &Permission) -> Result<(), AuthzError> {
    if principal.active_tenant_id != principal.membership.tenant_id {
        return Err(AuthzError::TenantMismatch);
    }

    let perms: HashSet<&str> = principal
        .membership
        .permissions
        .iter()
        .map(|p| p.as_str())
        .collect();

    if perms.contains("*") || perms.contains(required.as_str()) {
        Ok(())
    } else {
        Err(AuthzError::Forbidden(required.as_str().to_string()))
    }
}

/// May this principal act on `target`?
///
/// Own tenant always; any tenant only with the `scheduler` role.
pub fn authorize_tenant_access(principal: &Principal, target: TenantId) -> Result<(), AuthzError> {
    if target == principal.active_tenant_id || principal.has_role(Role::SCHEDULER) {
        Ok(())
    } else {
        Err(AuthzError::TenantAccessDenied(target))
    }
}
