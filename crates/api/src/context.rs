use vantage_auth::{JwtClaims, Principal, PrincipalId, Role, TenantMembership};
use vantage_core::TenantId;

/// Caller identity for one request, built by the auth middleware from
/// validated claims. Handlers take the token tenant from here only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    tenant_id: TenantId,
    principal_id: PrincipalId,
    roles: Vec<Role>,
}

impl RequestContext {
    pub fn new(tenant_id: TenantId, principal_id: PrincipalId, roles: Vec<Role>) -> Self {
        Self {
            tenant_id,
            principal_id,
            roles,
        }
    }

    pub fn from_claims(claims: JwtClaims) -> Self {
        Self::new(claims.tenant_id, claims.sub, claims.roles)
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn principal_id(&self) -> PrincipalId {
        self.principal_id
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    /// Policy view of the caller, acting within the token tenant.
    pub fn principal(&self) -> Principal {
        Principal {
            principal_id: self.principal_id,
            active_tenant_id: self.tenant_id,
            membership: TenantMembership::for_roles(self.tenant_id, self.roles.clone()),
        }
    }
}
