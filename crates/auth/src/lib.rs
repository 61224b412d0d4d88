//! `vantage-auth`: bearer-token claims and tenant-scoped permissions.
//!
//! Decoupled from HTTP and storage: the API layer validates a bearer token
//! here, builds a `Principal`, and asks `authorize` / `authorize_tenant_access`
//! before touching any service.

pub mod authorize;
pub mod claims;
pub mod jwt;
pub mod permissions;
pub mod principal;
pub mod roles;

pub use authorize::{authorize, authorize_tenant_access, AuthzError, CommandAuthorization, Principal};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use jwt::{Hs256JwtValidator, JwtValidator};
pub use permissions::{permissions_for_roles, Permission};
pub use principal::{PrincipalId, TenantMembership};
pub use roles::Role;
