use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role identifier used for RBAC.
///
/// Opaque string on the wire; the well-known names below are the ones the
/// permission policy understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    /// Every permission in the token's tenant.
    pub const ADMIN: &'static str = "admin";
    /// Runs pipelines and works the card queue.
    pub const OPERATOR: &'static str = "operator";
    /// Read-only dashboards.
    pub const VIEWER: &'static str = "viewer";
    /// Cron caller; may target any tenant.
    pub const SCHEDULER: &'static str = "scheduler";

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is(&self, name: &str) -> bool {
        self.as_str() == name
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
