use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::Role;

/// Permission identifier (`area.action`).
///
/// The wildcard `"*"` grants everything within the active tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(Cow<'static, str>);

impl Permission {
    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_wildcard(&self) -> bool {
        self.as_str() == "*"
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

pub static WILDCARD: Permission = Permission::from_static("*");
pub static PIPELINE_RUN: Permission = Permission::from_static("pipeline.run");
pub static RULES_DETECT: Permission = Permission::from_static("rules.detect");
pub static OUTCOMES_EVALUATE: Permission = Permission::from_static("outcomes.evaluate");
pub static OUTCOMES_READ: Permission = Permission::from_static("outcomes.read");
pub static JOBS_READ: Permission = Permission::from_static("jobs.read");
pub static ALERTS_READ: Permission = Permission::from_static("alerts.read");
pub static ALERTS_WRITE: Permission = Permission::from_static("alerts.write");
pub static CARDS_READ: Permission = Permission::from_static("cards.read");
pub static CARDS_WRITE: Permission = Permission::from_static("cards.write");

fn read_only() -> Vec<Permission> {
    vec![
        OUTCOMES_READ.clone(),
        JOBS_READ.clone(),
        ALERTS_READ.clone(),
        CARDS_READ.clone(),
    ]
}

/// Static role → permission policy. Unknown roles grant nothing.
pub fn permissions_for_roles(roles: &[Role]) -> Vec<Permission> {
    if roles.iter().any(|r| r.is(Role::ADMIN)) {
        return vec![WILDCARD.clone()];
    }

    let mut out = Vec::new();
    for role in roles {
        let granted = match role.as_str() {
            Role::OPERATOR => {
                let mut p = read_only();
                p.extend([
                    PIPELINE_RUN.clone(),
                    RULES_DETECT.clone(),
                    OUTCOMES_EVALUATE.clone(),
                    ALERTS_WRITE.clone(),
                    CARDS_WRITE.clone(),
                ]);
                p
            }
            Role::SCHEDULER => vec![
                PIPELINE_RUN.clone(),
                RULES_DETECT.clone(),
                OUTCOMES_EVALUATE.clone(),
                CARDS_WRITE.clone(),
                JOBS_READ.clone(),
            ],
            Role::VIEWER => read_only(),
            _ => Vec::new(),
        };
        for p in granted {
            if !out.contains(&p) {
                out.push(p);
            }
        }
    }
    out
}
