use chrono::NaiveDate;
use serde::Deserialize;

use vantage_auth::permissions::{CARDS_WRITE, OUTCOMES_EVALUATE, PIPELINE_RUN, RULES_DETECT};
use vantage_auth::{CommandAuthorization, Permission};
use vantage_core::TenantId;
use vantage_infra::detection::AlertStatus;
use vantage_infra::jobs::JobRunStatus;
use vantage_infra::pipeline::PipelineRequest;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct RunPipelineRequest {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub link_customers: bool,
    #[serde(default)]
    pub skip_cdp: bool,
    #[serde(default)]
    pub skip_alerts: bool,
}

impl RunPipelineRequest {
    pub fn into_pipeline_request(self) -> PipelineRequest {
        PipelineRequest {
            tenant_id: self.tenant_id,
            start_date: self.start_date,
            end_date: self.end_date,
            link_customers: self.link_customers,
            skip_cdp: self.skip_cdp,
            skip_alerts: self.skip_alerts,
        }
    }
}

impl CommandAuthorization for RunPipelineRequest {
    fn required_permissions(&self) -> &[Permission] {
        std::slice::from_ref(&PIPELINE_RUN)
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectRequest {
    pub tenant_id: TenantId,
    /// Alert period; today when omitted.
    #[serde(default)]
    pub period: Option<NaiveDate>,
}

impl CommandAuthorization for DetectRequest {
    fn required_permissions(&self) -> &[Permission] {
        std::slice::from_ref(&RULES_DETECT)
    }
}

#[derive(Debug, Deserialize)]
pub struct EvaluateOutcomesRequest {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub evaluation_window_days: Option<u32>,
}

impl CommandAuthorization for EvaluateOutcomesRequest {
    fn required_permissions(&self) -> &[Permission] {
        std::slice::from_ref(&OUTCOMES_EVALUATE)
    }
}

#[derive(Debug, Deserialize)]
pub struct DecideCardRequest {
    pub action_type: String,
    #[serde(default)]
    pub comment: Option<String>,
}

impl CommandAuthorization for DecideCardRequest {
    fn required_permissions(&self) -> &[Permission] {
        std::slice::from_ref(&CARDS_WRITE)
    }
}

#[derive(Debug, Deserialize)]
pub struct DismissCardRequest {
    pub reason_code: String,
    pub comment: String,
}

impl CommandAuthorization for DismissCardRequest {
    fn required_permissions(&self) -> &[Permission] {
        std::slice::from_ref(&CARDS_WRITE)
    }
}

#[derive(Debug, Deserialize)]
pub struct SnoozeCardRequest {
    pub hours: u32,
    pub reason: String,
}

impl CommandAuthorization for SnoozeCardRequest {
    fn required_permissions(&self) -> &[Permission] {
        std::slice::from_ref(&CARDS_WRITE)
    }
}

// -------------------------
// Query strings
// -------------------------

#[derive(Debug, Default, Deserialize)]
pub struct AlertQuery {
    #[serde(default)]
    pub status: Option<AlertStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobQuery {
    #[serde(default)]
    pub status: Option<JobRunStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Explicit target tenant for sweeps; the token tenant when absent.
#[derive(Debug, Default, Deserialize)]
pub struct TenantQuery {
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
}
