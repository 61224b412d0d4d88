use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use vantage_core::{AlertId, DomainError, ObjectId, TenantId};
use vantage_rules::{AlertSource, Detection, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }
}

impl core::str::FromStr for AlertStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertStatus::Active),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(DomainError::validation(format!("unknown alert status: {other}"))),
        }
    }
}

/// Materialized alert. Unique per tenant and `dedup_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertInstance {
    pub id: AlertId,
    pub tenant_id: TenantId,
    pub source: AlertSource,
    pub object_id: Option<ObjectId>,
    pub severity: Severity,
    pub status: AlertStatus,
    pub title: String,
    pub message: String,
    pub impact_amount: f64,
    pub suggested_actions: Vec<String>,
    pub deadline_at: DateTime<Utc>,
    pub notification_sent: bool,
    pub detection_period: NaiveDate,
    pub dedup_key: String,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AlertInstance {
    /// New active alert; the deadline is the severity's response window.
    pub fn from_detection(tenant_id: TenantId, detection: Detection, period: NaiveDate, now: DateTime<Utc>) -> Self {
        let dedup_key = detection.dedup_key(period);
        Self {
            id: AlertId::new(),
            tenant_id,
            deadline_at: now + detection.severity.response_window(),
            source: detection.source,
            object_id: detection.object_id,
            severity: detection.severity,
            status: AlertStatus::Active,
            title: detection.title,
            message: detection.message,
            impact_amount: detection.impact_amount,
            suggested_actions: detection.suggested_actions,
            notification_sent: false,
            detection_period: period,
            dedup_key,
            created_at: now,
            acknowledged_at: None,
            resolved_at: None,
        }
    }

    /// The ongoing condition behind this alert, shared by its daily repeats.
    pub fn condition_key(&self) -> String {
        self.source.condition_key(self.object_id)
    }

    pub fn acknowledge(&mut self, at: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status != AlertStatus::Active {
            return Err(DomainError::invalid_transition(format!(
                "alert is {} and cannot be acknowledged",
                self.status.as_str()
            )));
        }
        self.status = AlertStatus::Acknowledged;
        self.acknowledged_at = Some(at);
        Ok(())
    }

    pub fn resolve(&mut self, at: DateTime<Utc>) -> Result<(), DomainError> {
        if self.status == AlertStatus::Resolved {
            return Err(DomainError::invalid_transition("alert is already resolved"));
        }
        self.status = AlertStatus::Resolved;
        self.resolved_at = Some(at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use vantage_core::ThresholdId;

    use super::*;

    fn alert() -> AlertInstance {
        let detection = Detection {
            source: AlertSource::Threshold(ThresholdId::new()),
            object_id: Some(ObjectId::new()),
            severity: Severity::Critical,
            title: "Low stock".into(),
            message: "days_of_stock 3 < 5".into(),
            impact_amount: 120.0,
            suggested_actions: vec!["reorder".into()],
        };
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap();
        AlertInstance::from_detection(TenantId::new(), detection, now.date_naive(), now)
    }

    #[test]
    fn new_alert_is_active_with_severity_deadline() {
        let a = alert();
        assert_eq!(a.status, AlertStatus::Active);
        assert_eq!(a.deadline_at - a.created_at, Duration::hours(24));
        assert!(a.dedup_key.ends_with(":2024-05-01"));
    }

    #[test]
    fn acknowledge_then_resolve() {
        let mut a = alert();
        let at = a.created_at;
        a.acknowledge(at).unwrap();
        assert!(a.acknowledge(at).is_err());
        a.resolve(at).unwrap();
        assert_eq!(a.status, AlertStatus::Resolved);
        assert!(a.resolve(at).is_err());
    }

    #[test]
    fn active_alert_can_resolve_directly() {
        let mut a = alert();
        a.resolve(a.created_at).unwrap();
        assert!(matches!(a.acknowledge(a.created_at), Err(DomainError::InvalidTransition(_))));
    }
}
