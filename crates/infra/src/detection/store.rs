//! Rule-engine persistence: monitored objects, rule definitions and alerts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use vantage_core::{AlertId, ObjectId, RuleId, TenantId};
use vantage_rules::{DerivedMetrics, IntelligentRule, MonitoredObject, ThresholdConfig};

use super::alert::{AlertInstance, AlertStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuleStoreError {
    #[error("alert not found: {0}")]
    AlertNotFound(AlertId),

    #[error("storage error: {0}")]
    Storage(String),
}

/// A rule row as loaded. Undecodable rows surface as `Invalid` so one bad
/// definition never hides the others.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRule {
    Valid(IntelligentRule),
    Invalid { id: RuleId, reason: String },
}

impl StoredRule {
    pub fn decode(id: RuleId, definition: serde_json::Value) -> Self {
        match serde_json::from_value::<IntelligentRule>(definition) {
            Ok(rule) if rule.id == id => StoredRule::Valid(rule),
            Ok(rule) => StoredRule::Invalid {
                id,
                reason: format!("definition carries id {}", rule.id),
            },
            Err(e) => StoredRule::Invalid {
                id,
                reason: format!("invalid rule definition: {e}"),
            },
        }
    }
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn objects(&self, tenant_id: TenantId) -> Result<Vec<MonitoredObject>, RuleStoreError>;

    async fn save_derived(
        &self,
        tenant_id: TenantId,
        updates: &[(ObjectId, DerivedMetrics)],
    ) -> Result<(), RuleStoreError>;

    async fn rules(&self, tenant_id: TenantId) -> Result<Vec<StoredRule>, RuleStoreError>;

    async fn thresholds(&self, tenant_id: TenantId) -> Result<Vec<ThresholdConfig>, RuleStoreError>;

    /// `false` when an alert with the same tenant and dedup key exists.
    async fn insert_alert(&self, alert: &AlertInstance) -> Result<bool, RuleStoreError>;

    async fn get_alert(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Option<AlertInstance>, RuleStoreError>;

    /// Newest first.
    async fn list_alerts(
        &self,
        tenant_id: TenantId,
        status: Option<AlertStatus>,
    ) -> Result<Vec<AlertInstance>, RuleStoreError>;

    async fn update_alert(&self, alert: &AlertInstance) -> Result<(), RuleStoreError>;

    async fn upsert_object(&self, object: &MonitoredObject) -> Result<(), RuleStoreError>;

    async fn upsert_rule(&self, rule: &IntelligentRule) -> Result<(), RuleStoreError>;

    async fn upsert_threshold(&self, config: &ThresholdConfig) -> Result<(), RuleStoreError>;
}

#[async_trait]
impl<S> RuleStore for Arc<S>
where
    S: RuleStore + ?Sized,
{
    async fn objects(&self, tenant_id: TenantId) -> Result<Vec<MonitoredObject>, RuleStoreError> {
        (**self).objects(tenant_id).await
    }

    async fn save_derived(
        &self,
        tenant_id: TenantId,
        updates: &[(ObjectId, DerivedMetrics)],
    ) -> Result<(), RuleStoreError> {
        (**self).save_derived(tenant_id, updates).await
    }

    async fn rules(&self, tenant_id: TenantId) -> Result<Vec<StoredRule>, RuleStoreError> {
        (**self).rules(tenant_id).await
    }

    async fn thresholds(&self, tenant_id: TenantId) -> Result<Vec<ThresholdConfig>, RuleStoreError> {
        (**self).thresholds(tenant_id).await
    }

    async fn insert_alert(&self, alert: &AlertInstance) -> Result<bool, RuleStoreError> {
        (**self).insert_alert(alert).await
    }

    async fn get_alert(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Option<AlertInstance>, RuleStoreError> {
        (**self).get_alert(tenant_id, alert_id).await
    }

    async fn list_alerts(
        &self,
        tenant_id: TenantId,
        status: Option<AlertStatus>,
    ) -> Result<Vec<AlertInstance>, RuleStoreError> {
        (**self).list_alerts(tenant_id, status).await
    }

    async fn update_alert(&self, alert: &AlertInstance) -> Result<(), RuleStoreError> {
        (**self).update_alert(alert).await
    }

    async fn upsert_object(&self, object: &MonitoredObject) -> Result<(), RuleStoreError> {
        (**self).upsert_object(object).await
    }

    async fn upsert_rule(&self, rule: &IntelligentRule) -> Result<(), RuleStoreError> {
        (**self).upsert_rule(rule).await
    }

    async fn upsert_threshold(&self, config: &ThresholdConfig) -> Result<(), RuleStoreError> {
        (**self).upsert_threshold(config).await
    }
}

#[derive(Debug, Default)]
struct Tables {
    objects: HashMap<ObjectId, MonitoredObject>,
    /// Raw definitions, decoded on read like the JSONB column.
    rules: HashMap<RuleId, (TenantId, serde_json::Value)>,
    thresholds: HashMap<vantage_core::ThresholdId, ThresholdConfig>,
    alerts: HashMap<AlertId, AlertInstance>,
}

/// In-memory rule store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRuleStore {
    tables: RwLock<Tables>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Store a definition as-is, bypassing type checks.
    pub fn insert_raw_rule(&self, tenant_id: TenantId, id: RuleId, definition: serde_json::Value) {
        if let Ok(mut t) = self.tables.write() {
            t.rules.insert(id, (tenant_id, definition));
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, RuleStoreError> {
        let t = self.tables.read().map_err(|_| poisoned())?;
        Ok(f(&t))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T, RuleStoreError>) -> Result<T, RuleStoreError> {
        let mut t = self.tables.write().map_err(|_| poisoned())?;
        f(&mut t)
    }
}

fn poisoned() -> RuleStoreError {
    RuleStoreError::Storage("rule store lock poisoned".to_string())
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn objects(&self, tenant_id: TenantId) -> Result<Vec<MonitoredObject>, RuleStoreError> {
        self.read(|t| {
            let mut out: Vec<MonitoredObject> = t
                .objects
                .values()
                .filter(|o| o.tenant_id == tenant_id)
                .cloned()
                .collect();
            out.sort_by(|a, b| a.id.cmp(&b.id));
            out
        })
    }

    async fn save_derived(
        &self,
        tenant_id: TenantId,
        updates: &[(ObjectId, DerivedMetrics)],
    ) -> Result<(), RuleStoreError> {
        self.write(|t| {
            for (id, derived) in updates {
                if let Some(obj) = t.objects.get_mut(id).filter(|o| o.tenant_id == tenant_id) {
                    obj.derived = Some(derived.clone());
                }
            }
            Ok(())
        })
    }

    async fn rules(&self, tenant_id: TenantId) -> Result<Vec<StoredRule>, RuleStoreError> {
        self.read(|t| {
            let mut rows: Vec<(RuleId, serde_json::Value)> = t
                .rules
                .iter()
                .filter(|(_, (tenant, _))| *tenant == tenant_id)
                .map(|(id, (_, def))| (*id, def.clone()))
                .collect();
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            rows.into_iter().map(|(id, def)| StoredRule::decode(id, def)).collect()
        })
    }

    async fn thresholds(&self, tenant_id: TenantId) -> Result<Vec<ThresholdConfig>, RuleStoreError> {
        self.read(|t| {
            let mut out: Vec<ThresholdConfig> = t
                .thresholds
                .values()
                .filter(|c| c.tenant_id == tenant_id)
                .cloned()
                .collect();
            out.sort_by(|a, b| a.id.cmp(&b.id));
            out
        })
    }

    async fn insert_alert(&self, alert: &AlertInstance) -> Result<bool, RuleStoreError> {
        self.write(|t| {
            let duplicate = t
                .alerts
                .values()
                .any(|a| a.tenant_id == alert.tenant_id && a.dedup_key == alert.dedup_key);
            if duplicate {
                return Ok(false);
            }
            t.alerts.insert(alert.id, alert.clone());
            Ok(true)
        })
    }

    async fn get_alert(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Option<AlertInstance>, RuleStoreError> {
        self.read(|t| t.alerts.get(&alert_id).filter(|a| a.tenant_id == tenant_id).cloned())
    }

    async fn list_alerts(
        &self,
        tenant_id: TenantId,
        status: Option<AlertStatus>,
    ) -> Result<Vec<AlertInstance>, RuleStoreError> {
        self.read(|t| {
            let mut out: Vec<AlertInstance> = t
                .alerts
                .values()
                .filter(|a| a.tenant_id == tenant_id && status.is_none_or(|s| a.status == s))
                .cloned()
                .collect();
            out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            out
        })
    }

    async fn update_alert(&self, alert: &AlertInstance) -> Result<(), RuleStoreError> {
        self.write(|t| {
            let stored = t
                .alerts
                .get_mut(&alert.id)
                .filter(|a| a.tenant_id == alert.tenant_id)
                .ok_or(RuleStoreError::AlertNotFound(alert.id))?;
            *stored = alert.clone();
            Ok(())
        })
    }

    async fn upsert_object(&self, object: &MonitoredObject) -> Result<(), RuleStoreError> {
        self.write(|t| {
            t.objects.insert(object.id, object.clone());
            Ok(())
        })
    }

    async fn upsert_rule(&self, rule: &IntelligentRule) -> Result<(), RuleStoreError> {
        let definition =
            serde_json::to_value(rule).map_err(|e| RuleStoreError::Storage(format!("failed to encode rule: {e}")))?;
        self.write(|t| {
            t.rules.insert(rule.id, (rule.tenant_id, definition));
            Ok(())
        })
    }

    async fn upsert_threshold(&self, config: &ThresholdConfig) -> Result<(), RuleStoreError> {
        self.write(|t| {
            t.thresholds.insert(config.id, config.clone());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_rule_kind_decodes_as_invalid() {
        let id = RuleId::new();
        let def = serde_json::json!({
            "id": id,
            "tenant_id": TenantId::new(),
            "name": "mystery",
            "formula": { "threshold_type": "sentiment", "threshold_config": {} },
            "severity": "warning",
            "priority": 1,
            "enabled": true
        });
        match StoredRule::decode(id, def) {
            StoredRule::Invalid { id: bad, reason } => {
                assert_eq!(bad, id);
                assert!(reason.contains("invalid rule definition"), "{reason}");
            }
            other => panic!("expected invalid, got {other:?}"),
        }
    }
}
