//! Postgres-backed rule store.
//!
//! Rule and threshold definitions are JSONB documents decoded per row, so an
//! unknown `threshold_type` marks that one rule invalid instead of failing
//! the whole load. Alerts are deduplicated by the unique
//! `(tenant_id, dedup_key)` constraint with `ON CONFLICT DO NOTHING`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{instrument, warn};

use vantage_core::{AlertId, ObjectId, RuleId, TenantId};
use vantage_rules::{AlertSource, DerivedMetrics, IntelligentRule, MonitoredObject, Severity, ThresholdConfig};

use super::alert::{AlertInstance, AlertStatus};
use super::store::{RuleStore, RuleStoreError, StoredRule};
use crate::pg;

const ALERT_COLUMNS: &str = "id, tenant_id, source, object_id, severity, status, title, message, impact_amount, \
                             suggested_actions, deadline_at, notification_sent, detection_period, dedup_key, \
                             created_at, acknowledged_at, resolved_at";

#[derive(Debug, Clone)]
pub struct PostgresRuleStore {
    pool: Arc<PgPool>,
}

impl PostgresRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RuleStoreError {
    RuleStoreError::Storage(pg::describe(operation, &err))
}

fn read_err(table: &str) -> impl Fn(sqlx::Error) -> RuleStoreError + '_ {
    move |e| RuleStoreError::Storage(format!("failed to decode {table} row: {e}"))
}

fn json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, RuleStoreError> {
    serde_json::to_value(value).map_err(|e| RuleStoreError::Storage(format!("failed to encode: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value, what: &str) -> Result<T, RuleStoreError> {
    serde_json::from_value(value).map_err(|e| RuleStoreError::Storage(format!("failed to decode {what}: {e}")))
}

#[async_trait]
impl RuleStore for PostgresRuleStore {
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn objects(&self, tenant_id: TenantId) -> Result<Vec<MonitoredObject>, RuleStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, object_type, external_id, current_metrics, attributes, depends_on,
                   daily_sales, derived
            FROM monitored_objects
            WHERE tenant_id = $1
            ORDER BY id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("objects", e))?;

        let read = read_err("monitored_objects");
        rows.iter()
            .map(|row| {
                let depends_on: Vec<uuid::Uuid> = row.try_get("depends_on").map_err(&read)?;
                let derived: Option<serde_json::Value> = row.try_get("derived").map_err(&read)?;
                Ok(MonitoredObject {
                    id: ObjectId::from_uuid(row.try_get("id").map_err(&read)?),
                    tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(&read)?),
                    object_type: row.try_get("object_type").map_err(&read)?,
                    external_id: row.try_get("external_id").map_err(&read)?,
                    current_metrics: from_json::<BTreeMap<String, f64>>(
                        row.try_get("current_metrics").map_err(&read)?,
                        "current_metrics",
                    )?,
                    attributes: from_json(row.try_get("attributes").map_err(&read)?, "attributes")?,
                    depends_on: depends_on.into_iter().map(ObjectId::from_uuid).collect(),
                    daily_sales: from_json(row.try_get("daily_sales").map_err(&read)?, "daily_sales")?,
                    derived: derived.map(|d| from_json(d, "derived")).transpose()?,
                })
            })
            .collect()
    }

    #[instrument(skip(self, updates), fields(tenant_id = %tenant_id, objects = updates.len()), err)]
    async fn save_derived(
        &self,
        tenant_id: TenantId,
        updates: &[(ObjectId, DerivedMetrics)],
    ) -> Result<(), RuleStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("save_derived", e))?;

        for (id, derived) in updates {
            sqlx::query(
                r#"
                UPDATE monitored_objects
                SET derived = $3,
                    sales_velocity = $4,
                    days_of_stock = $5,
                    trend_direction = $6,
                    trend_percent = $7,
                    reorder_point = $8,
                    stockout_risk_days = $9,
                    updated_at = now()
                WHERE tenant_id = $1 AND id = $2
                "#,
            )
            .bind(tenant_id.as_uuid())
            .bind(id.as_uuid())
            .bind(json(derived)?)
            .bind(derived.sales_velocity)
            .bind(derived.days_of_stock)
            .bind(json(&derived.trend_direction)?.as_str().map(str::to_string))
            .bind(derived.trend_percent)
            .bind(derived.reorder_point)
            .bind(derived.stockout_risk_days)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("save_derived", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx_error("save_derived", e))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn rules(&self, tenant_id: TenantId) -> Result<Vec<StoredRule>, RuleStoreError> {
        let rows = sqlx::query("SELECT id, definition FROM intelligent_rules WHERE tenant_id = $1 ORDER BY id")
            .bind(tenant_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("rules", e))?;

        let read = read_err("intelligent_rules");
        rows.iter()
            .map(|row| {
                let id = RuleId::from_uuid(row.try_get("id").map_err(&read)?);
                let definition: serde_json::Value = row.try_get("definition").map_err(&read)?;
                Ok(StoredRule::decode(id, definition))
            })
            .collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn thresholds(&self, tenant_id: TenantId) -> Result<Vec<ThresholdConfig>, RuleStoreError> {
        let rows = sqlx::query("SELECT id, definition FROM threshold_configs WHERE tenant_id = $1 ORDER BY id")
            .bind(tenant_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("thresholds", e))?;

        let read = read_err("threshold_configs");
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: uuid::Uuid = row.try_get("id").map_err(&read)?;
            let definition: serde_json::Value = row.try_get("definition").map_err(&read)?;
            match serde_json::from_value::<ThresholdConfig>(definition) {
                Ok(config) => out.push(config),
                Err(e) => warn!(threshold_id = %id, error = %e, "skipping undecodable threshold config"),
            }
        }
        Ok(out)
    }

    #[instrument(skip(self, alert), fields(tenant_id = %alert.tenant_id, dedup_key = %alert.dedup_key), err)]
    async fn insert_alert(&self, alert: &AlertInstance) -> Result<bool, RuleStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO alerts
                (id, tenant_id, source, source_key, object_id, severity, status, title, message,
                 impact_amount, suggested_actions, deadline_at, notification_sent, detection_period,
                 dedup_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (tenant_id, dedup_key) DO NOTHING
            "#,
        )
        .bind(alert.id.as_uuid())
        .bind(alert.tenant_id.as_uuid())
        .bind(json(&alert.source)?)
        .bind(alert.source.to_string())
        .bind(alert.object_id.map(|id| *id.as_uuid()))
        .bind(alert.severity.as_str())
        .bind(alert.status.as_str())
        .bind(&alert.title)
        .bind(&alert.message)
        .bind(alert.impact_amount)
        .bind(json(&alert.suggested_actions)?)
        .bind(alert.deadline_at)
        .bind(alert.notification_sent)
        .bind(alert.detection_period)
        .bind(&alert.dedup_key)
        .bind(alert.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_alert", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, alert_id = %alert_id), err)]
    async fn get_alert(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<Option<AlertInstance>, RuleStoreError> {
        let sql = format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(alert_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_alert", e))?;
        row.as_ref().map(decode_alert).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_alerts(
        &self,
        tenant_id: TenantId,
        status: Option<AlertStatus>,
    ) -> Result<Vec<AlertInstance>, RuleStoreError> {
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM alerts \
             WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2) \
             ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(status.map(|s| s.as_str()))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_alerts", e))?;
        rows.iter().map(decode_alert).collect()
    }

    #[instrument(skip(self, alert), fields(tenant_id = %alert.tenant_id, alert_id = %alert.id), err)]
    async fn update_alert(&self, alert: &AlertInstance) -> Result<(), RuleStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE alerts
            SET status = $3, notification_sent = $4, acknowledged_at = $5, resolved_at = $6
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(alert.tenant_id.as_uuid())
        .bind(alert.id.as_uuid())
        .bind(alert.status.as_str())
        .bind(alert.notification_sent)
        .bind(alert.acknowledged_at)
        .bind(alert.resolved_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_alert", e))?;

        if result.rows_affected() == 0 {
            return Err(RuleStoreError::AlertNotFound(alert.id));
        }
        Ok(())
    }

    #[instrument(skip(self, object), fields(tenant_id = %object.tenant_id, object_id = %object.id), err)]
    async fn upsert_object(&self, object: &MonitoredObject) -> Result<(), RuleStoreError> {
        let depends_on: Vec<uuid::Uuid> = object.depends_on.iter().map(|id| *id.as_uuid()).collect();
        sqlx::query(
            r#"
            INSERT INTO monitored_objects
                (id, tenant_id, object_type, external_id, current_metrics, attributes, depends_on, daily_sales)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET object_type = EXCLUDED.object_type,
                external_id = EXCLUDED.external_id,
                current_metrics = EXCLUDED.current_metrics,
                attributes = EXCLUDED.attributes,
                depends_on = EXCLUDED.depends_on,
                daily_sales = EXCLUDED.daily_sales,
                updated_at = now()
            WHERE monitored_objects.tenant_id = EXCLUDED.tenant_id
            "#,
        )
        .bind(object.id.as_uuid())
        .bind(object.tenant_id.as_uuid())
        .bind(&object.object_type)
        .bind(&object.external_id)
        .bind(json(&object.current_metrics)?)
        .bind(json(&object.attributes)?)
        .bind(&depends_on)
        .bind(json(&object.daily_sales)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_object", e))?;
        Ok(())
    }

    #[instrument(skip(self, rule), fields(tenant_id = %rule.tenant_id, rule_id = %rule.id), err)]
    async fn upsert_rule(&self, rule: &IntelligentRule) -> Result<(), RuleStoreError> {
        sqlx::query(
            r#"
            INSERT INTO intelligent_rules (id, tenant_id, priority, enabled, definition)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET priority = EXCLUDED.priority, enabled = EXCLUDED.enabled, definition = EXCLUDED.definition
            WHERE intelligent_rules.tenant_id = EXCLUDED.tenant_id
            "#,
        )
        .bind(rule.id.as_uuid())
        .bind(rule.tenant_id.as_uuid())
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(json(rule)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_rule", e))?;
        Ok(())
    }

    #[instrument(skip(self, config), fields(tenant_id = %config.tenant_id, threshold_id = %config.id), err)]
    async fn upsert_threshold(&self, config: &ThresholdConfig) -> Result<(), RuleStoreError> {
        sqlx::query(
            r#"
            INSERT INTO threshold_configs (id, tenant_id, enabled, definition)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET enabled = EXCLUDED.enabled, definition = EXCLUDED.definition
            WHERE threshold_configs.tenant_id = EXCLUDED.tenant_id
            "#,
        )
        .bind(config.id.as_uuid())
        .bind(config.tenant_id.as_uuid())
        .bind(config.enabled)
        .bind(json(config)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_threshold", e))?;
        Ok(())
    }
}

fn decode_alert(row: &sqlx::postgres::PgRow) -> Result<AlertInstance, RuleStoreError> {
    let read = read_err("alerts");
    let severity: String = row.try_get("severity").map_err(&read)?;
    let status: String = row.try_get("status").map_err(&read)?;
    let object_id: Option<uuid::Uuid> = row.try_get("object_id").map_err(&read)?;

    Ok(AlertInstance {
        id: AlertId::from_uuid(row.try_get("id").map_err(&read)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(&read)?),
        source: from_json::<AlertSource>(row.try_get("source").map_err(&read)?, "alert source")?,
        object_id: object_id.map(ObjectId::from_uuid),
        severity: severity.parse::<Severity>().map_err(RuleStoreError::Storage)?,
        status: status
            .parse::<AlertStatus>()
            .map_err(|e| RuleStoreError::Storage(e.to_string()))?,
        title: row.try_get("title").map_err(&read)?,
        message: row.try_get("message").map_err(&read)?,
        impact_amount: row.try_get("impact_amount").map_err(&read)?,
        suggested_actions: from_json(row.try_get("suggested_actions").map_err(&read)?, "suggested_actions")?,
        deadline_at: row.try_get("deadline_at").map_err(&read)?,
        notification_sent: row.try_get("notification_sent").map_err(&read)?,
        detection_period: row.try_get("detection_period").map_err(&read)?,
        dedup_key: row.try_get("dedup_key").map_err(&read)?,
        created_at: row.try_get("created_at").map_err(&read)?,
        acknowledged_at: row.try_get("acknowledged_at").map_err(&read)?,
        resolved_at: row.try_get("resolved_at").map_err(&read)?,
    })
}
