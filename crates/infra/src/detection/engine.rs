//! Detection pass over one tenant.
//!
//! Order is fixed: refresh derived metrics, intelligent rules (ascending
//! priority, ties by id), threshold configs, correlation patterns. Each rule
//! is evaluated in isolation; its failures land in the report and the pass
//! moves on.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use vantage_core::{AlertId, Clock, DomainError, TenantId};
use vantage_decisions::{CardTrigger, Priority};
use vantage_rules::{
    default_correlations, derive_metrics, evaluate_threshold, run_correlations, CompiledRule, CorrelationRule,
    DerivationPolicy, Detection, IntelligentRule, MonitoredObject, Severity,
};

use super::alert::{AlertInstance, AlertStatus};
use super::store::{RuleStore, RuleStoreError, StoredRule};
use crate::cards::{CardService, CardStoreError, CardServiceError, NewCard};
use crate::jobs::{AcquireOptions, ExclusiveRun, JobRegistry, RegistryError};

/// Job registry function name for standalone detection passes.
pub const DETECTION_FUNCTION: &str = "detect-rules";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleEngineError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] RuleStoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub derivation: DerivationPolicy,
    pub correlations: Vec<CorrelationRule>,
    /// New alerts at or above this severity open a decision card.
    /// `None` disables card creation.
    pub card_spawn_severity: Option<Severity>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            derivation: DerivationPolicy::default(),
            correlations: default_correlations(),
            card_spawn_severity: Some(Severity::Warning),
        }
    }
}

impl DetectionConfig {
    pub fn with_card_spawn_severity(mut self, severity: Option<Severity>) -> Self {
        self.card_spawn_severity = severity;
        self
    }

    pub fn with_correlations(mut self, correlations: Vec<CorrelationRule>) -> Self {
        self.correlations = correlations;
        self
    }
}

/// Failure recorded against one rule definition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailure {
    /// `rule:<id>`, `threshold:<id>` or `card:<alert id>`.
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionReport {
    pub period: Option<NaiveDate>,
    pub objects_refreshed: usize,
    /// Intelligent rules and threshold configs, valid or not.
    pub rules_checked: usize,
    pub correlations_checked: usize,
    pub alerts_triggered: usize,
    pub duplicates_skipped: usize,
    pub cards_opened: usize,
    pub errors: Vec<RuleFailure>,
}

#[derive(Clone)]
pub struct RuleEngine {
    store: Arc<dyn RuleStore>,
    cards: Option<CardService>,
    clock: Arc<dyn Clock>,
    config: DetectionConfig,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn RuleStore>, clock: Arc<dyn Clock>, config: DetectionConfig) -> Self {
        Self {
            store,
            cards: None,
            clock,
            config,
        }
    }

    pub fn with_cards(mut self, cards: CardService) -> Self {
        self.cards = Some(cards);
        self
    }

    /// Standalone detection under the `detect-rules` job lock for the
    /// tenant and period. The pipeline calls [`RuleEngine::detect`] directly
    /// since it already holds its own lock.
    pub async fn detect_exclusive(
        &self,
        registry: &JobRegistry,
        tenant_id: TenantId,
        period: NaiveDate,
    ) -> Result<ExclusiveRun<DetectionReport>, RuleEngineError> {
        let opts = AcquireOptions::default().with_grain_date(period);
        registry
            .with_idempotency(DETECTION_FUNCTION, tenant_id, opts, |_job| self.detect(tenant_id, period))
            .await?
            .into_exclusive()
    }

    pub async fn detect(&self, tenant_id: TenantId, period: NaiveDate) -> Result<DetectionReport, RuleEngineError> {
        let mut report = DetectionReport {
            period: Some(period),
            ..DetectionReport::default()
        };

        // 1. Refresh derived metrics.
        let mut objects = self.store.objects(tenant_id).await?;
        let updates: Vec<_> = objects
            .iter_mut()
            .map(|obj| {
                let derived = derive_metrics(obj, &self.config.derivation);
                obj.derived = Some(derived.clone());
                (obj.id, derived)
            })
            .collect();
        self.store.save_derived(tenant_id, &updates).await?;
        report.objects_refreshed = objects.len();

        // 2. Intelligent rules.
        let mut rules: Vec<IntelligentRule> = Vec::new();
        for stored in self.store.rules(tenant_id).await? {
            match stored {
                StoredRule::Valid(rule) => {
                    if rule.enabled {
                        rules.push(rule);
                    }
                }
                StoredRule::Invalid { id, reason } => {
                    report.rules_checked += 1;
                    record(&mut report, format!("rule:{id}"), reason);
                }
            }
        }
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));

        for rule in &rules {
            report.rules_checked += 1;
            for detection in evaluate_rule(rule, &objects, &mut report) {
                self.materialize(tenant_id, period, detection, &mut report).await?;
            }
        }

        // 3. Threshold configs.
        for config in self.store.thresholds(tenant_id).await? {
            if !config.enabled {
                continue;
            }
            report.rules_checked += 1;
            if !config.value.is_finite() {
                record(&mut report, format!("threshold:{}", config.id), "threshold value is not finite".into());
                continue;
            }
            for obj in &objects {
                if let Some(detection) = evaluate_threshold(&config, obj) {
                    self.materialize(tenant_id, period, detection, &mut report).await?;
                }
            }
        }

        // 4. Correlations.
        report.correlations_checked = self.config.correlations.len();
        for detection in run_correlations(&objects, &self.config.correlations) {
            self.materialize(tenant_id, period, detection, &mut report).await?;
        }

        info!(
            tenant = %tenant_id,
            %period,
            rules_checked = report.rules_checked,
            alerts_triggered = report.alerts_triggered,
            duplicates_skipped = report.duplicates_skipped,
            errors = report.errors.len(),
            "detection pass finished"
        );
        Ok(report)
    }

    pub async fn list_alerts(
        &self,
        tenant_id: TenantId,
        status: Option<AlertStatus>,
    ) -> Result<Vec<AlertInstance>, RuleEngineError> {
        Ok(self.store.list_alerts(tenant_id, status).await?)
    }

    pub async fn acknowledge(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<AlertInstance, RuleEngineError> {
        self.update_alert(tenant_id, alert_id, |a, now| a.acknowledge(now)).await
    }

    pub async fn resolve(&self, tenant_id: TenantId, alert_id: AlertId) -> Result<AlertInstance, RuleEngineError> {
        self.update_alert(tenant_id, alert_id, |a, now| a.resolve(now)).await
    }

    async fn update_alert(
        &self,
        tenant_id: TenantId,
        alert_id: AlertId,
        change: impl FnOnce(&mut AlertInstance, chrono::DateTime<chrono::Utc>) -> Result<(), DomainError>,
    ) -> Result<AlertInstance, RuleEngineError> {
        let mut alert = self
            .store
            .get_alert(tenant_id, alert_id)
            .await?
            .ok_or(RuleStoreError::AlertNotFound(alert_id))?;
        change(&mut alert, self.clock.now())?;
        self.store.update_alert(&alert).await?;
        info!(tenant = %tenant_id, alert_id = %alert_id, status = alert.status.as_str(), "alert updated");
        Ok(alert)
    }

    async fn materialize(
        &self,
        tenant_id: TenantId,
        period: NaiveDate,
        detection: Detection,
        report: &mut DetectionReport,
    ) -> Result<(), RuleEngineError> {
        let alert = AlertInstance::from_detection(tenant_id, detection, period, self.clock.now());
        if !self.store.insert_alert(&alert).await? {
            debug!(dedup_key = %alert.dedup_key, "duplicate alert skipped");
            report.duplicates_skipped += 1;
            return Ok(());
        }
        report.alerts_triggered += 1;
        self.spawn_card(tenant_id, &alert, report).await;
        Ok(())
    }

    async fn spawn_card(&self, tenant_id: TenantId, alert: &AlertInstance, report: &mut DetectionReport) {
        let (Some(cards), Some(min)) = (&self.cards, self.config.card_spawn_severity) else {
            return;
        };
        if alert.severity < min {
            return;
        }

        let new = NewCard {
            title: alert.title.clone(),
            priority: Priority::from_severity(alert.severity),
            deadline_at: Some(alert.deadline_at),
            predicted_impact: alert.impact_amount,
            trigger: CardTrigger::alert(alert.id, alert.condition_key()),
        };
        match cards.open_card(tenant_id, new).await {
            Ok(_) => report.cards_opened += 1,
            Err(CardServiceError::Store(CardStoreError::DuplicateTrigger(_))) => {}
            Err(e) => {
                warn!(tenant = %tenant_id, alert_id = %alert.id, error = %e, "failed to open card for alert");
                record(report, format!("card:{}", alert.id), e.to_string());
            }
        }
    }
}

/// Evaluate one rule against every object, recording failures.
fn evaluate_rule(rule: &IntelligentRule, objects: &[MonitoredObject], report: &mut DetectionReport) -> Vec<Detection> {
    let source = format!("rule:{}", rule.id);
    let compiled = match CompiledRule::compile(rule) {
        Ok(c) => c,
        Err(e) => {
            record(report, source, e.to_string());
            return Vec::new();
        }
    };

    let mut detections = Vec::new();
    for obj in objects {
        match compiled.evaluate(obj) {
            Ok(Some(breach)) => detections.push(compiled.detection(obj, &breach)),
            Ok(None) => {}
            Err(e) => record(report, source.clone(), format!("{}: {e}", obj.external_id)),
        }
    }
    detections
}

fn record(report: &mut DetectionReport, source: String, message: String) {
    warn!(%source, %message, "rule evaluation failed");
    report.errors.push(RuleFailure { source, message });
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use vantage_core::{FixedClock, RuleId, ThresholdId};
    use vantage_rules::{ComparisonOp, RuleKind, ThresholdConfig};

    use super::*;
    use crate::cards::InMemoryCardStore;
    use crate::detection::store::InMemoryRuleStore;
    use crate::jobs::{InMemoryJobStore, JobRunStatus};

    fn period() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    struct Fixture {
        engine: RuleEngine,
        store: Arc<InMemoryRuleStore>,
        cards: CardService,
        tenant: TenantId,
    }

    fn fixture(config: DetectionConfig) -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap()));
        let store = InMemoryRuleStore::arc();
        let cards = CardService::new(InMemoryCardStore::arc(), clock.clone());
        let engine = RuleEngine::new(store.clone(), clock, config).with_cards(cards.clone());
        Fixture {
            engine,
            store,
            cards,
            tenant: TenantId::new(),
        }
    }

    fn low_stock_threshold(tenant: TenantId) -> ThresholdConfig {
        ThresholdConfig {
            id: ThresholdId::new(),
            tenant_id: tenant,
            metric: "days_of_stock".into(),
            operator: ComparisonOp::Lt,
            value: 5.0,
            unit: Some("days".into()),
            severity: Severity::Critical,
            enabled: true,
            object_type: None,
        }
    }

    fn rule(tenant: TenantId, name: &str, priority: i32, formula: RuleKind) -> IntelligentRule {
        IntelligentRule {
            id: RuleId::new(),
            tenant_id: tenant,
            name: name.into(),
            formula,
            severity: Severity::Warning,
            suggested_actions: vec![],
            priority,
            enabled: true,
            object_type: None,
        }
    }

    #[tokio::test]
    async fn threshold_breach_raises_one_alert_per_period() {
        let f = fixture(DetectionConfig::default().with_correlations(vec![]));
        let obj = MonitoredObject::new(f.tenant, "sku", "SKU-1").with_metric("days_of_stock", 3.0);
        f.store.upsert_object(&obj).await.unwrap();
        f.store.upsert_threshold(&low_stock_threshold(f.tenant)).await.unwrap();

        let first = f.engine.detect(f.tenant, period()).await.unwrap();
        assert_eq!(first.alerts_triggered, 1);
        assert_eq!(first.cards_opened, 1);

        let second = f.engine.detect(f.tenant, period()).await.unwrap();
        assert_eq!(second.alerts_triggered, 0);
        assert_eq!(second.duplicates_skipped, 1);

        let alerts = f.engine.list_alerts(f.tenant, Some(AlertStatus::Active)).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(f.cards.actionable_queue(f.tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ongoing_condition_keeps_a_single_undecided_card() {
        let f = fixture(DetectionConfig::default().with_correlations(vec![]));
        let obj = MonitoredObject::new(f.tenant, "sku", "SKU-1").with_metric("days_of_stock", 3.0);
        f.store.upsert_object(&obj).await.unwrap();
        f.store.upsert_threshold(&low_stock_threshold(f.tenant)).await.unwrap();

        let mut day = period();
        for _ in 0..3 {
            let report = f.engine.detect(f.tenant, day).await.unwrap();
            assert_eq!(report.alerts_triggered, 1, "one alert per period");
            day = day.succ_opt().unwrap();
        }

        assert_eq!(f.engine.list_alerts(f.tenant, None).await.unwrap().len(), 3);
        let queue = f.cards.actionable_queue(f.tenant).await.unwrap();
        assert_eq!(queue.len(), 1);

        // Deciding frees the condition; the next period opens a fresh card.
        f.cards.decide(f.tenant, *queue[0].id(), "reorder", None).await.unwrap();
        let report = f.engine.detect(f.tenant, day).await.unwrap();
        assert_eq!(report.cards_opened, 1);
        assert_eq!(f.cards.actionable_queue(f.tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn standalone_detection_holds_a_job_lock_per_period() {
        let f = fixture(DetectionConfig::default().with_correlations(vec![]));
        let registry = JobRegistry::new(
            InMemoryJobStore::arc(),
            Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 6, 0, 0).unwrap())),
        );
        f.store
            .upsert_object(&MonitoredObject::new(f.tenant, "sku", "SKU-1").with_metric("days_of_stock", 3.0))
            .await
            .unwrap();
        f.store.upsert_threshold(&low_stock_threshold(f.tenant)).await.unwrap();

        let held = registry
            .acquire_lock(DETECTION_FUNCTION, f.tenant, AcquireOptions::default().with_grain_date(period()))
            .await
            .unwrap();
        assert!(held.is_acquired());
        let outcome = f.engine.detect_exclusive(&registry, f.tenant, period()).await.unwrap();
        assert!(matches!(outcome, ExclusiveRun::AlreadyRunning { .. }));
        assert!(f.engine.list_alerts(f.tenant, None).await.unwrap().is_empty());

        // Another period is a different lock.
        let next = period().succ_opt().unwrap();
        let ExclusiveRun::Ran { job_id, value } = f.engine.detect_exclusive(&registry, f.tenant, next).await.unwrap()
        else {
            panic!("expected the pass to run");
        };
        assert_eq!(value.alerts_triggered, 1);
        assert_eq!(registry.get_job(f.tenant, job_id).await.unwrap().status, JobRunStatus::Completed);
    }

    #[tokio::test]
    async fn malformed_rule_does_not_block_others() {
        let f = fixture(DetectionConfig::default().with_correlations(vec![]));
        let obj = MonitoredObject::new(f.tenant, "sku", "SKU-1")
            .with_metric("margin", 0.02)
            .with_metric("returns", 0.0);
        f.store.upsert_object(&obj).await.unwrap();

        let broken = rule(
            f.tenant,
            "broken",
            1,
            RuleKind::Formula {
                expression: "margin * (".into(),
                operator: ComparisonOp::Lt,
                value: 1.0,
            },
        );
        let div_zero = rule(
            f.tenant,
            "div-zero",
            2,
            RuleKind::Formula {
                expression: "margin / returns".into(),
                operator: ComparisonOp::Gt,
                value: 1.0,
            },
        );
        let healthy = rule(
            f.tenant,
            "thin-margin",
            3,
            RuleKind::Comparison {
                metric: "margin".into(),
                operator: ComparisonOp::Lt,
                value: 0.05,
            },
        );
        for r in [&broken, &div_zero, &healthy] {
            f.store.upsert_rule(r).await.unwrap();
        }
        let unknown = RuleId::new();
        f.store.insert_raw_rule(
            f.tenant,
            unknown,
            serde_json::json!({"id": unknown, "formula": {"threshold_type": "sentiment"}}),
        );

        let report = f.engine.detect(f.tenant, period()).await.unwrap();
        assert_eq!(report.rules_checked, 4);
        assert_eq!(report.alerts_triggered, 1);

        let failed: Vec<&str> = report.errors.iter().map(|e| e.source.as_str()).collect();
        assert!(failed.contains(&format!("rule:{}", broken.id).as_str()));
        assert!(failed.contains(&format!("rule:{}", div_zero.id).as_str()));
        assert!(failed.contains(&format!("rule:{unknown}").as_str()));
        assert!(!failed.contains(&format!("rule:{}", healthy.id).as_str()));
    }

    #[tokio::test]
    async fn missing_metric_is_not_applicable() {
        let f = fixture(DetectionConfig::default().with_correlations(vec![]));
        f.store
            .upsert_object(&MonitoredObject::new(f.tenant, "campaign", "CMP-9"))
            .await
            .unwrap();
        f.store.upsert_threshold(&low_stock_threshold(f.tenant)).await.unwrap();

        let report = f.engine.detect(f.tenant, period()).await.unwrap();
        assert_eq!(report.alerts_triggered, 0);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn derived_metrics_are_persisted_before_rules_run() {
        let f = fixture(DetectionConfig::default().with_correlations(vec![]));
        let obj = MonitoredObject::new(f.tenant, "sku", "SKU-2")
            .with_metric("stock_on_hand", 20.0)
            .with_sales(vec![10.0; 14]);
        f.store.upsert_object(&obj).await.unwrap();
        f.store.upsert_threshold(&low_stock_threshold(f.tenant)).await.unwrap();

        let report = f.engine.detect(f.tenant, period()).await.unwrap();
        assert_eq!(report.objects_refreshed, 1);
        assert_eq!(report.alerts_triggered, 1, "2 days of stock left");

        let stored = f.store.objects(f.tenant).await.unwrap();
        let derived = stored[0].derived.as_ref().unwrap();
        assert_eq!(derived.sales_velocity, 10.0);
        assert_eq!(derived.days_of_stock, Some(2.0));
    }

    #[tokio::test]
    async fn low_severity_alerts_do_not_open_cards() {
        let f = fixture(
            DetectionConfig::default()
                .with_correlations(vec![])
                .with_card_spawn_severity(Some(Severity::Critical)),
        );
        f.store
            .upsert_object(&MonitoredObject::new(f.tenant, "sku", "SKU-3").with_metric("margin", 0.01))
            .await
            .unwrap();
        f.store
            .upsert_rule(&rule(
                f.tenant,
                "thin-margin",
                1,
                RuleKind::Comparison {
                    metric: "margin".into(),
                    operator: ComparisonOp::Lt,
                    value: 0.05,
                },
            ))
            .await
            .unwrap();

        let report = f.engine.detect(f.tenant, period()).await.unwrap();
        assert_eq!((report.alerts_triggered, report.cards_opened), (1, 0));
    }

    #[tokio::test]
    async fn alert_actions() {
        let f = fixture(DetectionConfig::default().with_correlations(vec![]));
        f.store
            .upsert_object(&MonitoredObject::new(f.tenant, "sku", "SKU-1").with_metric("days_of_stock", 1.0))
            .await
            .unwrap();
        f.store.upsert_threshold(&low_stock_threshold(f.tenant)).await.unwrap();
        f.engine.detect(f.tenant, period()).await.unwrap();
        let alert = f.engine.list_alerts(f.tenant, None).await.unwrap().remove(0);

        let acked = f.engine.acknowledge(f.tenant, alert.id).await.unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert!(matches!(
            f.engine.acknowledge(f.tenant, alert.id).await,
            Err(RuleEngineError::Domain(DomainError::InvalidTransition(_)))
        ));
        assert_eq!(f.engine.resolve(f.tenant, alert.id).await.unwrap().status, AlertStatus::Resolved);

        assert!(matches!(
            f.engine.resolve(TenantId::new(), alert.id).await,
            Err(RuleEngineError::Store(RuleStoreError::AlertNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn correlations_run_after_rules() {
        let f = fixture(DetectionConfig::default());
        for (sku, stock) in [("A", 5.0), ("B", 4.0), ("C", 3.0)] {
            let obj = MonitoredObject::new(f.tenant, "sku", sku)
                .with_attribute("supplier", "Acme")
                .with_metric("stock_on_hand", stock)
                .with_sales(vec![1.0; 14]);
            f.store.upsert_object(&obj).await.unwrap();
        }

        let report = f.engine.detect(f.tenant, period()).await.unwrap();
        assert_eq!(report.correlations_checked, 2);
        let alerts = f.engine.list_alerts(f.tenant, None).await.unwrap();
        assert!(
            alerts
                .iter()
                .any(|a| a.object_id.is_none() && a.source.to_string().contains("shared_attribute_risk")),
            "{alerts:?}"
        );
    }
}
