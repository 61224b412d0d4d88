use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use vantage_core::{ObjectId, RuleId, ThresholdId};

use crate::error::{FormulaError, RuleError};
use crate::formula::Formula;
use crate::object::{MonitoredObject, UNIT_PRICE};
use crate::rule::{ComparisonOp, IntelligentRule, RuleKind, Severity, ThresholdConfig, WeightedTerm};

/// What raised an alert. Part of the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AlertSource {
    Rule(RuleId),
    Threshold(ThresholdId),
    /// Cross-object pattern, keyed by pattern name and group.
    Correlation(String),
}

impl core::fmt::Display for AlertSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            AlertSource::Rule(id) => write!(f, "rule:{id}"),
            AlertSource::Threshold(id) => write!(f, "threshold:{id}"),
            AlertSource::Correlation(key) => write!(f, "correlation:{key}"),
        }
    }
}

/// Observed value that crossed a rule's boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breach {
    pub observed: f64,
    /// Human-readable boundary, e.g. `"< 5"` or `"outside [10, 20]"`.
    pub boundary: String,
}

/// A rule firing against one object (or a group, for correlations).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub source: AlertSource,
    pub object_id: Option<ObjectId>,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub impact_amount: f64,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

impl AlertSource {
    /// `(source, object)`: names an ongoing condition regardless of when it
    /// was detected.
    pub fn condition_key(&self, object_id: Option<ObjectId>) -> String {
        let object = object_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
        format!("{self}:{object}")
    }
}

impl Detection {
    pub fn condition_key(&self) -> String {
        self.source.condition_key(self.object_id)
    }

    /// `(source, object, period)`: the same condition firing twice in one
    /// period maps to the same key.
    pub fn dedup_key(&self, period: NaiveDate) -> String {
        format!("{}:{}", self.condition_key(), period)
    }
}

/// An intelligent rule with its formula parsed once per run.
#[derive(Debug, Clone)]
pub struct CompiledRule<'a> {
    rule: &'a IntelligentRule,
    formula: Option<Formula>,
}

impl<'a> CompiledRule<'a> {
    /// Validate the rule definition; malformed formulas fail here.
    pub fn compile(rule: &'a IntelligentRule) -> Result<Self, RuleError> {
        let formula = match &rule.formula {
            RuleKind::Comparison { value, .. } => {
                ensure_finite(*value)?;
                None
            }
            RuleKind::Band { min, max, .. } => {
                ensure_finite(*min)?;
                ensure_finite(*max)?;
                if min > max {
                    return Err(RuleError::InvalidConfig(format!(
                        "band min {min} is greater than max {max}"
                    )));
                }
                None
            }
            RuleKind::WeightedScore { terms, value, .. } => {
                ensure_finite(*value)?;
                if terms.is_empty() {
                    return Err(RuleError::InvalidConfig("weighted score has no terms".into()));
                }
                for t in terms {
                    ensure_finite(t.weight)?;
                }
                None
            }
            RuleKind::Formula { expression, value, .. } => {
                ensure_finite(*value)?;
                Some(Formula::parse(expression)?)
            }
        };
        Ok(Self { rule, formula })
    }

    pub fn rule(&self) -> &IntelligentRule {
        self.rule
    }

    /// `Ok(None)` when the rule holds or does not apply to this object.
    pub fn evaluate(&self, object: &MonitoredObject) -> Result<Option<Breach>, RuleError> {
        if !self.rule.applies_to(&object.object_type) {
            return Ok(None);
        }

        let breach = match &self.rule.formula {
            RuleKind::Comparison { metric, operator, value } => {
                object.metric(metric).and_then(|v| compare(v, *operator, *value))
            }
            RuleKind::Band { metric, min, max } => object.metric(metric).and_then(|v| {
                (v < *min || v > *max).then(|| Breach {
                    observed: v,
                    boundary: format!("outside [{min}, {max}]"),
                })
            }),
            RuleKind::WeightedScore { terms, operator, value } => {
                weighted_score(terms, object)?.and_then(|v| compare(v, *operator, *value))
            }
            RuleKind::Formula { operator, value, .. } => {
                let formula = self
                    .formula
                    .as_ref()
                    .ok_or_else(|| RuleError::InvalidConfig("formula was not compiled".into()))?;
                formula
                    .evaluate(|name| object.metric(name))?
                    .and_then(|v| compare(v, *operator, *value))
            }
        };
        Ok(breach)
    }

    pub fn detection(&self, object: &MonitoredObject, breach: &Breach) -> Detection {
        Detection {
            source: AlertSource::Rule(self.rule.id),
            object_id: Some(object.id),
            severity: self.rule.severity,
            title: format!("{}: {}", self.rule.name, object.external_id),
            message: format!(
                "{} {} observed {:.2} ({} rule, boundary {})",
                object.object_type,
                object.external_id,
                breach.observed,
                self.rule.formula.type_name(),
                breach.boundary
            ),
            impact_amount: estimate_impact(object),
            suggested_actions: self.rule.suggested_actions.clone(),
        }
    }
}

/// Literal threshold check. Missing metrics never fire.
pub fn evaluate_threshold(config: &ThresholdConfig, object: &MonitoredObject) -> Option<Detection> {
    if !config.enabled || !config.applies_to(&object.object_type) {
        return None;
    }
    let breach = object
        .metric(&config.metric)
        .and_then(|v| compare(v, config.operator, config.value))?;

    let unit = config.unit.as_deref().map(|u| format!(" {u}")).unwrap_or_default();
    Some(Detection {
        source: AlertSource::Threshold(config.id),
        object_id: Some(object.id),
        severity: config.severity,
        title: format!("{} threshold breached: {}", config.metric, object.external_id),
        message: format!(
            "{} is {:.2}{unit}, threshold {}{unit}",
            config.metric, breach.observed, breach.boundary
        ),
        impact_amount: estimate_impact(object),
        suggested_actions: Vec::new(),
    })
}

/// Revenue at risk: days without stock before replenishment × velocity × price.
///
/// Zero when the object has no derived metrics, no price, or no gap.
pub fn estimate_impact(object: &MonitoredObject) -> f64 {
    let Some(derived) = &object.derived else {
        return 0.0;
    };
    let price = object.current_metrics.get(UNIT_PRICE).copied().unwrap_or(0.0);
    let gap_days = derived.stockout_risk_days.map(|r| (-r).max(0.0)).unwrap_or(0.0);
    gap_days * derived.sales_velocity * price
}

fn compare(observed: f64, operator: ComparisonOp, threshold: f64) -> Option<Breach> {
    operator.holds(observed, threshold).then(|| Breach {
        observed,
        boundary: format!("{} {threshold}", operator.symbol()),
    })
}

/// `Ok(None)` when any term's metric is missing.
fn weighted_score(terms: &[WeightedTerm], object: &MonitoredObject) -> Result<Option<f64>, RuleError> {
    let score: Option<f64> = terms
        .iter()
        .map(|t| object.metric(&t.metric).map(|v| v * t.weight))
        .sum();
    match score {
        Some(v) if !v.is_finite() => Err(FormulaError::NonFinite.into()),
        other => Ok(other),
    }
}

fn ensure_finite(v: f64) -> Result<(), RuleError> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(RuleError::InvalidConfig(format!("non-finite constant {v}")))
    }
}

#[cfg(test)]
mod tests {
    use vantage_core::TenantId;

    use super::*;
    use crate::object::{derive_metrics, DerivationPolicy, STOCK_ON_HAND};

    fn rule(kind: RuleKind) -> IntelligentRule {
        IntelligentRule {
            id: RuleId::new(),
            tenant_id: TenantId::new(),
            name: "test rule".into(),
            formula: kind,
            severity: Severity::Warning,
            suggested_actions: vec!["reorder".into()],
            priority: 1,
            enabled: true,
            object_type: None,
        }
    }

    fn refreshed(mut obj: MonitoredObject) -> MonitoredObject {
        obj.derived = Some(derive_metrics(&obj, &DerivationPolicy::default()));
        obj
    }

    fn low_stock_sku() -> MonitoredObject {
        refreshed(
            MonitoredObject::new(TenantId::new(), "sku", "SKU-7")
                .with_metric(STOCK_ON_HAND, 30.0)
                .with_metric("lead_time_days", 5.0)
                .with_metric(UNIT_PRICE, 2.0)
                .with_sales(vec![10.0; 14]),
        )
    }

    #[test]
    fn threshold_fires_on_breach() {
        let obj = low_stock_sku();
        let cfg = ThresholdConfig {
            id: ThresholdId::new(),
            tenant_id: obj.tenant_id,
            metric: "days_of_stock".into(),
            operator: ComparisonOp::Lt,
            value: 5.0,
            unit: Some("days".into()),
            severity: Severity::Critical,
            enabled: true,
            object_type: None,
        };

        let d = evaluate_threshold(&cfg, &obj).expect("should fire");
        assert_eq!(d.severity, Severity::Critical);
        assert_eq!(d.object_id, Some(obj.id));
        // 2 gap days * 10 units/day * 2.0 price
        assert_eq!(d.impact_amount, 40.0);

        let disabled = ThresholdConfig { enabled: false, ..cfg };
        assert!(evaluate_threshold(&disabled, &obj).is_none());
    }

    #[test]
    fn band_and_weighted_score() {
        let obj = low_stock_sku().with_metric("ctr", 0.5).with_metric("cvr", 0.2);

        let band = rule(RuleKind::Band { metric: "ctr".into(), min: 1.0, max: 2.0 });
        let compiled = CompiledRule::compile(&band).unwrap();
        assert_eq!(compiled.evaluate(&obj).unwrap().unwrap().observed, 0.5);

        let score = rule(RuleKind::WeightedScore {
            terms: vec![
                WeightedTerm { metric: "ctr".into(), weight: 2.0 },
                WeightedTerm { metric: "cvr".into(), weight: 5.0 },
            ],
            operator: ComparisonOp::Ge,
            value: 2.0,
        });
        let compiled = CompiledRule::compile(&score).unwrap();
        assert_eq!(compiled.evaluate(&obj).unwrap().unwrap().observed, 2.0);
    }

    #[test]
    fn overflowing_weighted_score_is_an_error() {
        let obj = low_stock_sku().with_metric("ctr", 1e308).with_metric("cvr", 1e308);
        let score = rule(RuleKind::WeightedScore {
            terms: vec![
                WeightedTerm { metric: "ctr".into(), weight: 10.0 },
                WeightedTerm { metric: "cvr".into(), weight: 10.0 },
            ],
            operator: ComparisonOp::Gt,
            value: 1.0,
        });
        let compiled = CompiledRule::compile(&score).unwrap();
        assert!(matches!(
            compiled.evaluate(&obj),
            Err(RuleError::Formula(FormulaError::NonFinite))
        ));
    }

    #[test]
    fn formula_rule_compiles_once_and_evaluates() {
        let obj = low_stock_sku();
        let r = rule(RuleKind::Formula {
            expression: "stock_on_hand - reorder_point".into(),
            operator: ComparisonOp::Lt,
            value: 0.0,
        });
        let compiled = CompiledRule::compile(&r).unwrap();
        let breach = compiled.evaluate(&obj).unwrap().unwrap();
        assert_eq!(breach.observed, 30.0 - 80.0);

        let d = compiled.detection(&obj, &breach);
        assert_eq!(d.source, AlertSource::Rule(r.id));
        assert_eq!(d.suggested_actions, vec!["reorder".to_string()]);
    }

    #[test]
    fn invalid_definitions_fail_compilation() {
        let bad_formula = rule(RuleKind::Formula {
            expression: "stock_on_hand <".into(),
            operator: ComparisonOp::Lt,
            value: 0.0,
        });
        assert!(matches!(CompiledRule::compile(&bad_formula), Err(RuleError::Formula(_))));

        let bad_band = rule(RuleKind::Band { metric: "x".into(), min: 5.0, max: 1.0 });
        assert!(matches!(CompiledRule::compile(&bad_band), Err(RuleError::InvalidConfig(_))));
    }

    #[test]
    fn object_type_filter_and_missing_metric_skip() {
        let obj = low_stock_sku();
        let mut r = rule(RuleKind::Comparison {
            metric: "roas".into(),
            operator: ComparisonOp::Lt,
            value: 1.0,
        });
        assert_eq!(CompiledRule::compile(&r).unwrap().evaluate(&obj), Ok(None));

        r.formula = RuleKind::Comparison {
            metric: "days_of_stock".into(),
            operator: ComparisonOp::Lt,
            value: 5.0,
        };
        r.object_type = Some("campaign".into());
        assert_eq!(CompiledRule::compile(&r).unwrap().evaluate(&obj), Ok(None));
    }

    #[test]
    fn dedup_key_is_stable_per_period() {
        let obj = low_stock_sku();
        let d = Detection {
            source: AlertSource::Correlation("dependency_cascade".into()),
            object_id: Some(obj.id),
            severity: Severity::Info,
            title: String::new(),
            message: String::new(),
            impact_amount: 0.0,
            suggested_actions: vec![],
        };
        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        assert_eq!(d.dedup_key(day), d.clone().dedup_key(day));
        assert_ne!(d.dedup_key(day), d.dedup_key(day.succ_opt().unwrap()));
        assert!(d.dedup_key(day).starts_with("correlation:dependency_cascade:"));
        assert_eq!(d.condition_key(), format!("correlation:dependency_cascade:{}", obj.id));
        assert!(d.dedup_key(day).starts_with(&d.condition_key()));
    }
}
