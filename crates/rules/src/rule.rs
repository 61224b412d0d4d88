use chrono::Duration;
use serde::{Deserialize, Serialize};

use vantage_core::{RuleId, TenantId, ThresholdId};

/// Alert severity. Ordering is ascending urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// How long an operator has to react before the alert is overdue.
    pub fn response_window(&self) -> Duration {
        match self {
            Severity::Critical => Duration::hours(24),
            Severity::Warning => Duration::hours(72),
            Severity::Info => Duration::days(7),
        }
    }
}

impl core::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "lte")]
    Le,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "gte")]
    Ge,
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
}

impl ComparisonOp {
    const EPSILON: f64 = 1e-9;

    pub fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            ComparisonOp::Lt => observed < threshold,
            ComparisonOp::Le => observed <= threshold,
            ComparisonOp::Gt => observed > threshold,
            ComparisonOp::Ge => observed >= threshold,
            ComparisonOp::Eq => (observed - threshold).abs() < Self::EPSILON,
            ComparisonOp::Ne => (observed - threshold).abs() >= Self::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOp::Lt => "<",
            ComparisonOp::Le => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::Ge => ">=",
            ComparisonOp::Eq => "==",
            ComparisonOp::Ne => "!=",
        }
    }
}

/// Literal threshold: `metric operator value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub id: ThresholdId,
    pub tenant_id: TenantId,
    pub metric: String,
    pub operator: ComparisonOp,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    pub severity: Severity,
    pub enabled: bool,
    /// Restrict to one object type; `None` applies to every object.
    #[serde(default)]
    pub object_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedTerm {
    pub metric: String,
    pub weight: f64,
}

/// Closed set of rule kinds.
///
/// Serialized as `{"threshold_type": "...", "threshold_config": {...}}`, so an
/// unknown `threshold_type` is rejected when the definition is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "threshold_type", content = "threshold_config", rename_all = "snake_case")]
pub enum RuleKind {
    Comparison {
        metric: String,
        operator: ComparisonOp,
        value: f64,
    },
    /// Breach when the metric leaves `[min, max]`.
    Band { metric: String, min: f64, max: f64 },
    WeightedScore {
        terms: Vec<WeightedTerm>,
        operator: ComparisonOp,
        value: f64,
    },
    /// Arithmetic expression over metric names, see [`crate::Formula`].
    Formula {
        expression: String,
        operator: ComparisonOp,
        value: f64,
    },
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::Comparison { .. } => "comparison",
            RuleKind::Band { .. } => "band",
            RuleKind::WeightedScore { .. } => "weighted_score",
            RuleKind::Formula { .. } => "formula",
        }
    }
}

/// Formula-driven detection rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntelligentRule {
    pub id: RuleId,
    pub tenant_id: TenantId,
    pub name: String,
    pub formula: RuleKind,
    pub severity: Severity,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    /// Lower runs first.
    pub priority: i32,
    pub enabled: bool,
    #[serde(default)]
    pub object_type: Option<String>,
}

impl IntelligentRule {
    pub fn applies_to(&self, object_type: &str) -> bool {
        self.object_type.as_deref().is_none_or(|t| t == object_type)
    }
}

impl ThresholdConfig {
    pub fn applies_to(&self, object_type: &str) -> bool {
        self.object_type.as_deref().is_none_or(|t| t == object_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_kind_uses_threshold_type_tag() {
        let json = serde_json::json!({
            "threshold_type": "comparison",
            "threshold_config": { "metric": "days_of_stock", "operator": "<", "value": 5.0 }
        });
        let kind: RuleKind = serde_json::from_value(json).unwrap();
        assert_eq!(
            kind,
            RuleKind::Comparison {
                metric: "days_of_stock".to_string(),
                operator: ComparisonOp::Lt,
                value: 5.0
            }
        );
    }

    #[test]
    fn unknown_threshold_type_fails_loudly() {
        let json = serde_json::json!({
            "threshold_type": "javascript",
            "threshold_config": { "source": "return true" }
        });
        assert!(serde_json::from_value::<RuleKind>(json).is_err());
    }

    #[test]
    fn comparison_ops() {
        assert!(ComparisonOp::Lt.holds(3.0, 5.0));
        assert!(!ComparisonOp::Lt.holds(5.0, 5.0));
        assert!(ComparisonOp::Le.holds(5.0, 5.0));
        assert!(ComparisonOp::Eq.holds(0.1 + 0.2, 0.3));
        assert!(ComparisonOp::Ne.holds(1.0, 2.0));
    }

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!("CRITICAL".parse::<Severity>().unwrap(), Severity::Critical);
    }
}
