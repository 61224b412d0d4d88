use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use vantage_core::ObjectId;

use crate::evaluate::{estimate_impact, AlertSource, Detection};
use crate::object::MonitoredObject;
use crate::rule::Severity;

/// Cross-object pattern evaluated after per-object rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum CorrelationRule {
    /// Several at-risk objects share one attribute value (same supplier,
    /// same warehouse). One group alert instead of N object alerts.
    SharedAttributeRisk {
        attribute: String,
        min_objects: usize,
        max_stockout_risk_days: f64,
        severity: Severity,
    },
    /// A healthy object that transitively depends on an at-risk one.
    DependencyCascade {
        max_stockout_risk_days: f64,
        severity: Severity,
    },
}

pub fn default_correlations() -> Vec<CorrelationRule> {
    vec![
        CorrelationRule::SharedAttributeRisk {
            attribute: "supplier".to_string(),
            min_objects: 3,
            max_stockout_risk_days: 0.0,
            severity: Severity::Critical,
        },
        CorrelationRule::DependencyCascade {
            max_stockout_risk_days: 0.0,
            severity: Severity::Warning,
        },
    ]
}

/// Run every correlation over one tenant's objects. Output order is stable
/// for a given input order.
pub fn run_correlations(objects: &[MonitoredObject], rules: &[CorrelationRule]) -> Vec<Detection> {
    let mut out = Vec::new();
    for rule in rules {
        match rule {
            CorrelationRule::SharedAttributeRisk {
                attribute,
                min_objects,
                max_stockout_risk_days,
                severity,
            } => out.extend(shared_attribute_risk(
                objects,
                attribute,
                *min_objects,
                *max_stockout_risk_days,
                *severity,
            )),
            CorrelationRule::DependencyCascade {
                max_stockout_risk_days,
                severity,
            } => out.extend(dependency_cascade(objects, *max_stockout_risk_days, *severity)),
        }
    }
    out
}

fn shared_attribute_risk(
    objects: &[MonitoredObject],
    attribute: &str,
    min_objects: usize,
    max_risk: f64,
    severity: Severity,
) -> Vec<Detection> {
    let mut groups: BTreeMap<&str, Vec<&MonitoredObject>> = BTreeMap::new();
    for obj in objects.iter().filter(|o| o.at_risk(max_risk)) {
        if let Some(value) = obj.attributes.get(attribute) {
            groups.entry(value.as_str()).or_default().push(obj);
        }
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() >= min_objects.max(1))
        .map(|(value, members)| {
            let names: Vec<&str> = members.iter().map(|o| o.external_id.as_str()).collect();
            Detection {
                source: AlertSource::Correlation(format!("shared_attribute_risk/{attribute}/{value}")),
                object_id: None,
                severity,
                title: format!("{} objects at risk sharing {attribute} {value}", members.len()),
                message: format!("At-risk objects with {attribute}={value}: {}", names.join(", ")),
                impact_amount: members.iter().map(|o| estimate_impact(o)).sum(),
                suggested_actions: vec![format!("Review {attribute} {value}")],
            }
        })
        .collect()
}

fn dependency_cascade(objects: &[MonitoredObject], max_risk: f64, severity: Severity) -> Vec<Detection> {
    let by_id: HashMap<ObjectId, &MonitoredObject> = objects.iter().map(|o| (o.id, o)).collect();

    let mut out = Vec::new();
    for obj in objects {
        if obj.depends_on.is_empty() || obj.at_risk(max_risk) {
            continue;
        }
        let Some(upstream) = first_at_risk_upstream(obj, &by_id, max_risk) else {
            continue;
        };
        out.push(Detection {
            source: AlertSource::Correlation("dependency_cascade".to_string()),
            object_id: Some(obj.id),
            severity,
            title: format!("{} depends on at-risk {}", obj.external_id, upstream.external_id),
            message: format!(
                "{} {} is healthy but its upstream {} {} is at risk of running out",
                obj.object_type, obj.external_id, upstream.object_type, upstream.external_id
            ),
            impact_amount: estimate_impact(upstream),
            suggested_actions: vec![format!("Secure supply of {}", upstream.external_id)],
        });
    }
    out
}

/// Breadth-first over `depends_on`; cycles are tolerated.
fn first_at_risk_upstream<'a>(
    start: &MonitoredObject,
    by_id: &HashMap<ObjectId, &'a MonitoredObject>,
    max_risk: f64,
) -> Option<&'a MonitoredObject> {
    let mut seen: HashSet<ObjectId> = HashSet::from([start.id]);
    let mut queue: VecDeque<ObjectId> = start.depends_on.iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let Some(node) = by_id.get(&id).copied() else { continue };
        if node.at_risk(max_risk) {
            return Some(node);
        }
        queue.extend(node.depends_on.iter().copied());
    }
    None
}
