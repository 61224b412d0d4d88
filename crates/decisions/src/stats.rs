use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::outcome::{DecisionOutcomeRecord, OutcomeStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeBreakdown {
    pub total: usize,
    pub hits: usize,
    pub success_rate: f64,
    pub average_accuracy: f64,
}

/// Read-side trend statistics, reproducible from ledger rows alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeStats {
    pub total: usize,
    pub by_status: BTreeMap<OutcomeStatus, usize>,
    /// Share of records that met or beat the prediction.
    pub success_rate: f64,
    /// Mean of `actual - predicted`.
    pub average_variance: f64,
    pub average_accuracy: f64,
    pub by_decision_type: BTreeMap<String, TypeBreakdown>,
}

pub fn compute_stats(records: &[DecisionOutcomeRecord]) -> OutcomeStats {
    let scored: Vec<&DecisionOutcomeRecord> = records
        .iter()
        .filter(|r| r.outcome_status != OutcomeStatus::Pending)
        .collect();
    if scored.is_empty() {
        return OutcomeStats::default();
    }

    let total = scored.len();
    let n = total as f64;

    let mut by_status = BTreeMap::new();
    let mut by_type: BTreeMap<String, (usize, usize, f64)> = BTreeMap::new();
    let mut hits = 0usize;
    let mut variance_sum = 0.0;
    let mut accuracy_sum = 0.0;

    for r in &scored {
        *by_status.entry(r.outcome_status).or_insert(0) += 1;
        let hit = r.outcome_status.is_hit();
        if hit {
            hits += 1;
        }
        variance_sum += r.variance();
        accuracy_sum += r.accuracy_score;

        let entry = by_type.entry(r.decision_type.clone()).or_insert((0, 0, 0.0));
        entry.0 += 1;
        entry.1 += usize::from(hit);
        entry.2 += r.accuracy_score;
    }

    let by_decision_type = by_type
        .into_iter()
        .map(|(k, (count, type_hits, acc))| {
            (
                k,
                TypeBreakdown {
                    total: count,
                    hits: type_hits,
                    success_rate: type_hits as f64 / count as f64,
                    average_accuracy: acc / count as f64,
                },
            )
        })
        .collect();

    OutcomeStats {
        total,
        by_status,
        success_rate: hits as f64 / n,
        average_variance: variance_sum / n,
        average_accuracy: accuracy_sum / n,
        by_decision_type,
    }
}
