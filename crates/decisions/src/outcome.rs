use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use vantage_core::{CardId, OutcomeId, TenantId};

/// Accuracy reported when there is no positive prediction to compare against.
pub const NEUTRAL_ACCURACY: f64 = 0.5;
/// Band around the prediction that still counts as a hit.
pub const TOLERANCE: f64 = 0.05;
/// Below this share of the prediction a positive result counts as failed.
pub const PARTIAL_FLOOR: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Actual impact not measurable yet. Never written to the ledger.
    Pending,
    Success,
    Partial,
    Failed,
    Exceeded,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Pending => "pending",
            OutcomeStatus::Success => "success",
            OutcomeStatus::Partial => "partial",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Exceeded => "exceeded",
        }
    }

    /// Counts toward the success rate.
    pub fn is_hit(&self) -> bool {
        matches!(self, OutcomeStatus::Success | OutcomeStatus::Exceeded)
    }
}

impl core::str::FromStr for OutcomeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OutcomeStatus::Pending),
            "success" => Ok(OutcomeStatus::Success),
            "partial" => Ok(OutcomeStatus::Partial),
            "failed" => Ok(OutcomeStatus::Failed),
            "exceeded" => Ok(OutcomeStatus::Exceeded),
            other => Err(format!("unknown outcome status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeScore {
    pub accuracy_score: f64,
    pub status: OutcomeStatus,
}

/// Score a decision's realized impact against its frozen prediction.
///
/// `actual = None` yields `Pending` with the neutral accuracy.
pub fn score_outcome(predicted: f64, actual: Option<f64>) -> OutcomeScore {
    let Some(actual) = actual.filter(|a| a.is_finite()) else {
        return OutcomeScore {
            accuracy_score: NEUTRAL_ACCURACY,
            status: OutcomeStatus::Pending,
        };
    };

    let accuracy_score = if predicted > 0.0 {
        (actual / predicted).min(1.0)
    } else {
        NEUTRAL_ACCURACY
    };

    let band = predicted.abs() * TOLERANCE;
    let status = if actual > predicted + band {
        OutcomeStatus::Exceeded
    } else if actual >= predicted - band {
        OutcomeStatus::Success
    } else if actual > 0.0 && actual >= predicted * PARTIAL_FLOOR {
        OutcomeStatus::Partial
    } else {
        OutcomeStatus::Failed
    };

    OutcomeScore {
        accuracy_score,
        status,
    }
}

/// Immutable ledger row. At most one per decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcomeRecord {
    pub id: OutcomeId,
    pub tenant_id: TenantId,
    pub decision_id: CardId,
    pub decision_type: String,
    pub evaluation_date: NaiveDate,
    pub predicted_impact: f64,
    pub actual_impact: f64,
    pub accuracy_score: f64,
    pub outcome_status: OutcomeStatus,
    pub created_at: DateTime<Utc>,
}

impl DecisionOutcomeRecord {
    pub fn variance(&self) -> f64 {
        self.actual_impact - self.predicted_impact
    }
}
