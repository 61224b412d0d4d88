//! Scores decided cards once their evaluation window has passed and appends
//! the result to the outcome ledger.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use vantage_core::{AggregateRoot, CardId, Clock, OutcomeId, TenantId};
use vantage_decisions::{compute_stats, score_outcome, DecisionOutcomeRecord, OutcomeStats, OutcomeStatus};

use super::store::{ImpactSource, LedgerError, OutcomeLedger};
use crate::cards::{CardStore, CardStoreError};
use crate::jobs::{AcquireOptions, ExclusiveRun, JobRegistry, RegistryError};

pub const DEFAULT_EVALUATION_WINDOW_DAYS: u32 = 30;

/// Job registry function name for outcome evaluation runs.
pub const EVALUATION_FUNCTION: &str = "evaluate-outcomes";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OutcomeError {
    #[error(transparent)]
    Cards(#[from] CardStoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredDecision {
    pub decision_id: CardId,
    pub decision_type: String,
    pub predicted_impact: f64,
    pub actual_impact: Option<f64>,
    pub accuracy_score: f64,
    pub outcome_status: OutcomeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationFailure {
    pub decision_id: CardId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationReport {
    pub tenant_id: TenantId,
    pub window_days: u32,
    pub cutoff: DateTime<Utc>,
    /// Decided cards old enough to score and not yet in the ledger.
    pub candidates: usize,
    /// Newly appended to the ledger.
    pub recorded: usize,
    /// Scored outcomes, pending ones included. Pending ones are not stored.
    pub outcomes: Vec<ScoredDecision>,
    pub errors: Vec<EvaluationFailure>,
}

impl EvaluationReport {
    pub fn pending(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.outcome_status == OutcomeStatus::Pending)
            .count()
    }
}

#[derive(Clone)]
pub struct OutcomeEvaluator {
    cards: Arc<dyn CardStore>,
    ledger: Arc<dyn OutcomeLedger>,
    impacts: Arc<dyn ImpactSource>,
    clock: Arc<dyn Clock>,
}

impl OutcomeEvaluator {
    pub fn new(
        cards: Arc<dyn CardStore>,
        ledger: Arc<dyn OutcomeLedger>,
        impacts: Arc<dyn ImpactSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cards,
            ledger,
            impacts,
            clock,
        }
    }

    /// [`OutcomeEvaluator::evaluate`] under the `evaluate-outcomes` job lock,
    /// one per tenant and day.
    pub async fn evaluate_exclusive(
        &self,
        registry: &JobRegistry,
        tenant_id: TenantId,
        window_days: u32,
    ) -> Result<ExclusiveRun<EvaluationReport>, OutcomeError> {
        let opts = AcquireOptions::default().with_grain_date(self.clock.today());
        registry
            .with_idempotency(EVALUATION_FUNCTION, tenant_id, opts, |_job| self.evaluate(tenant_id, window_days))
            .await?
            .into_exclusive()
    }

    /// Evaluate every decision older than `window_days`.
    ///
    /// Running twice never writes a second record for the same decision.
    /// Measurement failures are reported per decision; store failures abort.
    pub async fn evaluate(&self, tenant_id: TenantId, window_days: u32) -> Result<EvaluationReport, OutcomeError> {
        let now = self.clock.now();
        let cutoff = now - Duration::days(i64::from(window_days));

        let evaluated = self.ledger.evaluated(tenant_id).await?;
        let candidates: Vec<_> = self
            .cards
            .decided_before(tenant_id, cutoff)
            .await?
            .into_iter()
            .filter(|card| !evaluated.contains(card.id()))
            .collect();

        let mut report = EvaluationReport {
            tenant_id,
            window_days,
            cutoff,
            candidates: candidates.len(),
            recorded: 0,
            outcomes: Vec::with_capacity(candidates.len()),
            errors: Vec::new(),
        };

        for card in candidates {
            let Some(decision) = card.decision() else {
                continue;
            };
            let decision_id = *card.id();

            let actual = match self.impacts.actual_impact(tenant_id, decision_id).await {
                Ok(actual) => actual,
                Err(e) => {
                    warn!(tenant = %tenant_id, decision = %decision_id, error = %e, "impact measurement failed");
                    report.errors.push(EvaluationFailure {
                        decision_id,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            let score = score_outcome(decision.predicted_impact, actual);
            report.outcomes.push(ScoredDecision {
                decision_id,
                decision_type: decision.action_type.clone(),
                predicted_impact: decision.predicted_impact,
                actual_impact: actual,
                accuracy_score: score.accuracy_score,
                outcome_status: score.status,
            });

            let Some(actual_impact) = actual.filter(|_| score.status != OutcomeStatus::Pending) else {
                continue;
            };

            let record = DecisionOutcomeRecord {
                id: OutcomeId::new(),
                tenant_id,
                decision_id,
                decision_type: decision.action_type.clone(),
                evaluation_date: now.date_naive(),
                predicted_impact: decision.predicted_impact,
                actual_impact,
                accuracy_score: score.accuracy_score,
                outcome_status: score.status,
                created_at: now,
            };
            match self.ledger.append(&record).await {
                Ok(()) => report.recorded += 1,
                // A concurrent evaluation got there first.
                Err(LedgerError::AlreadyRecorded(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(
            tenant = %tenant_id,
            candidates = report.candidates,
            recorded = report.recorded,
            pending = report.pending(),
            errors = report.errors.len(),
            "outcome evaluation finished"
        );
        Ok(report)
    }

    pub async fn stats(&self, tenant_id: TenantId) -> Result<OutcomeStats, OutcomeError> {
        let records = self.ledger.list(tenant_id).await?;
        Ok(compute_stats(&records))
    }

    pub async fn records(&self, tenant_id: TenantId) -> Result<Vec<DecisionOutcomeRecord>, OutcomeError> {
        Ok(self.ledger.list(tenant_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;
    use vantage_core::FixedClock;
    use vantage_decisions::{CardTrigger, Priority};

    use super::*;
    use crate::cards::{CardService, InMemoryCardStore, NewCard};
    use crate::jobs::{InMemoryJobStore, JobRunStatus, LockOutcome};
    use crate::outcomes::store::{ImpactError, InMemoryOutcomeLedger, StaticImpactSource};

    struct Fixture {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryCardStore>,
        cards: CardService,
        ledger: Arc<InMemoryOutcomeLedger>,
        impacts: Arc<StaticImpactSource>,
        evaluator: OutcomeEvaluator,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()));
        let store = InMemoryCardStore::arc();
        let ledger = InMemoryOutcomeLedger::arc();
        let impacts = StaticImpactSource::arc();
        Fixture {
            cards: CardService::new(store.clone(), clock.clone()),
            evaluator: OutcomeEvaluator::new(store.clone(), ledger.clone(), impacts.clone(), clock.clone()),
            store,
            clock,
            ledger,
            impacts,
        }
    }

    async fn decided_card(f: &Fixture, tenant: TenantId, predicted: f64, action: &str) -> CardId {
        let card = f
            .cards
            .open_card(
                tenant,
                NewCard {
                    title: format!("{action} candidate"),
                    priority: Priority::P2,
                    deadline_at: None,
                    predicted_impact: predicted,
                    trigger: CardTrigger::Insight(CardId::new().to_string()),
                },
            )
            .await
            .unwrap();
        f.cards.decide(tenant, *card.id(), action, None).await.unwrap();
        *card.id()
    }

    #[tokio::test]
    async fn scores_decisions_past_the_window() {
        let f = fixture();
        let tenant = TenantId::new();
        let card = decided_card(&f, tenant, 100.0, "reorder").await;
        f.impacts.set(tenant, card, 102.0);

        f.clock.advance(Duration::days(31));
        let report = f.evaluator.evaluate(tenant, 30).await.unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.recorded, 1);
        let record = &f.ledger.list(tenant).await.unwrap()[0];
        assert_eq!(record.outcome_status, OutcomeStatus::Success);
        assert!((record.accuracy_score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn overlapping_evaluation_is_turned_away() {
        let f = fixture();
        let registry = JobRegistry::new(InMemoryJobStore::arc(), f.clock.clone());
        let tenant = TenantId::new();
        let card = decided_card(&f, tenant, 100.0, "reorder").await;
        f.impacts.set(tenant, card, 100.0);
        f.clock.advance(Duration::days(31));

        let held = registry
            .acquire_lock(
                EVALUATION_FUNCTION,
                tenant,
                AcquireOptions::default().with_grain_date(f.clock.today()),
            )
            .await
            .unwrap();
        let LockOutcome::Acquired { job, .. } = held else {
            panic!("expected to acquire");
        };

        let outcome = f.evaluator.evaluate_exclusive(&registry, tenant, 30).await.unwrap();
        assert!(matches!(outcome, ExclusiveRun::AlreadyRunning { job_id, .. } if job_id == job.id));
        assert!(f.ledger.list(tenant).await.unwrap().is_empty());

        registry.complete_job(tenant, job.id, None).await.unwrap();
        let ExclusiveRun::Ran { job_id, value } = f.evaluator.evaluate_exclusive(&registry, tenant, 30).await.unwrap()
        else {
            panic!("expected the evaluation to run");
        };
        assert_eq!(value.recorded, 1);
        let run = registry.get_job(tenant, job_id).await.unwrap();
        assert_eq!(run.status, JobRunStatus::Completed);
        assert_eq!(run.function_name, EVALUATION_FUNCTION);
    }

    #[tokio::test]
    async fn recent_decisions_wait_for_the_window() {
        let f = fixture();
        let tenant = TenantId::new();
        let card = decided_card(&f, tenant, 100.0, "reorder").await;
        f.impacts.set(tenant, card, 100.0);

        f.clock.advance(Duration::days(10));
        let report = f.evaluator.evaluate(tenant, 30).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert!(f.ledger.list(tenant).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_run_records_nothing_new() {
        let f = fixture();
        let tenant = TenantId::new();
        let card = decided_card(&f, tenant, 50.0, "markdown").await;
        f.impacts.set(tenant, card, 20.0);
        f.clock.advance(Duration::days(31));

        let first = f.evaluator.evaluate(tenant, 30).await.unwrap();
        let second = f.evaluator.evaluate(tenant, 30).await.unwrap();

        assert_eq!(first.recorded, 1);
        assert_eq!(second.candidates, 0);
        assert_eq!(second.recorded, 0);
        assert_eq!(f.ledger.list(tenant).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unmeasured_impact_is_reported_pending_and_retried_later() {
        let f = fixture();
        let tenant = TenantId::new();
        let card = decided_card(&f, tenant, 80.0, "reorder").await;
        f.clock.advance(Duration::days(31));

        let report = f.evaluator.evaluate(tenant, 30).await.unwrap();
        assert_eq!(report.pending(), 1);
        assert_eq!(report.recorded, 0);
        assert!(f.ledger.list(tenant).await.unwrap().is_empty());

        f.impacts.set(tenant, card, 10.0);
        let report = f.evaluator.evaluate(tenant, 30).await.unwrap();
        assert_eq!(report.recorded, 1);
        assert_eq!(report.outcomes[0].outcome_status, OutcomeStatus::Failed);
    }

    struct BrokenImpacts;

    #[async_trait]
    impl ImpactSource for BrokenImpacts {
        async fn actual_impact(&self, _: TenantId, _: CardId) -> Result<Option<f64>, ImpactError> {
            Err(ImpactError("warehouse offline".into()))
        }
    }

    #[tokio::test]
    async fn measurement_failure_is_reported_per_decision() {
        let f = fixture();
        let tenant = TenantId::new();
        let card = decided_card(&f, tenant, 80.0, "reorder").await;
        f.clock.advance(Duration::days(31));

        let evaluator = OutcomeEvaluator::new(f.store.clone(), f.ledger.clone(), Arc::new(BrokenImpacts), f.clock.clone());
        let report = evaluator.evaluate(tenant, 30).await.unwrap();

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].decision_id, card);
        assert!(f.ledger.list(tenant).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_come_from_ledger_rows() {
        let f = fixture();
        let tenant = TenantId::new();
        let hit = decided_card(&f, tenant, 100.0, "reorder").await;
        let miss = decided_card(&f, tenant, 100.0, "markdown").await;
        f.impacts.set(tenant, hit, 120.0);
        f.impacts.set(tenant, miss, 10.0);
        f.clock.advance(Duration::days(31));
        f.evaluator.evaluate(tenant, 30).await.unwrap();

        let stats = f.evaluator.stats(tenant).await.unwrap();
        assert_eq!(stats.total, 2);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
        assert!((stats.average_variance - (20.0 - 90.0) / 2.0).abs() < 1e-9);
        assert_eq!(stats.by_decision_type.len(), 2);
    }
}
