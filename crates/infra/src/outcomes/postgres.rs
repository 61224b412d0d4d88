use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use vantage_core::{CardId, OutcomeId, TenantId};
use vantage_decisions::{DecisionOutcomeRecord, OutcomeStatus};

use super::store::{ImpactError, ImpactSource, LedgerError, OutcomeLedger};
use crate::pg;

const COLUMNS: &str = "id, tenant_id, decision_id, decision_type, evaluation_date, predicted_impact, \
                       actual_impact, accuracy_score, outcome_status, created_at";

/// `decision_outcomes` table. Rows are only ever inserted.
#[derive(Debug, Clone)]
pub struct PostgresOutcomeLedger {
    pool: Arc<PgPool>,
}

impl PostgresOutcomeLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(pg::describe(operation, &err))
}

#[async_trait]
impl OutcomeLedger for PostgresOutcomeLedger {
    #[instrument(skip(self, record), fields(tenant_id = %record.tenant_id, decision_id = %record.decision_id), err)]
    async fn append(&self, record: &DecisionOutcomeRecord) -> Result<(), LedgerError> {
        let sql = format!(
            "INSERT INTO decision_outcomes ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        );
        sqlx::query(&sql)
            .bind(record.id.as_uuid())
            .bind(record.tenant_id.as_uuid())
            .bind(record.decision_id.as_uuid())
            .bind(&record.decision_type)
            .bind(record.evaluation_date)
            .bind(record.predicted_impact)
            .bind(record.actual_impact)
            .bind(record.accuracy_score)
            .bind(record.outcome_status.as_str())
            .bind(record.created_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if pg::is_unique_violation(&e) {
                    LedgerError::AlreadyRecorded(record.decision_id)
                } else {
                    map_sqlx_error("append", e)
                }
            })?;
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list(&self, tenant_id: TenantId) -> Result<Vec<DecisionOutcomeRecord>, LedgerError> {
        let sql = format!("SELECT {COLUMNS} FROM decision_outcomes WHERE tenant_id = $1 ORDER BY created_at, id");
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn evaluated(&self, tenant_id: TenantId) -> Result<HashSet<CardId>, LedgerError> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar("SELECT decision_id FROM decision_outcomes WHERE tenant_id = $1")
            .bind(tenant_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("evaluated", e))?;
        Ok(ids.into_iter().map(CardId::from_uuid).collect())
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<DecisionOutcomeRecord, LedgerError> {
    let read = |e: sqlx::Error| LedgerError::Storage(format!("failed to decode decision_outcomes row: {e}"));
    let status: String = row.try_get("outcome_status").map_err(read)?;

    Ok(DecisionOutcomeRecord {
        id: OutcomeId::from_uuid(row.try_get("id").map_err(read)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(read)?),
        decision_id: CardId::from_uuid(row.try_get("decision_id").map_err(read)?),
        decision_type: row.try_get("decision_type").map_err(read)?,
        evaluation_date: row.try_get("evaluation_date").map_err(read)?,
        predicted_impact: row.try_get("predicted_impact").map_err(read)?,
        actual_impact: row.try_get("actual_impact").map_err(read)?,
        accuracy_score: row.try_get("accuracy_score").map_err(read)?,
        outcome_status: status.parse::<OutcomeStatus>().map_err(LedgerError::Storage)?,
        created_at: row.try_get("created_at").map_err(read)?,
    })
}

/// Reads the latest measurement from `decision_impact_measurements`, which
/// the analytics side fills in once a decision's effect is observable.
#[derive(Debug, Clone)]
pub struct PostgresImpactSource {
    pool: Arc<PgPool>,
}

impl PostgresImpactSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

#[async_trait]
impl ImpactSource for PostgresImpactSource {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, decision_id = %decision_id), err)]
    async fn actual_impact(&self, tenant_id: TenantId, decision_id: CardId) -> Result<Option<f64>, ImpactError> {
        sqlx::query_scalar(
            r#"
            SELECT actual_impact
            FROM decision_impact_measurements
            WHERE tenant_id = $1 AND decision_id = $2
            ORDER BY measured_at DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(decision_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| ImpactError(pg::describe("actual_impact", &e)))
    }
}
