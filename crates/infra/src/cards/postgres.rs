//! Postgres-backed card table.
//!
//! The aggregate is stored whole as JSONB in `state`; the scalar columns
//! beside it exist for filtering and for the partial unique index
//! `decision_cards_undecided_trigger (tenant_id, trigger_key)` over
//! OPEN/IN_PROGRESS/SNOOZED rows.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use vantage_core::{AggregateRoot, CardId, ExpectedVersion, TenantId};
use vantage_decisions::{CardStatus, DecisionCard};

use super::store::{CardStore, CardStoreError};
use crate::pg;

const TRIGGER_CONSTRAINT: &str = "decision_cards_undecided_trigger";

#[derive(Debug, Clone)]
pub struct PostgresCardStore {
    pool: Arc<PgPool>,
}

impl PostgresCardStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    async fn fetch_where(
        &self,
        operation: &str,
        predicate: &str,
        tenant_id: TenantId,
        at: Option<DateTime<Utc>>,
    ) -> Result<Vec<DecisionCard>, CardStoreError> {
        let sql = format!("SELECT state FROM decision_cards WHERE tenant_id = $1 AND {predicate} ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(at)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode).collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CardStoreError {
    if pg::is_unique_violation(&err) {
        return CardStoreError::Conflict(pg::describe(operation, &err));
    }
    CardStoreError::Storage(pg::describe(operation, &err))
}

fn encode(card: &DecisionCard) -> Result<serde_json::Value, CardStoreError> {
    serde_json::to_value(card).map_err(|e| CardStoreError::Storage(format!("failed to encode card: {e}")))
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<DecisionCard, CardStoreError> {
    let state: serde_json::Value = row
        .try_get("state")
        .map_err(|e| CardStoreError::Storage(format!("failed to read card row: {e}")))?;
    serde_json::from_value(state).map_err(|e| CardStoreError::Storage(format!("failed to decode card: {e}")))
}

#[async_trait]
impl CardStore for PostgresCardStore {
    #[instrument(skip(self, card), fields(card_id = %card.id()), err)]
    async fn insert(&self, card: &DecisionCard) -> Result<(), CardStoreError> {
        let tenant_id = card
            .tenant_id()
            .ok_or_else(|| CardStoreError::Conflict("card was never created".to_string()))?;
        let trigger_key = card.trigger().map(|t| t.key());

        let result = sqlx::query(
            r#"
            INSERT INTO decision_cards
                (id, tenant_id, status, priority, trigger_key, deadline_at, decided_at, resume_at, version, state)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(card.id().as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(card.status().as_str())
        .bind(card.priority().rank())
        .bind(&trigger_key)
        .bind(card.deadline_at())
        .bind(card.decision().map(|d| d.decided_at))
        .bind(card.snooze().map(|s| s.resume_at))
        .bind(card.version() as i64)
        .bind(encode(card)?)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if pg::violated_constraint(&e) == Some(TRIGGER_CONSTRAINT) => {
                Err(CardStoreError::DuplicateTrigger(trigger_key.unwrap_or_default()))
            }
            Err(e) => Err(map_sqlx_error("insert_card", e)),
        }
    }

    #[instrument(skip(self, card), fields(card_id = %card.id(), version = card.version()), err)]
    async fn save(&self, card: &DecisionCard, expected: ExpectedVersion) -> Result<(), CardStoreError> {
        let tenant_id = card.tenant_id().ok_or(CardStoreError::NotFound(*card.id()))?;
        let expected_version = match expected {
            ExpectedVersion::Any => None,
            ExpectedVersion::Exact(v) => Some(v as i64),
        };

        let updated = sqlx::query(
            r#"
            UPDATE decision_cards
            SET status = $3,
                priority = $4,
                deadline_at = $5,
                decided_at = $6,
                resume_at = $7,
                version = $8,
                state = $9,
                updated_at = now()
            WHERE tenant_id = $1 AND id = $2 AND ($10::bigint IS NULL OR version = $10)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(card.id().as_uuid())
        .bind(card.status().as_str())
        .bind(card.priority().rank())
        .bind(card.deadline_at())
        .bind(card.decision().map(|d| d.decided_at))
        .bind(card.snooze().map(|s| s.resume_at))
        .bind(card.version() as i64)
        .bind(encode(card)?)
        .bind(expected_version)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_card", e))?;

        if updated.rows_affected() == 1 {
            return Ok(());
        }
        match self.get(tenant_id, *card.id()).await? {
            Some(current) => Err(CardStoreError::Conflict(format!(
                "card {} is at version {}, expected {expected:?}",
                card.id(),
                current.version()
            ))),
            None => Err(CardStoreError::NotFound(*card.id())),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, card_id = %card_id), err)]
    async fn get(&self, tenant_id: TenantId, card_id: CardId) -> Result<Option<DecisionCard>, CardStoreError> {
        let row = sqlx::query("SELECT state FROM decision_cards WHERE tenant_id = $1 AND id = $2")
            .bind(tenant_id.as_uuid())
            .bind(card_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_card", e))?;
        row.as_ref().map(decode).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list(&self, tenant_id: TenantId, statuses: &[CardStatus]) -> Result<Vec<DecisionCard>, CardStoreError> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(
            r#"
            SELECT state FROM decision_cards
            WHERE tenant_id = $1 AND (cardinality($2::text[]) = 0 OR status = ANY($2))
            ORDER BY id
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(&statuses)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_cards", e))?;
        rows.iter().map(decode).collect()
    }

    async fn due_snoozed(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<Vec<DecisionCard>, CardStoreError> {
        self.fetch_where("due_snoozed", "status = 'SNOOZED' AND resume_at <= $2", tenant_id, Some(now))
            .await
    }

    async fn decided_before(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DecisionCard>, CardStoreError> {
        self.fetch_where("decided_before", "status = 'DECIDED' AND decided_at <= $2", tenant_id, Some(cutoff))
            .await
    }
}
