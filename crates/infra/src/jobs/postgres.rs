//! Postgres-backed job-run table.
//!
//! Single-writer execution rests on the partial unique index
//! `job_runs_running_lock_key (lock_key) WHERE status = 'running'`. An insert
//! that trips it maps to [`JobStoreError::LockHeld`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use vantage_core::TenantId;

use super::store::{JobFinish, JobStore, JobStoreError};
use super::types::{JobRun, JobRunId, JobRunStatus, JobStats, LockKey};
use crate::pg;

const COLUMNS: &str = "id, tenant_id, function_name, lock_key, status, started_at, completed_at, \
                       input_params, result, error_message, retry_count";

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(pg::describe(operation, &err))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, lock_key), fields(lock_key = %lock_key), err)]
    async fn find_running(&self, lock_key: &LockKey) -> Result<Option<JobRun>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM job_runs WHERE lock_key = $1 AND status = 'running' LIMIT 1");
        let row = sqlx::query(&sql)
            .bind(lock_key.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_running", e))?;
        row.map(|r| decode(&r)).transpose()
    }

    #[instrument(skip(self, run), fields(tenant_id = %run.tenant_id, job_id = %run.id), err)]
    async fn insert_running(&self, run: &JobRun) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_runs
                (id, tenant_id, function_name, lock_key, status, started_at, input_params, retry_count)
            VALUES ($1, $2, $3, $4, 'running', $5, $6, $7)
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.tenant_id.as_uuid())
        .bind(&run.function_name)
        .bind(run.lock_key.as_str())
        .bind(run.started_at)
        .bind(&run.input_params)
        .bind(run.retry_count as i32)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if pg::is_unique_violation(&e) => Err(JobStoreError::LockHeld(run.lock_key.clone())),
            Err(e) => Err(map_sqlx_error("insert_running", e)),
        }
    }

    #[instrument(skip(self, finish), fields(tenant_id = %tenant_id, job_id = %job_id, status = finish.status.as_str()), err)]
    async fn finish(
        &self,
        tenant_id: TenantId,
        job_id: JobRunId,
        finish: JobFinish,
    ) -> Result<JobRun, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE job_runs
            SET status = $3,
                completed_at = $4,
                result = $5,
                error_message = $6,
                retry_count = COALESCE($7, retry_count)
            WHERE tenant_id = $1 AND id = $2 AND status = 'running'
            RETURNING {COLUMNS}
            "#
        );
        let updated = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(job_id.as_uuid())
            .bind(finish.status.as_str())
            .bind(finish.completed_at)
            .bind(&finish.result)
            .bind(&finish.error_message)
            .bind(finish.retry_count.map(|n| n as i32))
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("finish", e))?;

        if let Some(row) = updated {
            return decode(&row);
        }

        // Nothing updated: either the row is missing or it is already terminal.
        match self.get(tenant_id, job_id).await? {
            Some(existing) => Err(JobStoreError::AlreadyTerminal {
                id: job_id,
                status: existing.status,
            }),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, job_id = %job_id), err)]
    async fn get(&self, tenant_id: TenantId, job_id: JobRunId) -> Result<Option<JobRun>, JobStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM job_runs WHERE tenant_id = $1 AND id = $2");
        let row = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| decode(&r)).transpose()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list(
        &self,
        tenant_id: TenantId,
        status: Option<JobRunStatus>,
        limit: usize,
    ) -> Result<Vec<JobRun>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {COLUMNS} FROM job_runs
            WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY started_at DESC, id DESC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(tenant_id.as_uuid())
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list", e))?;
        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM job_runs WHERE tenant_id = $1 GROUP BY status")
            .bind(tenant_id.as_uuid())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status: JobRunStatus = status
                .parse()
                .map_err(|e: vantage_core::DomainError| JobStoreError::Storage(e.to_string()))?;
            stats.add(status, n.max(0) as usize);
        }
        Ok(stats)
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<JobRun, JobStoreError> {
    let read = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job_runs row: {e}"));

    let status: String = row.try_get("status").map_err(read)?;
    let status = status
        .parse()
        .map_err(|e: vantage_core::DomainError| JobStoreError::Storage(e.to_string()))?;
    let retry_count: i32 = row.try_get("retry_count").map_err(read)?;
    let completed_at: Option<DateTime<Utc>> = row.try_get("completed_at").map_err(read)?;

    Ok(JobRun {
        id: JobRunId::from_uuid(row.try_get("id").map_err(read)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(read)?),
        function_name: row.try_get("function_name").map_err(read)?,
        lock_key: LockKey::from_stored(row.try_get("lock_key").map_err(read)?),
        status,
        started_at: row.try_get("started_at").map_err(read)?,
        completed_at,
        input_params: row.try_get("input_params").map_err(read)?,
        result: row.try_get("result").map_err(read)?,
        error_message: row.try_get("error_message").map_err(read)?,
        retry_count: retry_count.max(0) as u32,
    })
}
