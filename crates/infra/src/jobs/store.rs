//! Job-run storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vantage_core::TenantId;

use super::types::{JobRun, JobRunId, JobRunStatus, JobStats, LockKey};

/// Terminal write applied to a running row.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFinish {
    pub status: JobRunStatus,
    pub completed_at: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: Option<u32>,
}

/// Durable job-run table.
///
/// The store, not the caller, guarantees at most one `running` row per lock
/// key: `insert_running` must fail with [`JobStoreError::LockHeld`] when one
/// already exists, atomically with the insert.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Fast-path lookup; not a guarantee.
    async fn find_running(&self, lock_key: &LockKey) -> Result<Option<JobRun>, JobStoreError>;

    async fn insert_running(&self, run: &JobRun) -> Result<(), JobStoreError>;

    /// Move a running row to a terminal state. Terminal rows are immutable.
    async fn finish(
        &self,
        tenant_id: TenantId,
        job_id: JobRunId,
        finish: JobFinish,
    ) -> Result<JobRun, JobStoreError>;

    async fn get(&self, tenant_id: TenantId, job_id: JobRunId) -> Result<Option<JobRun>, JobStoreError>;

    /// Most recent first.
    async fn list(
        &self,
        tenant_id: TenantId,
        status: Option<JobRunStatus>,
        limit: usize,
    ) -> Result<Vec<JobRun>, JobStoreError>;

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job run not found: {0}")]
    NotFound(JobRunId),

    #[error("job run {id} is already {status}", status = .status.as_str())]
    AlreadyTerminal { id: JobRunId, status: JobRunStatus },

    #[error("lock key is held by a running job: {0}")]
    LockHeld(LockKey),

    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn find_running(&self, lock_key: &LockKey) -> Result<Option<JobRun>, JobStoreError> {
        (**self).find_running(lock_key).await
    }

    async fn insert_running(&self, run: &JobRun) -> Result<(), JobStoreError> {
        (**self).insert_running(run).await
    }

    async fn finish(
        &self,
        tenant_id: TenantId,
        job_id: JobRunId,
        finish: JobFinish,
    ) -> Result<JobRun, JobStoreError> {
        (**self).finish(tenant_id, job_id, finish).await
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobRunId) -> Result<Option<JobRun>, JobStoreError> {
        (**self).get(tenant_id, job_id).await
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        status: Option<JobRunStatus>,
        limit: usize,
    ) -> Result<Vec<JobRun>, JobStoreError> {
        (**self).list(tenant_id, status, limit).await
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        (**self).stats(tenant_id).await
    }
}

/// In-memory job store for tests/dev.
///
/// The running-key check and the insert happen under one write lock, which
/// mirrors the partial unique index of the Postgres schema.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    runs: RwLock<HashMap<JobRunId, JobRun>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn find_running(&self, lock_key: &LockKey) -> Result<Option<JobRun>, JobStoreError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        Ok(runs
            .values()
            .find(|r| r.status == JobRunStatus::Running && &r.lock_key == lock_key)
            .cloned())
    }

    async fn insert_running(&self, run: &JobRun) -> Result<(), JobStoreError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        if runs
            .values()
            .any(|r| r.status == JobRunStatus::Running && r.lock_key == run.lock_key)
        {
            return Err(JobStoreError::LockHeld(run.lock_key.clone()));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn finish(
        &self,
        tenant_id: TenantId,
        job_id: JobRunId,
        finish: JobFinish,
    ) -> Result<JobRun, JobStoreError> {
        let mut runs = self.runs.write().map_err(|_| poisoned())?;
        let run = runs
            .get_mut(&job_id)
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        if run.status.is_terminal() {
            return Err(JobStoreError::AlreadyTerminal {
                id: job_id,
                status: run.status,
            });
        }

        run.status = finish.status;
        run.completed_at = Some(finish.completed_at);
        run.result = finish.result;
        run.error_message = finish.error_message;
        if let Some(retries) = finish.retry_count {
            run.retry_count = retries;
        }
        Ok(run.clone())
    }

    async fn get(&self, tenant_id: TenantId, job_id: JobRunId) -> Result<Option<JobRun>, JobStoreError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        Ok(runs.get(&job_id).filter(|r| r.tenant_id == tenant_id).cloned())
    }

    async fn list(
        &self,
        tenant_id: TenantId,
        status: Option<JobRunStatus>,
        limit: usize,
    ) -> Result<Vec<JobRun>, JobStoreError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        let mut out: Vec<JobRun> = runs
            .values()
            .filter(|r| r.tenant_id == tenant_id && status.is_none_or(|s| r.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        out.truncate(limit);
        Ok(out)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, JobStoreError> {
        let runs = self.runs.read().map_err(|_| poisoned())?;
        let mut stats = JobStats::default();
        for run in runs.values().filter(|r| r.tenant_id == tenant_id) {
            stats.record(run.status);
        }
        Ok(stats)
    }
}
