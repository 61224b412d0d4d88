//! Single-writer job registry.
//!
//! Every logical unit of work maps to a [`LockKey`]. `acquire_lock` does a
//! fast-path read for an existing running row and then inserts; the store's
//! uniqueness constraint on running keys decides the race, the read never does.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use vantage_core::{Clock, DomainError, TenantId};

use super::store::{JobFinish, JobStore, JobStoreError};
use super::types::{AcquireOptions, JobRun, JobRunId, JobRunStatus, JobStats, LockKey, LockOutcome};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Invalid(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// What `with_idempotency` did with the caller's work.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotentOutcome<T, E> {
    /// The work ran and the job was completed with its serialized result.
    Completed {
        job_id: JobRunId,
        lock_key: LockKey,
        value: T,
    },
    /// The work ran and returned an error; the job was marked failed.
    Failed {
        job_id: JobRunId,
        lock_key: LockKey,
        error: E,
    },
    /// Another invocation holds the key. The work was not called.
    AlreadyRunning { job_id: JobRunId, lock_key: LockKey },
    /// Lost the insert race. The work was not called.
    LockFailed { lock_key: LockKey, reason: String },
}

impl<T, E> IdempotentOutcome<T, E> {
    /// Collapse into an [`ExclusiveRun`], handing a failed run's error back
    /// to the caller. The job row already records the failure.
    pub fn into_exclusive(self) -> Result<ExclusiveRun<T>, E> {
        match self {
            IdempotentOutcome::Completed { job_id, value, .. } => Ok(ExclusiveRun::Ran { job_id, value }),
            IdempotentOutcome::Failed { error, .. } => Err(error),
            IdempotentOutcome::AlreadyRunning { job_id, lock_key } => {
                Ok(ExclusiveRun::AlreadyRunning { job_id, lock_key })
            }
            IdempotentOutcome::LockFailed { lock_key, reason } => Ok(ExclusiveRun::LockFailed { lock_key, reason }),
        }
    }
}

/// A periodic computation run under its job lock.
#[derive(Debug, Clone, PartialEq)]
pub enum ExclusiveRun<T> {
    Ran { job_id: JobRunId, value: T },
    AlreadyRunning { job_id: JobRunId, lock_key: LockKey },
    LockFailed { lock_key: LockKey, reason: String },
}

#[derive(Clone)]
pub struct JobRegistry {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn acquire_lock(
        &self,
        function_name: &str,
        tenant_id: TenantId,
        opts: AcquireOptions,
    ) -> Result<LockOutcome, RegistryError> {
        let now = self.clock.now();
        let grain_date = opts.grain_date.unwrap_or_else(|| now.date_naive());
        let lock_key = LockKey::build(function_name, tenant_id, grain_date, opts.entity_hash.as_deref())?;

        if let Some(existing) = self.store.find_running(&lock_key).await? {
            debug!(lock_key = %lock_key, job_id = %existing.id, "job already running");
            return Ok(LockOutcome::AlreadyRunning {
                job_id: existing.id,
                lock_key,
            });
        }

        let params = opts.input_params.unwrap_or_else(|| serde_json::json!({}));
        let job = JobRun::start(tenant_id, function_name, lock_key.clone(), params, now);

        match self.store.insert_running(&job).await {
            Ok(()) => {
                info!(tenant = %tenant_id, job_id = %job.id, lock_key = %lock_key, "lock acquired");
                Ok(LockOutcome::Acquired { job, lock_key })
            }
            Err(JobStoreError::LockHeld(_)) => {
                warn!(tenant = %tenant_id, lock_key = %lock_key, "lost lock acquisition race");
                Ok(LockOutcome::LockFailed {
                    reason: format!("another invocation acquired {lock_key} concurrently"),
                    lock_key,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn complete_job(
        &self,
        tenant_id: TenantId,
        job_id: JobRunId,
        result: Option<serde_json::Value>,
    ) -> Result<JobRun, RegistryError> {
        let finish = JobFinish {
            status: JobRunStatus::Completed,
            completed_at: self.clock.now(),
            result,
            error_message: None,
            retry_count: None,
        };
        let run = self.store.finish(tenant_id, job_id, finish).await?;
        info!(tenant = %tenant_id, job_id = %job_id, "job completed");
        Ok(run)
    }

    pub async fn fail_job(
        &self,
        tenant_id: TenantId,
        job_id: JobRunId,
        error_message: impl Into<String>,
        retry_count: Option<u32>,
    ) -> Result<JobRun, RegistryError> {
        let error_message = error_message.into();
        warn!(tenant = %tenant_id, job_id = %job_id, error = %error_message, "job failed");
        let finish = JobFinish {
            status: JobRunStatus::Failed,
            completed_at: self.clock.now(),
            result: None,
            error_message: Some(error_message),
            retry_count,
        };
        Ok(self.store.finish(tenant_id, job_id, finish).await?)
    }

    pub async fn cancel_job(
        &self,
        tenant_id: TenantId,
        job_id: JobRunId,
        reason: impl Into<String>,
    ) -> Result<JobRun, RegistryError> {
        let finish = JobFinish {
            status: JobRunStatus::Cancelled,
            completed_at: self.clock.now(),
            result: None,
            error_message: Some(reason.into()),
            retry_count: None,
        };
        let run = self.store.finish(tenant_id, job_id, finish).await?;
        info!(tenant = %tenant_id, job_id = %job_id, "job cancelled");
        Ok(run)
    }

    /// Run `work` at most once per lock key at a time.
    ///
    /// The job is completed with the serialized value or failed with the
    /// error's message; the error itself is handed back in
    /// [`IdempotentOutcome::Failed`].
    pub async fn with_idempotency<T, E, F, Fut>(
        &self,
        function_name: &str,
        tenant_id: TenantId,
        opts: AcquireOptions,
        work: F,
    ) -> Result<IdempotentOutcome<T, E>, RegistryError>
    where
        T: Serialize,
        E: std::fmt::Display,
        F: FnOnce(JobRun) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let (job, lock_key) = match self.acquire_lock(function_name, tenant_id, opts).await? {
            LockOutcome::Acquired { job, lock_key } => (job, lock_key),
            LockOutcome::AlreadyRunning { job_id, lock_key } => {
                return Ok(IdempotentOutcome::AlreadyRunning { job_id, lock_key });
            }
            LockOutcome::LockFailed { lock_key, reason } => {
                return Ok(IdempotentOutcome::LockFailed { lock_key, reason });
            }
        };
        let job_id = job.id;

        match work(job).await {
            Ok(value) => {
                let result = match serde_json::to_value(&value) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        warn!(job_id = %job_id, error = %e, "job result is not serializable");
                        None
                    }
                };
                self.complete_job(tenant_id, job_id, result).await?;
                Ok(IdempotentOutcome::Completed {
                    job_id,
                    lock_key,
                    value,
                })
            }
            Err(error) => {
                self.fail_job(tenant_id, job_id, error.to_string(), None).await?;
                Ok(IdempotentOutcome::Failed {
                    job_id,
                    lock_key,
                    error,
                })
            }
        }
    }

    pub async fn get_job(&self, tenant_id: TenantId, job_id: JobRunId) -> Result<JobRun, RegistryError> {
        self.store
            .get(tenant_id, job_id)
            .await?
            .ok_or(RegistryError::Store(JobStoreError::NotFound(job_id)))
    }

    pub async fn list_jobs(
        &self,
        tenant_id: TenantId,
        status: Option<JobRunStatus>,
        limit: usize,
    ) -> Result<Vec<JobRun>, RegistryError> {
        Ok(self.store.list(tenant_id, status, limit).await?)
    }

    pub async fn stats(&self, tenant_id: TenantId) -> Result<JobStats, RegistryError> {
        Ok(self.store.stats(tenant_id).await?)
    }
}
