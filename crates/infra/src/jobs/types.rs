//! Job-run records, lock keys and acquisition outcomes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use vantage_core::JobRunId;
use vantage_core::{DomainError, TenantId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Running => "running",
            JobRunStatus::Completed => "completed",
            JobRunStatus::Failed => "failed",
            JobRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobRunStatus::Running)
    }
}

impl std::str::FromStr for JobRunStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobRunStatus::Running),
            "completed" => Ok(JobRunStatus::Completed),
            "failed" => Ok(JobRunStatus::Failed),
            "cancelled" => Ok(JobRunStatus::Cancelled),
            other => Err(DomainError::validation(format!("unknown job status: {other}"))),
        }
    }
}

/// `function:tenant:grain_date[:entity_hash]`.
///
/// Components are non-empty and never contain `:`, so distinct inputs can
/// never collide on the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(String);

impl LockKey {
    pub fn build(
        function_name: &str,
        tenant_id: TenantId,
        grain_date: NaiveDate,
        entity_hash: Option<&str>,
    ) -> Result<Self, DomainError> {
        check_component("function_name", function_name)?;
        let mut key = format!("{function_name}:{tenant_id}:{grain_date}");
        if let Some(hash) = entity_hash {
            check_component("entity_hash", hash)?;
            key.push(':');
            key.push_str(hash);
        }
        Ok(Self(key))
    }

    /// Wrap a key read back from storage.
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn check_component(name: &str, value: &str) -> Result<(), DomainError> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{name} cannot be empty")));
    }
    if value.contains(':') {
        return Err(DomainError::validation(format!("{name} cannot contain ':'")));
    }
    Ok(())
}

/// One attempt at a logical unit of work. Never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobRunId,
    pub tenant_id: TenantId,
    pub function_name: String,
    pub lock_key: LockKey,
    pub status: JobRunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input_params: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl JobRun {
    pub fn start(
        tenant_id: TenantId,
        function_name: impl Into<String>,
        lock_key: LockKey,
        input_params: serde_json::Value,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobRunId::new(),
            tenant_id,
            function_name: function_name.into(),
            lock_key,
            status: JobRunStatus::Running,
            started_at,
            completed_at: None,
            input_params,
            result: None,
            error_message: None,
            retry_count: 0,
        }
    }
}

/// Optional parts of a lock request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquireOptions {
    /// Defaults to the clock's current UTC day.
    pub grain_date: Option<NaiveDate>,
    pub entity_hash: Option<String>,
    pub input_params: Option<serde_json::Value>,
}

impl AcquireOptions {
    pub fn with_grain_date(mut self, date: NaiveDate) -> Self {
        self.grain_date = Some(date);
        self
    }

    pub fn with_entity_hash(mut self, hash: impl Into<String>) -> Self {
        self.entity_hash = Some(hash.into());
        self
    }

    pub fn with_input_params(mut self, params: serde_json::Value) -> Self {
        self.input_params = Some(params);
        self
    }
}

/// Result of `acquire_lock`. Conflicts are values, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    Acquired { job: JobRun, lock_key: LockKey },
    AlreadyRunning { job_id: JobRunId, lock_key: LockKey },
    /// Lost the insert race (the store's uniqueness check rejected the row).
    LockFailed { lock_key: LockKey, reason: String },
}

impl LockOutcome {
    pub fn lock_key(&self) -> &LockKey {
        match self {
            LockOutcome::Acquired { lock_key, .. }
            | LockOutcome::AlreadyRunning { lock_key, .. }
            | LockOutcome::LockFailed { lock_key, .. } => lock_key,
        }
    }

    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired { .. })
    }
}

/// Per-tenant counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobStats {
    pub fn record(&mut self, status: JobRunStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobRunStatus, count: usize) {
        match status {
            JobRunStatus::Running => self.running += count,
            JobRunStatus::Completed => self.completed += count,
            JobRunStatus::Failed => self.failed += count,
            JobRunStatus::Cancelled => self.cancelled += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn lock_key_layout() {
        let tenant = TenantId::new();
        let key = LockKey::build("compute-kpi", tenant, day(), None).unwrap();
        assert_eq!(key.as_str(), format!("compute-kpi:{tenant}:2024-05-01"));

        let hashed = LockKey::build("compute-kpi", tenant, day(), Some("abc123")).unwrap();
        assert_eq!(hashed.as_str(), format!("compute-kpi:{tenant}:2024-05-01:abc123"));
    }

    #[test]
    fn lock_key_rejects_ambiguous_components() {
        let tenant = TenantId::new();
        assert!(LockKey::build("a:b", tenant, day(), None).is_err());
        assert!(LockKey::build("  ", tenant, day(), None).is_err());
        assert!(LockKey::build("f", tenant, day(), Some("x:y")).is_err());
        assert!(LockKey::build("f", tenant, day(), Some("")).is_err());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            JobRunStatus::Running,
            JobRunStatus::Completed,
            JobRunStatus::Failed,
            JobRunStatus::Cancelled,
        ] {
            assert_eq!(s.as_str().parse::<JobRunStatus>().unwrap(), s);
        }
        assert!(JobRunStatus::Failed.is_terminal());
        assert!(!JobRunStatus::Running.is_terminal());
    }
}
