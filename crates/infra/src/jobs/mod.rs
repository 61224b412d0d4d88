//! Lock & job registry.
//!
//! A durable audit trail of job attempts that doubles as the mutual-exclusion
//! primitive for every periodic computation:
//!
//! - `JobRun`: one attempt, created `running`, finished exactly once
//! - `LockKey`: `function:tenant:grain_date[:entity_hash]`
//! - `JobStore`: persistence with a unique running key (in-memory or Postgres)
//! - `JobRegistry`: acquire / complete / fail / cancel / `with_idempotency`

pub mod postgres;
pub mod registry;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use registry::{ExclusiveRun, IdempotentOutcome, JobRegistry, RegistryError};
pub use store::{InMemoryJobStore, JobFinish, JobStore, JobStoreError};
pub use types::{AcquireOptions, JobRun, JobRunId, JobRunStatus, JobStats, LockKey, LockOutcome};
