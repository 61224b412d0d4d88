//! Store-side computation services the pipeline sequences.
//!
//! The aggregation formulas live in stored procedures owned by the analytics
//! schema; this crate only knows their contracts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::instrument;

use vantage_core::TenantId;

use super::chunking::DateChunk;
use crate::pg;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcedureError {
    /// The procedure ran and reported a failure. Recorded, never fatal.
    #[error("procedure failed: {0}")]
    Failed(String),

    /// The store could not be reached. Aborts the run.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
    pub linked_customers: i64,
    pub unlinked_customers: i64,
    pub fact_rows: i64,
    pub daily_aggregates: i64,
    pub active_alerts: i64,
}

#[async_trait]
pub trait PipelineProcedures: Send + Sync {
    /// Link up to `batch_size` unlinked customer records. Returns rows linked.
    async fn link_batch(&self, tenant_id: TenantId, batch_size: u32) -> Result<u64, ProcedureError>;

    /// Compute facts for one window. Returns rows written.
    async fn compute_facts(&self, tenant_id: TenantId, chunk: &DateChunk) -> Result<u64, ProcedureError>;

    async fn build_daily_aggregates(&self, tenant_id: TenantId, date: NaiveDate) -> Result<u64, ProcedureError>;

    async fn summary_counts(&self, tenant_id: TenantId) -> Result<SummaryCounts, ProcedureError>;
}

#[async_trait]
impl<P> PipelineProcedures for Arc<P>
where
    P: PipelineProcedures + ?Sized,
{
    async fn link_batch(&self, tenant_id: TenantId, batch_size: u32) -> Result<u64, ProcedureError> {
        (**self).link_batch(tenant_id, batch_size).await
    }

    async fn compute_facts(&self, tenant_id: TenantId, chunk: &DateChunk) -> Result<u64, ProcedureError> {
        (**self).compute_facts(tenant_id, chunk).await
    }

    async fn build_daily_aggregates(&self, tenant_id: TenantId, date: NaiveDate) -> Result<u64, ProcedureError> {
        (**self).build_daily_aggregates(tenant_id, date).await
    }

    async fn summary_counts(&self, tenant_id: TenantId) -> Result<SummaryCounts, ProcedureError> {
        (**self).summary_counts(tenant_id).await
    }
}

/// One tenant's simulated rows.
#[derive(Debug, Default)]
struct TenantRows {
    unlinked: u64,
    linked: u64,
    fact_rows: u64,
    aggregates: u64,
    computed: Vec<(NaiveDate, NaiveDate)>,
}

#[derive(Debug, Default)]
struct SimState {
    tenants: HashMap<TenantId, TenantRows>,
    failing_chunks: HashSet<NaiveDate>,
    fail_aggregates: bool,
    unavailable: bool,
}

/// Deterministic stand-in for the stored procedures, with fault injection.
///
/// Rows are kept per tenant. Every computed day yields `rows_per_day` fact
/// rows. Injected faults apply to every tenant.
#[derive(Debug)]
pub struct InMemoryProcedures {
    state: Mutex<SimState>,
    rows_per_day: u64,
}

impl Default for InMemoryProcedures {
    fn default() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            rows_per_day: 10,
        }
    }
}

impl InMemoryProcedures {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_unlinked_customers(self, tenant_id: TenantId, n: u64) -> Self {
        self.update(|s| s.tenants.entry(tenant_id).or_default().unlinked = n);
        self
    }

    /// Make the chunk starting at `start` fail.
    pub fn fail_chunk_starting(&self, start: NaiveDate) {
        self.update(|s| {
            s.failing_chunks.insert(start);
        });
    }

    pub fn fail_aggregates(&self) {
        self.update(|s| s.fail_aggregates = true);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.update(|s| s.unavailable = unavailable);
    }

    /// Windows passed to `compute_facts` for `tenant_id`, in call order.
    pub fn computed_chunks(&self, tenant_id: TenantId) -> Vec<(NaiveDate, NaiveDate)> {
        self.state
            .lock()
            .map(|s| s.tenants.get(&tenant_id).map(|t| t.computed.clone()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn update(&self, f: impl FnOnce(&mut SimState)) {
        if let Ok(mut s) = self.state.lock() {
            f(&mut s);
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut SimState) -> Result<T, ProcedureError>) -> Result<T, ProcedureError> {
        let mut s = self
            .state
            .lock()
            .map_err(|_| ProcedureError::Unavailable("procedure state poisoned".to_string()))?;
        if s.unavailable {
            return Err(ProcedureError::Unavailable("connection refused".to_string()));
        }
        f(&mut s)
    }
}

#[async_trait]
impl PipelineProcedures for InMemoryProcedures {
    async fn link_batch(&self, tenant_id: TenantId, batch_size: u32) -> Result<u64, ProcedureError> {
        self.with_state(|s| {
            let rows = s.tenants.entry(tenant_id).or_default();
            let n = rows.unlinked.min(u64::from(batch_size));
            rows.unlinked -= n;
            rows.linked += n;
            Ok(n)
        })
    }

    async fn compute_facts(&self, tenant_id: TenantId, chunk: &DateChunk) -> Result<u64, ProcedureError> {
        let rows_per_day = self.rows_per_day;
        self.with_state(|s| {
            let fails = s.failing_chunks.contains(&chunk.start);
            let rows = s.tenants.entry(tenant_id).or_default();
            rows.computed.push((chunk.start, chunk.end));
            if fails {
                return Err(ProcedureError::Failed(format!("statement timeout in {}", chunk.id())));
            }
            let written = rows_per_day * chunk.days().max(0) as u64;
            rows.fact_rows += written;
            Ok(written)
        })
    }

    async fn build_daily_aggregates(&self, tenant_id: TenantId, _date: NaiveDate) -> Result<u64, ProcedureError> {
        self.with_state(|s| {
            if s.fail_aggregates {
                return Err(ProcedureError::Failed("aggregate build failed".to_string()));
            }
            s.tenants.entry(tenant_id).or_default().aggregates += 1;
            Ok(1)
        })
    }

    async fn summary_counts(&self, tenant_id: TenantId) -> Result<SummaryCounts, ProcedureError> {
        self.with_state(|s| {
            let counts = s
                .tenants
                .get(&tenant_id)
                .map(|rows| SummaryCounts {
                    linked_customers: rows.linked as i64,
                    unlinked_customers: rows.unlinked as i64,
                    fact_rows: rows.fact_rows as i64,
                    daily_aggregates: rows.aggregates as i64,
                    active_alerts: 0,
                })
                .unwrap_or_default();
            Ok(counts)
        })
    }
}

/// Calls the analytics schema's stored functions.
#[derive(Debug, Clone)]
pub struct PostgresProcedures {
    pool: Arc<PgPool>,
}

impl PostgresProcedures {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ProcedureError {
    if pg::is_unavailable(&err) {
        ProcedureError::Unavailable(pg::describe(operation, &err))
    } else {
        ProcedureError::Failed(pg::describe(operation, &err))
    }
}

#[async_trait]
impl PipelineProcedures for PostgresProcedures {
    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn link_batch(&self, tenant_id: TenantId, batch_size: u32) -> Result<u64, ProcedureError> {
        let row = sqlx::query("SELECT link_customer_batch($1, $2) AS linked")
            .bind(tenant_id.as_uuid())
            .bind(batch_size as i32)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("link_customer_batch", e))?;
        let linked: i64 = row.try_get("linked").map_err(|e| map_sqlx_error("link_customer_batch", e))?;
        Ok(linked.max(0) as u64)
    }

    #[instrument(skip(self, chunk), fields(tenant_id = %tenant_id, chunk = %chunk.id()), err)]
    async fn compute_facts(&self, tenant_id: TenantId, chunk: &DateChunk) -> Result<u64, ProcedureError> {
        let row = sqlx::query("SELECT compute_customer_facts($1, $2, $3) AS rows_written")
            .bind(tenant_id.as_uuid())
            .bind(chunk.start)
            .bind(chunk.end)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("compute_customer_facts", e))?;
        let rows: i64 = row
            .try_get("rows_written")
            .map_err(|e| map_sqlx_error("compute_customer_facts", e))?;
        Ok(rows.max(0) as u64)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn build_daily_aggregates(&self, tenant_id: TenantId, date: NaiveDate) -> Result<u64, ProcedureError> {
        let row = sqlx::query("SELECT build_daily_aggregates($1, $2) AS rows_written")
            .bind(tenant_id.as_uuid())
            .bind(date)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("build_daily_aggregates", e))?;
        let rows: i64 = row
            .try_get("rows_written")
            .map_err(|e| map_sqlx_error("build_daily_aggregates", e))?;
        Ok(rows.max(0) as u64)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn summary_counts(&self, tenant_id: TenantId) -> Result<SummaryCounts, ProcedureError> {
        let row = sqlx::query(
            r#"
            SELECT linked_customers, unlinked_customers, fact_rows, daily_aggregates, active_alerts
            FROM pipeline_summary_counts($1)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pipeline_summary_counts", e))?;

        let get = |col: &str| -> Result<i64, ProcedureError> {
            row.try_get(col).map_err(|e| map_sqlx_error("pipeline_summary_counts", e))
        };
        Ok(SummaryCounts {
            linked_customers: get("linked_customers")?,
            unlinked_customers: get("unlinked_customers")?,
            fact_rows: get("fact_rows")?,
            daily_aggregates: get("daily_aggregates")?,
            active_alerts: get("active_alerts")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::chunking::chunk_range;

    #[tokio::test]
    async fn simulated_linking_drains_in_batches() {
        let tenant = TenantId::new();
        let procs = InMemoryProcedures::new().with_unlinked_customers(tenant, 700);
        assert_eq!(procs.link_batch(tenant, 500).await.unwrap(), 500);
        assert_eq!(procs.link_batch(tenant, 500).await.unwrap(), 200);
        assert_eq!(procs.link_batch(tenant, 500).await.unwrap(), 0);
        assert_eq!(procs.summary_counts(tenant).await.unwrap().linked_customers, 700);
    }

    #[tokio::test]
    async fn rows_are_scoped_to_their_tenant() {
        let a = TenantId::new();
        let b = TenantId::new();
        let procs = InMemoryProcedures::new()
            .with_unlinked_customers(a, 500)
            .with_unlinked_customers(b, 40);
        let chunks = chunk_range(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 14).unwrap(),
            14,
        );
        let chunk = &chunks[0];

        assert_eq!(procs.link_batch(a, 500).await.unwrap(), 500);
        procs.compute_facts(a, chunk).await.unwrap();
        procs.build_daily_aggregates(a, chunk.end).await.unwrap();

        let other = procs.summary_counts(b).await.unwrap();
        assert_eq!(
            other,
            SummaryCounts {
                unlinked_customers: 40,
                ..SummaryCounts::default()
            }
        );
        assert!(procs.computed_chunks(b).is_empty());

        let own = procs.summary_counts(a).await.unwrap();
        assert_eq!((own.linked_customers, own.fact_rows, own.daily_aggregates), (500, 140, 1));
        assert_eq!(procs.summary_counts(TenantId::new()).await.unwrap(), SummaryCounts::default());
    }

    #[tokio::test]
    async fn injected_faults_surface_as_errors() {
        let procs = InMemoryProcedures::new();
        let tenant = TenantId::new();
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let chunks = chunk_range(start, NaiveDate::from_ymd_opt(2024, 1, 20).unwrap(), 14);
        procs.fail_chunk_starting(start);

        assert!(matches!(
            procs.compute_facts(tenant, &chunks[0]).await,
            Err(ProcedureError::Failed(_))
        ));
        assert_eq!(procs.compute_facts(tenant, &chunks[1]).await.unwrap(), 60);

        procs.set_unavailable(true);
        assert!(matches!(
            procs.summary_counts(tenant).await,
            Err(ProcedureError::Unavailable(_))
        ));
    }
}
