//! Multi-stage computation pipeline for one tenant and date range.
//!
//! Stages run in order: customer linking, chunked fact computation, daily
//! aggregate build, rule detection, summary counts. A failing chunk or stage
//! is recorded in the report and the run moves on. Only an unreachable store
//! aborts the run, which marks the job failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use vantage_core::{Clock, DomainError, TenantId};

use super::budget::{run_budgeted, Budget, StopReason};
use super::chunking::{chunk_range, DateChunk, CHUNK_DAYS};
use super::procedures::{PipelineProcedures, ProcedureError, SummaryCounts};
use crate::detection::{DetectionReport, RuleEngine, RuleEngineError};
use crate::jobs::{AcquireOptions, IdempotentOutcome, JobRegistry, JobRunId, LockKey, RegistryError};

/// Function name under which pipeline runs are locked.
pub const PIPELINE_FUNCTION: &str = "compute-pipeline";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub link_batch_size: u32,
    pub link_max_iterations: u32,
    /// Wall-clock budget shared by the linking loop and the chunk loop.
    pub time_budget: Duration,
    pub chunk_days: u32,
    /// Length of the trailing window used when no dates are given.
    pub default_window_days: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            link_batch_size: 500,
            link_max_iterations: 20,
            time_budget: Duration::from_secs(25),
            chunk_days: CHUNK_DAYS,
            default_window_days: 7,
        }
    }
}

impl PipelineConfig {
    pub fn with_link_batch_size(mut self, size: u32) -> Self {
        self.link_batch_size = size;
        self
    }

    pub fn with_link_max_iterations(mut self, iterations: u32) -> Self {
        self.link_max_iterations = iterations;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    pub fn with_chunk_days(mut self, days: u32) -> Self {
        self.chunk_days = days;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub tenant_id: TenantId,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub link_customers: bool,
    #[serde(default)]
    pub skip_cdp: bool,
    #[serde(default)]
    pub skip_alerts: bool,
}

impl PipelineRequest {
    pub fn for_tenant(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            start_date: None,
            end_date: None,
            link_customers: false,
            skip_cdp: false,
            skip_alerts: false,
        }
    }

    pub fn with_range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }
}

/// A stage's value or the error it ended with. Stage errors never flip the
/// run's `success` flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> StageResult<T> {
    fn ok(value: T) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            value: None,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkingSummary {
    pub iterations: u32,
    pub linked: u64,
    pub stop: StopReason,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkResult {
    pub chunk_id: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FactsSummary {
    pub chunks: Vec<ChunkResult>,
    /// Chunks not started because the time budget ran out. A later run
    /// picks them up.
    pub skipped: Vec<String>,
    pub rows: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkError {
    pub chunk_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineReport {
    pub job_id: JobRunId,
    pub tenant_id: TenantId,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// No chunk failed.
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linking: Option<StageResult<LinkingSummary>>,
    pub facts: FactsSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregates: Option<StageResult<u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection: Option<StageResult<DetectionReport>>,
    pub summary: StageResult<SummaryCounts>,
    pub errors: Vec<ChunkError>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed(PipelineReport),
    /// Another run holds the lock for this tenant and end date.
    AlreadyRunning { job_id: JobRunId, lock_key: LockKey },
    LockFailed { lock_key: LockKey, reason: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    /// The store became unreachable mid-run; the job was marked failed.
    #[error("pipeline job {job_id} aborted: {message}")]
    Aborted { job_id: JobRunId, message: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Abort(String);

impl From<ProcedureError> for Abort {
    fn from(err: ProcedureError) -> Self {
        Abort(err.to_string())
    }
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    registry: JobRegistry,
    procedures: Arc<dyn PipelineProcedures>,
    engine: RuleEngine,
    clock: Arc<dyn Clock>,
    config: PipelineConfig,
}

impl PipelineOrchestrator {
    pub fn new(
        registry: JobRegistry,
        procedures: Arc<dyn PipelineProcedures>,
        engine: RuleEngine,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            procedures,
            engine,
            clock,
            config,
        }
    }

    /// Fill in the default window and validate the range.
    pub fn resolve_range(&self, request: &PipelineRequest) -> Result<(NaiveDate, NaiveDate), DomainError> {
        let end = request.end_date.unwrap_or_else(|| self.clock.today());
        let start = match request.start_date {
            Some(start) => start,
            None => {
                let back = u64::from(self.config.default_window_days.saturating_sub(1));
                end.checked_sub_days(Days::new(back))
                    .ok_or_else(|| DomainError::validation("end_date is out of range"))?
            }
        };
        if start > end {
            return Err(DomainError::validation(format!(
                "start_date {start} is after end_date {end}"
            )));
        }
        Ok((start, end))
    }

    pub async fn run(&self, request: PipelineRequest) -> Result<PipelineOutcome, PipelineError> {
        let (start, end) = self.resolve_range(&request)?;
        if self.config.chunk_days == 0 {
            return Err(DomainError::validation("chunk_days must be positive").into());
        }
        let tenant_id = request.tenant_id;
        let params = serde_json::to_value(&request)
            .map_err(|e| DomainError::validation(format!("unserializable request: {e}")))?;
        let opts = AcquireOptions::default()
            .with_grain_date(end)
            .with_input_params(params);

        let span = info_span!("pipeline", tenant = %tenant_id, start = %start, end = %end);
        let outcome = self
            .registry
            .with_idempotency(PIPELINE_FUNCTION, tenant_id, opts, |job| {
                self.execute(job.id, &request, start, end)
            })
            .instrument(span)
            .await?;

        match outcome {
            IdempotentOutcome::Completed { value, .. } => Ok(PipelineOutcome::Completed(value)),
            IdempotentOutcome::Failed { job_id, error, .. } => Err(PipelineError::Aborted {
                job_id,
                message: error.0,
            }),
            IdempotentOutcome::AlreadyRunning { job_id, lock_key } => {
                info!(tenant = %tenant_id, job_id = %job_id, "pipeline already running");
                Ok(PipelineOutcome::AlreadyRunning { job_id, lock_key })
            }
            IdempotentOutcome::LockFailed { lock_key, reason } => Ok(PipelineOutcome::LockFailed { lock_key, reason }),
        }
    }

    async fn execute(
        &self,
        job_id: JobRunId,
        request: &PipelineRequest,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<PipelineReport, Abort> {
        let tenant_id = request.tenant_id;
        let budget = Budget::start(self.config.link_max_iterations, self.config.time_budget);

        let linking = if request.link_customers {
            Some(self.link_customers(tenant_id, &budget).await?)
        } else {
            None
        };

        let (facts, errors) = self.compute_facts(tenant_id, start, end, &budget).await?;

        let aggregates = if request.skip_cdp {
            None
        } else {
            Some(match self.procedures.build_daily_aggregates(tenant_id, end).await {
                Ok(rows) => StageResult::ok(rows),
                Err(ProcedureError::Failed(msg)) => {
                    warn!(tenant = %tenant_id, error = %msg, "daily aggregate build failed");
                    StageResult::failed(msg)
                }
                Err(e) => return Err(e.into()),
            })
        };

        let detection = if request.skip_alerts {
            None
        } else {
            Some(match self.engine.detect(tenant_id, end).await {
                Ok(report) => StageResult::ok(report),
                Err(RuleEngineError::Domain(e)) => {
                    warn!(tenant = %tenant_id, error = %e, "rule detection failed");
                    StageResult::failed(e)
                }
                Err(RuleEngineError::Store(e)) => return Err(Abort(e.to_string())),
            })
        };

        let summary = match self.procedures.summary_counts(tenant_id).await {
            Ok(counts) => StageResult::ok(counts),
            Err(ProcedureError::Failed(msg)) => StageResult::failed(msg),
            Err(e) => return Err(e.into()),
        };

        let report = PipelineReport {
            job_id,
            tenant_id,
            start_date: start,
            end_date: end,
            success: errors.is_empty(),
            linking,
            facts,
            aggregates,
            detection,
            summary,
            errors,
            elapsed_ms: u64::try_from(budget.elapsed().as_millis()).unwrap_or(u64::MAX),
        };
        info!(
            tenant = %tenant_id,
            job_id = %job_id,
            success = report.success,
            chunks = report.facts.chunks.len(),
            skipped = report.facts.skipped.len(),
            elapsed_ms = report.elapsed_ms,
            "pipeline finished"
        );
        Ok(report)
    }

    async fn link_customers(&self, tenant_id: TenantId, budget: &Budget) -> Result<StageResult<LinkingSummary>, Abort> {
        let batch_size = self.config.link_batch_size;
        let run = run_budgeted(budget, |_| self.procedures.link_batch(tenant_id, batch_size)).await;

        let summary = LinkingSummary {
            iterations: run.iterations,
            linked: run.processed,
            stop: run.stop,
        };
        info!(tenant = %tenant_id, iterations = run.iterations, linked = run.processed, stop = ?run.stop, "customer linking done");

        match run.error {
            None => Ok(StageResult::ok(summary)),
            Some(ProcedureError::Failed(msg)) => Ok(StageResult {
                value: Some(summary),
                error: Some(msg),
            }),
            Some(e) => Err(e.into()),
        }
    }

    async fn compute_facts(
        &self,
        tenant_id: TenantId,
        start: NaiveDate,
        end: NaiveDate,
        budget: &Budget,
    ) -> Result<(FactsSummary, Vec<ChunkError>), Abort> {
        let chunks = chunk_range(start, end, self.config.chunk_days);
        let mut facts = FactsSummary::default();
        let mut errors = Vec::new();

        for chunk in &chunks {
            if budget.time_exhausted() {
                facts.skipped.push(chunk.id());
                continue;
            }
            match self.procedures.compute_facts(tenant_id, chunk).await {
                Ok(rows) => {
                    facts.rows += rows;
                    facts.chunks.push(chunk_result(chunk, Some(rows), None));
                }
                Err(ProcedureError::Failed(msg)) => {
                    warn!(tenant = %tenant_id, chunk = %chunk.id(), error = %msg, "fact chunk failed");
                    errors.push(ChunkError {
                        chunk_id: chunk.id(),
                        message: msg.clone(),
                    });
                    facts.chunks.push(chunk_result(chunk, None, Some(msg)));
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !facts.skipped.is_empty() {
            warn!(tenant = %tenant_id, skipped = facts.skipped.len(), "time budget exhausted before all chunks ran");
        }
        Ok((facts, errors))
    }
}

fn chunk_result(chunk: &DateChunk, rows: Option<u64>, error: Option<String>) -> ChunkResult {
    ChunkResult {
        chunk_id: chunk.id(),
        start: chunk.start,
        end: chunk.end,
        rows,
        error,
    }
}
