//! Pipeline orchestration: budgeted loops, date chunking, the store-side
//! procedure seam and the stage sequencer built on them.

pub mod budget;
pub mod chunking;
pub mod orchestrator;
pub mod procedures;

pub use budget::{run_budgeted, Budget, BudgetedRun, StopReason};
pub use chunking::{chunk_range, DateChunk, CHUNK_DAYS};
pub use orchestrator::{
    ChunkError, ChunkResult, FactsSummary, LinkingSummary, PipelineConfig, PipelineError, PipelineOrchestrator,
    PipelineOutcome, PipelineReport, PipelineRequest, StageResult, PIPELINE_FUNCTION,
};
pub use procedures::{InMemoryProcedures, PipelineProcedures, PostgresProcedures, ProcedureError, SummaryCounts};
