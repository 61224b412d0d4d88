//! Outcome evaluation: the append-only ledger of scored decisions and the
//! evaluator that fills it.

pub mod evaluator;
pub mod postgres;
pub mod store;

pub use evaluator::{
    EvaluationFailure, EvaluationReport, OutcomeError, OutcomeEvaluator, ScoredDecision, DEFAULT_EVALUATION_WINDOW_DAYS,
    EVALUATION_FUNCTION,
};
pub use postgres::{PostgresImpactSource, PostgresOutcomeLedger};
pub use store::{ImpactError, ImpactSource, InMemoryOutcomeLedger, LedgerError, OutcomeLedger, StaticImpactSource};
