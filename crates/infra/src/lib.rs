//! Infrastructure layer: stores, services and the Postgres wiring behind
//! the decision pipeline.
//!
//! - `jobs`: lock & job registry (single-writer guarantee + audit trail)
//! - `pipeline`: budgeted, chunked multi-stage computation
//! - `detection`: rule engine and alert materialization
//! - `cards`: decision card persistence and lifecycle
//! - `outcomes`: outcome ledger and evaluator
//!
//! Every store has an in-memory implementation for tests and local runs and
//! a Postgres one (runtime `sqlx` queries against `migrations/`).

pub mod cards;
pub mod detection;
pub mod jobs;
pub mod outcomes;
pub mod pg;
pub mod pipeline;
