//! `vantage-rules`
//!
//! **Responsibility:** deterministic rule evaluation over monitored objects.
//!
//! This crate performs no IO:
//! - callers (infra) load objects and rule definitions and hand them in,
//! - evaluation returns `Detection`s, which infra turns into persisted alerts.

pub mod correlation;
pub mod error;
pub mod evaluate;
pub mod formula;
pub mod object;
pub mod rule;

pub use correlation::{default_correlations, run_correlations, CorrelationRule};
pub use error::{FormulaError, RuleError};
pub use evaluate::{
    evaluate_threshold, estimate_impact, AlertSource, Breach, CompiledRule, Detection,
};
pub use formula::Formula;
pub use object::{derive_metrics, DerivationPolicy, DerivedMetrics, MonitoredObject, TrendDirection};
pub use rule::{ComparisonOp, IntelligentRule, RuleKind, Severity, ThresholdConfig, WeightedTerm};
