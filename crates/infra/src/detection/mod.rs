//! Rule engine: derived-metric refresh, rule evaluation and alert
//! materialization with per-period deduplication.

pub mod alert;
pub mod engine;
pub mod postgres;
pub mod store;

pub use alert::{AlertInstance, AlertStatus};
pub use engine::{DetectionConfig, DETECTION_FUNCTION, DetectionReport, RuleEngine, RuleEngineError, RuleFailure};
pub use postgres::PostgresRuleStore;
pub use store::{InMemoryRuleStore, RuleStore, RuleStoreError, StoredRule};
