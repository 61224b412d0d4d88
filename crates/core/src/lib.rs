//! `vantage-core`: ids, the domain error, aggregate traits and the clock
//! shared by the rule, decision and infra crates. No IO.

pub mod aggregate;
pub mod clock;
pub mod error;
pub mod id;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{AlertId, CardId, JobRunId, ObjectId, OutcomeId, RuleId, TenantId, ThresholdId};
