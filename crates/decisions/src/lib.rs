//! `vantage-decisions`
//!
//! Decision cards and their outcomes, as pure domain code:
//! - `card`: the card aggregate (commands, events, state machine),
//! - `ordering`: the deterministic actionable queue,
//! - `outcome` / `stats`: scoring a decision after the fact and the
//!   read-side statistics over the outcome ledger.

pub mod card;
pub mod ordering;
pub mod outcome;
pub mod stats;

pub use card::{
    CardCommand, CardEvent, CardStatus, CardTrigger, CreateCard, DecideCard, Decision,
    DecisionCard, DismissCard, Dismissal, Priority, ResumeCard, SnoozeCard, Snooze, StartWork,
    MAX_SNOOZE_HOURS,
};
pub use ordering::{compare_cards, select_actionable};
pub use outcome::{score_outcome, DecisionOutcomeRecord, OutcomeScore, OutcomeStatus};
pub use stats::{compute_stats, OutcomeStats, TypeBreakdown};
