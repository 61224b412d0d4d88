use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use vantage_core::{Aggregate, AggregateRoot, AlertId, CardId, DomainError, TenantId};
use vantage_rules::Severity;

/// Upper bound for a single snooze (30 days).
pub const MAX_SNOOZE_HOURS: u32 = 720;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardStatus {
    Open,
    InProgress,
    Decided,
    Dismissed,
    Snoozed,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Open => "OPEN",
            CardStatus::InProgress => "IN_PROGRESS",
            CardStatus::Decided => "DECIDED",
            CardStatus::Dismissed => "DISMISSED",
            CardStatus::Snoozed => "SNOOZED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CardStatus::Decided | CardStatus::Dismissed)
    }

    /// Shown in the operator queue.
    pub fn is_actionable(&self) -> bool {
        matches!(self, CardStatus::Open | CardStatus::InProgress)
    }
}

impl core::str::FromStr for CardStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(CardStatus::Open),
            "IN_PROGRESS" => Ok(CardStatus::InProgress),
            "DECIDED" => Ok(CardStatus::Decided),
            "DISMISSED" => Ok(CardStatus::Dismissed),
            "SNOOZED" => Ok(CardStatus::Snoozed),
            other => Err(DomainError::validation(format!("unknown card status: {other}"))),
        }
    }
}

/// P1 is the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical => Priority::P1,
            Severity::Warning => Priority::P2,
            Severity::Info => Priority::P3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }

    pub fn rank(&self) -> i16 {
        match self {
            Priority::P1 => 1,
            Priority::P2 => 2,
            Priority::P3 => 3,
        }
    }
}

/// The condition a card was opened for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum CardTrigger {
    /// An alert for an ongoing condition. `condition` names the source and
    /// object without the detection period, so a condition that keeps
    /// firing day after day maps to one key.
    Alert { alert_id: AlertId, condition: String },
    /// Externally generated insight, identified by a stable key.
    Insight(String),
}

impl CardTrigger {
    pub fn alert(alert_id: AlertId, condition: impl Into<String>) -> Self {
        CardTrigger::Alert {
            alert_id,
            condition: condition.into(),
        }
    }

    /// Uniqueness key: at most one undecided card per key and tenant.
    pub fn key(&self) -> String {
        match self {
            CardTrigger::Alert { condition, .. } => format!("condition:{condition}"),
            CardTrigger::Insight(key) => format!("insight:{key}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action_type: String,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
    /// Snapshot of the card's estimate when the decision was made.
    pub predicted_impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dismissal {
    pub reason_code: String,
    pub comment: String,
    pub dismissed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snooze {
    pub resume_at: DateTime<Utc>,
    pub reason: String,
    pub snoozed_at: DateTime<Utc>,
}

/// Aggregate root: DecisionCard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionCard {
    id: CardId,
    tenant_id: Option<TenantId>,
    title: String,
    priority: Priority,
    status: CardStatus,
    deadline_at: Option<DateTime<Utc>>,
    predicted_impact: f64,
    trigger: Option<CardTrigger>,
    decision: Option<Decision>,
    dismissal: Option<Dismissal>,
    snooze: Option<Snooze>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl DecisionCard {
    /// Not-yet-created instance; `CreateCard` brings it to life.
    pub fn empty(id: CardId) -> Self {
        Self {
            id,
            tenant_id: None,
            title: String::new(),
            priority: Priority::P3,
            status: CardStatus::Open,
            deadline_at: None,
            predicted_impact: 0.0,
            trigger: None,
            decision: None,
            dismissal: None,
            snooze: None,
            created_at: None,
            updated_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn tenant_id(&self) -> Option<TenantId> {
        self.tenant_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn status(&self) -> CardStatus {
        self.status
    }

    pub fn deadline_at(&self) -> Option<DateTime<Utc>> {
        self.deadline_at
    }

    /// Current estimate; frozen into `Decision::predicted_impact` on decide.
    pub fn predicted_impact(&self) -> f64 {
        self.predicted_impact
    }

    pub fn trigger(&self) -> Option<&CardTrigger> {
        self.trigger.as_ref()
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    pub fn dismissal(&self) -> Option<&Dismissal> {
        self.dismissal.as_ref()
    }

    pub fn snooze(&self) -> Option<&Snooze> {
        self.snooze.as_ref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// OPEN, IN_PROGRESS or SNOOZED: still holds its trigger.
    pub fn is_undecided(&self) -> bool {
        self.created && !self.status.is_terminal()
    }

    /// SNOOZED and `resume_at` has been reached.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == CardStatus::Snoozed && self.snooze.as_ref().is_some_and(|s| now >= s.resume_at)
    }

    /// Handle and apply in one step; returns the applied events.
    pub fn execute(&mut self, command: &CardCommand) -> Result<Vec<CardEvent>, DomainError> {
        let events = self.handle(command)?;
        for e in &events {
            self.apply(e);
        }
        Ok(events)
    }
}

impl AggregateRoot for DecisionCard {
    type Id = CardId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateCard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateCard {
    pub tenant_id: TenantId,
    pub card_id: CardId,
    pub title: String,
    pub priority: Priority,
    pub deadline_at: Option<DateTime<Utc>>,
    pub predicted_impact: f64,
    pub trigger: CardTrigger,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartWork (OPEN → IN_PROGRESS).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartWork {
    pub tenant_id: TenantId,
    pub card_id: CardId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecideCard {
    pub tenant_id: TenantId,
    pub card_id: CardId,
    pub action_type: String,
    pub comment: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DismissCard {
    pub tenant_id: TenantId,
    pub card_id: CardId,
    pub reason_code: String,
    pub comment: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnoozeCard {
    pub tenant_id: TenantId,
    pub card_id: CardId,
    pub hours: u32,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ResumeCard (SNOOZED → OPEN), issued by the sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCard {
    pub tenant_id: TenantId,
    pub card_id: CardId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CardCommand {
    Create(CreateCard),
    Start(StartWork),
    Decide(DecideCard),
    Dismiss(DismissCard),
    Snooze(SnoozeCard),
    Resume(ResumeCard),
}

impl CardCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CardCommand::Create(_) => "create",
            CardCommand::Start(_) => "start",
            CardCommand::Decide(_) => "decide",
            CardCommand::Dismiss(_) => "dismiss",
            CardCommand::Snooze(_) => "snooze",
            CardCommand::Resume(_) => "resume",
        }
    }

    fn target(&self) -> (TenantId, CardId) {
        match self {
            CardCommand::Create(c) => (c.tenant_id, c.card_id),
            CardCommand::Start(c) => (c.tenant_id, c.card_id),
            CardCommand::Decide(c) => (c.tenant_id, c.card_id),
            CardCommand::Dismiss(c) => (c.tenant_id, c.card_id),
            CardCommand::Snooze(c) => (c.tenant_id, c.card_id),
            CardCommand::Resume(c) => (c.tenant_id, c.card_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CardEvent {
    Created {
        tenant_id: TenantId,
        card_id: CardId,
        title: String,
        priority: Priority,
        deadline_at: Option<DateTime<Utc>>,
        predicted_impact: f64,
        trigger: CardTrigger,
        occurred_at: DateTime<Utc>,
    },
    WorkStarted {
        occurred_at: DateTime<Utc>,
    },
    Decided {
        decision: Decision,
    },
    Dismissed {
        dismissal: Dismissal,
    },
    Snoozed {
        snooze: Snooze,
    },
    Resumed {
        occurred_at: DateTime<Utc>,
    },
}

impl CardEvent {
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            CardEvent::Created { occurred_at, .. }
            | CardEvent::WorkStarted { occurred_at }
            | CardEvent::Resumed { occurred_at } => *occurred_at,
            CardEvent::Decided { decision } => decision.decided_at,
            CardEvent::Dismissed { dismissal } => dismissal.dismissed_at,
            CardEvent::Snoozed { snooze } => snooze.snoozed_at,
        }
    }
}

impl Aggregate for DecisionCard {
    type Command = CardCommand;
    type Event = CardEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            CardEvent::Created {
                tenant_id,
                card_id,
                title,
                priority,
                deadline_at,
                predicted_impact,
                trigger,
                occurred_at,
            } => {
                self.id = *card_id;
                self.tenant_id = Some(*tenant_id);
                self.title = title.clone();
                self.priority = *priority;
                self.deadline_at = *deadline_at;
                self.predicted_impact = *predicted_impact;
                self.trigger = Some(trigger.clone());
                self.status = CardStatus::Open;
                self.created_at = Some(*occurred_at);
                self.created = true;
            }
            CardEvent::WorkStarted { .. } => {
                self.status = CardStatus::InProgress;
            }
            CardEvent::Decided { decision } => {
                self.status = CardStatus::Decided;
                self.decision = Some(decision.clone());
            }
            CardEvent::Dismissed { dismissal } => {
                self.status = CardStatus::Dismissed;
                self.dismissal = Some(dismissal.clone());
            }
            CardEvent::Snoozed { snooze } => {
                self.status = CardStatus::Snoozed;
                self.snooze = Some(snooze.clone());
            }
            CardEvent::Resumed { .. } => {
                self.status = CardStatus::Open;
                self.snooze = None;
            }
        }

        self.updated_at = Some(event.occurred_at());
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            CardCommand::Create(cmd) => self.handle_create(cmd),
            CardCommand::Start(cmd) => {
                self.ensure_mutable(command)?;
                self.handle_start(cmd)
            }
            CardCommand::Decide(cmd) => {
                self.ensure_mutable(command)?;
                self.handle_decide(cmd)
            }
            CardCommand::Dismiss(cmd) => {
                self.ensure_mutable(command)?;
                self.handle_dismiss(cmd)
            }
            CardCommand::Snooze(cmd) => {
                self.ensure_mutable(command)?;
                self.handle_snooze(cmd)
            }
            CardCommand::Resume(cmd) => {
                self.ensure_mutable(command)?;
                self.handle_resume(cmd)
            }
        }
    }
}

impl DecisionCard {
    /// Existence, ownership and terminal-state checks shared by every
    /// command except `Create`.
    fn ensure_mutable(&self, command: &CardCommand) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        let (tenant_id, card_id) = command.target();
        self.ensure_target(tenant_id, card_id)?;
        if self.status.is_terminal() {
            return Err(DomainError::invalid_transition(format!(
                "card is {} and cannot {}",
                self.status.as_str(),
                command.name()
            )));
        }
        Ok(())
    }

    fn ensure_target(&self, tenant_id: TenantId, card_id: CardId) -> Result<(), DomainError> {
        if self.tenant_id != Some(tenant_id) {
            return Err(DomainError::invariant("tenant mismatch"));
        }
        if self.id != card_id {
            return Err(DomainError::invariant("card_id mismatch"));
        }
        Ok(())
    }

    fn ensure_actionable(&self, action: &str) -> Result<(), DomainError> {
        if self.status.is_actionable() {
            Ok(())
        } else {
            Err(DomainError::invalid_transition(format!(
                "card is {} and cannot {action}",
                self.status.as_str()
            )))
        }
    }

    fn handle_create(&self, cmd: &CreateCard) -> Result<Vec<CardEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("card already exists"));
        }
        if cmd.title.trim().is_empty() {
            return Err(DomainError::validation("title cannot be empty"));
        }
        if !cmd.predicted_impact.is_finite() {
            return Err(DomainError::validation("predicted_impact must be finite"));
        }

        Ok(vec![CardEvent::Created {
            tenant_id: cmd.tenant_id,
            card_id: cmd.card_id,
            title: cmd.title.trim().to_string(),
            priority: cmd.priority,
            deadline_at: cmd.deadline_at,
            predicted_impact: cmd.predicted_impact,
            trigger: cmd.trigger.clone(),
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_start(&self, cmd: &StartWork) -> Result<Vec<CardEvent>, DomainError> {
        if self.status != CardStatus::Open {
            return Err(DomainError::invalid_transition(format!(
                "card is {} and cannot start",
                self.status.as_str()
            )));
        }
        Ok(vec![CardEvent::WorkStarted {
            occurred_at: cmd.occurred_at,
        }])
    }

    fn handle_decide(&self, cmd: &DecideCard) -> Result<Vec<CardEvent>, DomainError> {
        self.ensure_actionable("decide")?;
        if cmd.action_type.trim().is_empty() {
            return Err(DomainError::validation("action_type cannot be empty"));
        }

        Ok(vec![CardEvent::Decided {
            decision: Decision {
                action_type: cmd.action_type.trim().to_string(),
                comment: cmd.comment.clone().filter(|c| !c.trim().is_empty()),
                decided_at: cmd.occurred_at,
                predicted_impact: self.predicted_impact,
            },
        }])
    }

    fn handle_dismiss(&self, cmd: &DismissCard) -> Result<Vec<CardEvent>, DomainError> {
        self.ensure_actionable("dismiss")?;
        if cmd.reason_code.trim().is_empty() {
            return Err(DomainError::validation("reason_code cannot be empty"));
        }

        Ok(vec![CardEvent::Dismissed {
            dismissal: Dismissal {
                reason_code: cmd.reason_code.trim().to_string(),
                comment: cmd.comment.clone(),
                dismissed_at: cmd.occurred_at,
            },
        }])
    }

    fn handle_snooze(&self, cmd: &SnoozeCard) -> Result<Vec<CardEvent>, DomainError> {
        self.ensure_actionable("snooze")?;
        if cmd.hours == 0 || cmd.hours > MAX_SNOOZE_HOURS {
            return Err(DomainError::validation(format!(
                "snooze hours must be between 1 and {MAX_SNOOZE_HOURS}"
            )));
        }

        Ok(vec![CardEvent::Snoozed {
            snooze: Snooze {
                resume_at: cmd.occurred_at + Duration::hours(i64::from(cmd.hours)),
                reason: cmd.reason.clone(),
                snoozed_at: cmd.occurred_at,
            },
        }])
    }

    fn handle_resume(&self, cmd: &ResumeCard) -> Result<Vec<CardEvent>, DomainError> {
        if self.status != CardStatus::Snoozed {
            return Err(DomainError::invalid_transition(format!(
                "card is {} and cannot resume",
                self.status.as_str()
            )));
        }
        if !self.is_due(cmd.occurred_at) {
            return Err(DomainError::invalid_transition("snooze has not elapsed"));
        }
        Ok(vec![CardEvent::Resumed {
            occurred_at: cmd.occurred_at,
        }])
    }
}
