//! Card lifecycle service: load, run a command through the aggregate, save
//! with the loaded version.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use vantage_core::{AggregateRoot, CardId, Clock, DomainError, ExpectedVersion, TenantId};
use vantage_decisions::{
    select_actionable, CardCommand, CardStatus, CardTrigger, CreateCard, DecideCard, DecisionCard, DismissCard,
    Priority, ResumeCard, SnoozeCard, StartWork,
};

use super::store::{CardStore, CardStoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CardServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] CardStoreError),
}

/// Input for [`CardService::open_card`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewCard {
    pub title: String,
    pub priority: Priority,
    pub deadline_at: Option<DateTime<Utc>>,
    pub predicted_impact: f64,
    pub trigger: CardTrigger,
}

#[derive(Clone)]
pub struct CardService {
    store: Arc<dyn CardStore>,
    clock: Arc<dyn Clock>,
}

impl CardService {
    pub fn new(store: Arc<dyn CardStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Fails with [`CardStoreError::DuplicateTrigger`] while another
    /// undecided card holds the trigger.
    pub async fn open_card(&self, tenant_id: TenantId, new: NewCard) -> Result<DecisionCard, CardServiceError> {
        let card_id = CardId::new();
        let mut card = DecisionCard::empty(card_id);
        card.execute(&CardCommand::Create(CreateCard {
            tenant_id,
            card_id,
            title: new.title,
            priority: new.priority,
            deadline_at: new.deadline_at,
            predicted_impact: new.predicted_impact,
            trigger: new.trigger,
            occurred_at: self.clock.now(),
        }))?;
        self.store.insert(&card).await?;
        info!(tenant = %tenant_id, card_id = %card_id, priority = card.priority().as_str(), "card opened");
        Ok(card)
    }

    pub async fn get(&self, tenant_id: TenantId, card_id: CardId) -> Result<DecisionCard, CardServiceError> {
        self.store
            .get(tenant_id, card_id)
            .await?
            .ok_or(CardServiceError::Store(CardStoreError::NotFound(card_id)))
    }

    pub async fn start(&self, tenant_id: TenantId, card_id: CardId) -> Result<DecisionCard, CardServiceError> {
        self.transition(tenant_id, card_id, |occurred_at| {
            CardCommand::Start(StartWork {
                tenant_id,
                card_id,
                occurred_at,
            })
        })
        .await
    }

    pub async fn decide(
        &self,
        tenant_id: TenantId,
        card_id: CardId,
        action_type: impl Into<String>,
        comment: Option<String>,
    ) -> Result<DecisionCard, CardServiceError> {
        let action_type = action_type.into();
        self.transition(tenant_id, card_id, |occurred_at| {
            CardCommand::Decide(DecideCard {
                tenant_id,
                card_id,
                action_type,
                comment,
                occurred_at,
            })
        })
        .await
    }

    pub async fn dismiss(
        &self,
        tenant_id: TenantId,
        card_id: CardId,
        reason_code: impl Into<String>,
        comment: impl Into<String>,
    ) -> Result<DecisionCard, CardServiceError> {
        let (reason_code, comment) = (reason_code.into(), comment.into());
        self.transition(tenant_id, card_id, |occurred_at| {
            CardCommand::Dismiss(DismissCard {
                tenant_id,
                card_id,
                reason_code,
                comment,
                occurred_at,
            })
        })
        .await
    }

    pub async fn snooze(
        &self,
        tenant_id: TenantId,
        card_id: CardId,
        hours: u32,
        reason: impl Into<String>,
    ) -> Result<DecisionCard, CardServiceError> {
        let reason = reason.into();
        self.transition(tenant_id, card_id, |occurred_at| {
            CardCommand::Snooze(SnoozeCard {
                tenant_id,
                card_id,
                hours,
                reason,
                occurred_at,
            })
        })
        .await
    }

    /// Reopen every snoozed card whose resume time has passed.
    ///
    /// A card another writer moved in the meantime is skipped, not an error.
    pub async fn resume_due(&self, tenant_id: TenantId) -> Result<Vec<CardId>, CardServiceError> {
        let now = self.clock.now();
        let due = self.store.due_snoozed(tenant_id, now).await?;

        let mut resumed = Vec::with_capacity(due.len());
        for mut card in due {
            let card_id = *card.id();
            let expected = ExpectedVersion::Exact(card.version());
            card.execute(&CardCommand::Resume(ResumeCard {
                tenant_id,
                card_id,
                occurred_at: now,
            }))?;
            match self.store.save(&card, expected).await {
                Ok(()) => resumed.push(card_id),
                Err(CardStoreError::Conflict(reason)) => {
                    warn!(tenant = %tenant_id, card_id = %card_id, %reason, "card changed during resume sweep");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if !resumed.is_empty() {
            info!(tenant = %tenant_id, resumed = resumed.len(), "snoozed cards resumed");
        }
        Ok(resumed)
    }

    /// OPEN and IN_PROGRESS cards in queue order.
    pub async fn actionable_queue(&self, tenant_id: TenantId) -> Result<Vec<DecisionCard>, CardServiceError> {
        let cards = self
            .store
            .list(tenant_id, &[CardStatus::Open, CardStatus::InProgress])
            .await?;
        Ok(select_actionable(&cards).into_iter().cloned().collect())
    }

    async fn transition(
        &self,
        tenant_id: TenantId,
        card_id: CardId,
        command: impl FnOnce(DateTime<Utc>) -> CardCommand,
    ) -> Result<DecisionCard, CardServiceError> {
        let mut card = self.get(tenant_id, card_id).await?;
        let expected = ExpectedVersion::Exact(card.version());
        let command = command(self.clock.now());

        card.execute(&command)?;
        self.store.save(&card, expected).await?;
        info!(
            tenant = %tenant_id,
            card_id = %card_id,
            command = command.name(),
            status = card.status().as_str(),
            "card transitioned"
        );
        Ok(card)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use vantage_core::{AlertId, FixedClock};

    use super::*;
    use crate::cards::store::InMemoryCardStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn service() -> (CardService, Arc<FixedClock>, Arc<InMemoryCardStore>) {
        let clock = Arc::new(FixedClock::new(t0()));
        let store = InMemoryCardStore::arc();
        (CardService::new(store.clone(), clock.clone()), clock, store)
    }

    fn new_card(trigger: CardTrigger, priority: Priority) -> NewCard {
        NewCard {
            title: "Reorder SKU-1".into(),
            priority,
            deadline_at: None,
            predicted_impact: 250.0,
            trigger,
        }
    }

    #[tokio::test]
    async fn one_undecided_card_per_trigger() {
        let (svc, _, _) = service();
        let tenant = TenantId::new();
        let trigger = CardTrigger::alert(AlertId::new(), "threshold:low-stock:SKU-1");

        let first = svc.open_card(tenant, new_card(trigger.clone(), Priority::P1)).await.unwrap();
        let err = svc.open_card(tenant, new_card(trigger.clone(), Priority::P1)).await.unwrap_err();
        assert!(matches!(err, CardServiceError::Store(CardStoreError::DuplicateTrigger(_))));

        // A later alert for the same condition is still the same trigger.
        let next_day = CardTrigger::alert(AlertId::new(), "threshold:low-stock:SKU-1");
        let err = svc.open_card(tenant, new_card(next_day.clone(), Priority::P1)).await.unwrap_err();
        assert!(matches!(err, CardServiceError::Store(CardStoreError::DuplicateTrigger(_))));

        // Once decided, the trigger is free again.
        svc.decide(tenant, *first.id(), "reorder", None).await.unwrap();
        svc.open_card(tenant, new_card(next_day, Priority::P1)).await.unwrap();
    }

    #[tokio::test]
    async fn same_trigger_in_other_tenant_is_independent() {
        let (svc, _, _) = service();
        let trigger = CardTrigger::Insight("churn-risk".into());
        svc.open_card(TenantId::new(), new_card(trigger.clone(), Priority::P2)).await.unwrap();
        svc.open_card(TenantId::new(), new_card(trigger, Priority::P2)).await.unwrap();
    }

    #[tokio::test]
    async fn decide_freezes_prediction_and_blocks_further_transitions() {
        let (svc, _, _) = service();
        let tenant = TenantId::new();
        let card = svc
            .open_card(tenant, new_card(CardTrigger::alert(AlertId::new(), "threshold:low-stock:SKU-1"), Priority::P1))
            .await
            .unwrap();
        let id = *card.id();

        svc.start(tenant, id).await.unwrap();
        let decided = svc.decide(tenant, id, "reorder", Some("approved".into())).await.unwrap();
        let decision = decided.decision().unwrap();
        assert_eq!(decision.predicted_impact, 250.0);
        assert_eq!(decision.decided_at, t0());

        let err = svc.snooze(tenant, id, 4, "later").await.unwrap_err();
        assert!(matches!(err, CardServiceError::Domain(DomainError::InvalidTransition(_))));
        assert_eq!(svc.get(tenant, id).await.unwrap().status(), CardStatus::Decided);
    }

    #[tokio::test]
    async fn stale_writer_gets_conflict() {
        let (svc, _, store) = service();
        let tenant = TenantId::new();
        let card = svc
            .open_card(tenant, new_card(CardTrigger::alert(AlertId::new(), "threshold:low-stock:SKU-1"), Priority::P1))
            .await
            .unwrap();

        // Another writer moves the card first.
        svc.start(tenant, *card.id()).await.unwrap();

        let mut stale = card.clone();
        stale
            .execute(&CardCommand::Dismiss(DismissCard {
                tenant_id: tenant,
                card_id: *card.id(),
                reason_code: "noise".into(),
                comment: String::new(),
                occurred_at: t0(),
            }))
            .unwrap();
        let err = store.save(&stale, ExpectedVersion::Exact(card.version())).await.unwrap_err();
        assert!(matches!(err, CardStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn resume_sweep_reopens_only_due_cards() {
        let (svc, clock, _) = service();
        let tenant = TenantId::new();
        let short = svc
            .open_card(tenant, new_card(CardTrigger::Insight("a".into()), Priority::P2))
            .await
            .unwrap();
        let long = svc
            .open_card(tenant, new_card(CardTrigger::Insight("b".into()), Priority::P2))
            .await
            .unwrap();
        svc.snooze(tenant, *short.id(), 2, "waiting on supplier").await.unwrap();
        svc.snooze(tenant, *long.id(), 48, "next week").await.unwrap();

        clock.advance(Duration::hours(1));
        assert!(svc.resume_due(tenant).await.unwrap().is_empty());

        clock.advance(Duration::hours(1));
        assert_eq!(svc.resume_due(tenant).await.unwrap(), vec![*short.id()]);
        assert_eq!(svc.get(tenant, *short.id()).await.unwrap().status(), CardStatus::Open);
        assert_eq!(svc.get(tenant, *long.id()).await.unwrap().status(), CardStatus::Snoozed);

        let queue = svc.actionable_queue(tenant).await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id(), short.id());
    }

    #[tokio::test]
    async fn queue_is_ordered_by_priority() {
        let (svc, _, _) = service();
        let tenant = TenantId::new();
        for (key, priority) in [("x", Priority::P3), ("y", Priority::P1), ("z", Priority::P2)] {
            svc.open_card(tenant, new_card(CardTrigger::Insight(key.into()), priority))
                .await
                .unwrap();
        }
        let priorities: Vec<Priority> = svc
            .actionable_queue(tenant)
            .await
            .unwrap()
            .iter()
            .map(|c| c.priority())
            .collect();
        assert_eq!(priorities, vec![Priority::P1, Priority::P2, Priority::P3]);
    }

    #[tokio::test]
    async fn snooze_hours_out_of_range_is_validation_error() {
        let (svc, _, _) = service();
        let tenant = TenantId::new();
        let card = svc
            .open_card(tenant, new_card(CardTrigger::alert(AlertId::new(), "threshold:low-stock:SKU-1"), Priority::P1))
            .await
            .unwrap();
        for hours in [0, 721] {
            let err = svc.snooze(tenant, *card.id(), hours, "x").await.unwrap_err();
            assert!(matches!(err, CardServiceError::Domain(DomainError::Validation(_))));
        }
    }
}
