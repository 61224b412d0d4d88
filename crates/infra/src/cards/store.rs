//! Decision card persistence.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vantage_core::{AggregateRoot, CardId, ExpectedVersion, TenantId};
use vantage_decisions::{CardStatus, DecisionCard};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CardStoreError {
    #[error("card not found: {0}")]
    NotFound(CardId),

    /// An undecided card already holds this trigger.
    #[error("an undecided card already exists for trigger {0}")]
    DuplicateTrigger(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Card table. Cards are stored whole; `save` compares versions.
///
/// Uniqueness of undecided cards per trigger is the store's job, mirroring
/// the partial unique index of the Postgres schema.
#[async_trait]
pub trait CardStore: Send + Sync {
    async fn insert(&self, card: &DecisionCard) -> Result<(), CardStoreError>;

    /// `expected` is the version the caller loaded.
    async fn save(&self, card: &DecisionCard, expected: ExpectedVersion) -> Result<(), CardStoreError>;

    async fn get(&self, tenant_id: TenantId, card_id: CardId) -> Result<Option<DecisionCard>, CardStoreError>;

    /// Empty `statuses` means all.
    async fn list(&self, tenant_id: TenantId, statuses: &[CardStatus]) -> Result<Vec<DecisionCard>, CardStoreError>;

    /// SNOOZED cards whose `resume_at <= now`.
    async fn due_snoozed(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<Vec<DecisionCard>, CardStoreError>;

    /// DECIDED cards with `decided_at <= cutoff`.
    async fn decided_before(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DecisionCard>, CardStoreError>;
}

#[async_trait]
impl<S> CardStore for Arc<S>
where
    S: CardStore + ?Sized,
{
    async fn insert(&self, card: &DecisionCard) -> Result<(), CardStoreError> {
        (**self).insert(card).await
    }

    async fn save(&self, card: &DecisionCard, expected: ExpectedVersion) -> Result<(), CardStoreError> {
        (**self).save(card, expected).await
    }

    async fn get(&self, tenant_id: TenantId, card_id: CardId) -> Result<Option<DecisionCard>, CardStoreError> {
        (**self).get(tenant_id, card_id).await
    }

    async fn list(&self, tenant_id: TenantId, statuses: &[CardStatus]) -> Result<Vec<DecisionCard>, CardStoreError> {
        (**self).list(tenant_id, statuses).await
    }

    async fn due_snoozed(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<Vec<DecisionCard>, CardStoreError> {
        (**self).due_snoozed(tenant_id, now).await
    }

    async fn decided_before(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DecisionCard>, CardStoreError> {
        (**self).decided_before(tenant_id, cutoff).await
    }
}

/// In-memory card store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCardStore {
    cards: RwLock<HashMap<CardId, DecisionCard>>,
}

impl InMemoryCardStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn filtered(
        &self,
        tenant_id: TenantId,
        keep: impl Fn(&DecisionCard) -> bool,
    ) -> Result<Vec<DecisionCard>, CardStoreError> {
        let cards = self.cards.read().map_err(|_| poisoned())?;
        let mut out: Vec<DecisionCard> = cards
            .values()
            .filter(|c| c.tenant_id() == Some(tenant_id) && keep(c))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(out)
    }
}

fn poisoned() -> CardStoreError {
    CardStoreError::Storage("card store lock poisoned".to_string())
}

#[async_trait]
impl CardStore for InMemoryCardStore {
    async fn insert(&self, card: &DecisionCard) -> Result<(), CardStoreError> {
        let tenant_id = card
            .tenant_id()
            .ok_or_else(|| CardStoreError::Conflict("card was never created".to_string()))?;
        let trigger_key = card.trigger().map(|t| t.key());

        let mut cards = self.cards.write().map_err(|_| poisoned())?;
        if cards.contains_key(card.id()) {
            return Err(CardStoreError::Conflict(format!("card {} already exists", card.id())));
        }
        if let Some(key) = &trigger_key {
            let held = cards.values().any(|c| {
                c.tenant_id() == Some(tenant_id) && c.is_undecided() && c.trigger().map(|t| t.key()).as_ref() == Some(key)
            });
            if held && card.is_undecided() {
                return Err(CardStoreError::DuplicateTrigger(key.clone()));
            }
        }
        cards.insert(*card.id(), card.clone());
        Ok(())
    }

    async fn save(&self, card: &DecisionCard, expected: ExpectedVersion) -> Result<(), CardStoreError> {
        let mut cards = self.cards.write().map_err(|_| poisoned())?;
        let stored = cards
            .get_mut(card.id())
            .filter(|c| c.tenant_id() == card.tenant_id())
            .ok_or(CardStoreError::NotFound(*card.id()))?;
        expected
            .check(stored.version())
            .map_err(|e| CardStoreError::Conflict(e.to_string()))?;
        *stored = card.clone();
        Ok(())
    }

    async fn get(&self, tenant_id: TenantId, card_id: CardId) -> Result<Option<DecisionCard>, CardStoreError> {
        let cards = self.cards.read().map_err(|_| poisoned())?;
        Ok(cards.get(&card_id).filter(|c| c.tenant_id() == Some(tenant_id)).cloned())
    }

    async fn list(&self, tenant_id: TenantId, statuses: &[CardStatus]) -> Result<Vec<DecisionCard>, CardStoreError> {
        self.filtered(tenant_id, |c| statuses.is_empty() || statuses.contains(&c.status()))
    }

    async fn due_snoozed(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<Vec<DecisionCard>, CardStoreError> {
        self.filtered(tenant_id, |c| c.is_due(now))
    }

    async fn decided_before(
        &self,
        tenant_id: TenantId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<DecisionCard>, CardStoreError> {
        self.filtered(tenant_id, |c| {
            c.status() == CardStatus::Decided && c.decision().is_some_and(|d| d.decided_at <= cutoff)
        })
    }
}
