//! Outcome ledger and impact measurement seams.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use vantage_core::{CardId, TenantId};
use vantage_decisions::DecisionOutcomeRecord;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The ledger already holds a record for this decision.
    #[error("outcome already recorded for decision {0}")]
    AlreadyRecorded(CardId),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Append-only record of evaluated decisions.
#[async_trait]
pub trait OutcomeLedger: Send + Sync {
    async fn append(&self, record: &DecisionOutcomeRecord) -> Result<(), LedgerError>;

    /// Oldest first.
    async fn list(&self, tenant_id: TenantId) -> Result<Vec<DecisionOutcomeRecord>, LedgerError>;

    /// Decisions of `tenant_id` that already have a record.
    async fn evaluated(&self, tenant_id: TenantId) -> Result<HashSet<CardId>, LedgerError>;
}

#[async_trait]
impl<S> OutcomeLedger for Arc<S>
where
    S: OutcomeLedger + ?Sized,
{
    async fn append(&self, record: &DecisionOutcomeRecord) -> Result<(), LedgerError> {
        (**self).append(record).await
    }

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<DecisionOutcomeRecord>, LedgerError> {
        (**self).list(tenant_id).await
    }

    async fn evaluated(&self, tenant_id: TenantId) -> Result<HashSet<CardId>, LedgerError> {
        (**self).evaluated(tenant_id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("impact measurement failed: {0}")]
pub struct ImpactError(pub String);

/// Measures the realized impact of a decision.
///
/// `Ok(None)` means the impact is not measurable yet.
#[async_trait]
pub trait ImpactSource: Send + Sync {
    async fn actual_impact(&self, tenant_id: TenantId, decision_id: CardId) -> Result<Option<f64>, ImpactError>;
}

#[async_trait]
impl<S> ImpactSource for Arc<S>
where
    S: ImpactSource + ?Sized,
{
    async fn actual_impact(&self, tenant_id: TenantId, decision_id: CardId) -> Result<Option<f64>, ImpactError> {
        (**self).actual_impact(tenant_id, decision_id).await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOutcomeLedger {
    records: RwLock<Vec<DecisionOutcomeRecord>>,
}

impl InMemoryOutcomeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned() -> LedgerError {
    LedgerError::Storage("outcome ledger lock poisoned".to_string())
}

#[async_trait]
impl OutcomeLedger for InMemoryOutcomeLedger {
    async fn append(&self, record: &DecisionOutcomeRecord) -> Result<(), LedgerError> {
        let mut records = self.records.write().map_err(|_| poisoned())?;
        if records.iter().any(|r| r.decision_id == record.decision_id) {
            return Err(LedgerError::AlreadyRecorded(record.decision_id));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn list(&self, tenant_id: TenantId) -> Result<Vec<DecisionOutcomeRecord>, LedgerError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records.iter().filter(|r| r.tenant_id == tenant_id).cloned().collect())
    }

    async fn evaluated(&self, tenant_id: TenantId) -> Result<HashSet<CardId>, LedgerError> {
        let records = self.records.read().map_err(|_| poisoned())?;
        Ok(records
            .iter()
            .filter(|r| r.tenant_id == tenant_id)
            .map(|r| r.decision_id)
            .collect())
    }
}

/// Fixed measurements keyed by decision, for tests and local runs.
#[derive(Debug, Default)]
pub struct StaticImpactSource {
    impacts: RwLock<HashMap<(TenantId, CardId), f64>>,
}

impl StaticImpactSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn set(&self, tenant_id: TenantId, decision_id: CardId, actual: f64) {
        if let Ok(mut impacts) = self.impacts.write() {
            impacts.insert((tenant_id, decision_id), actual);
        }
    }
}

#[async_trait]
impl ImpactSource for StaticImpactSource {
    async fn actual_impact(&self, tenant_id: TenantId, decision_id: CardId) -> Result<Option<f64>, ImpactError> {
        let impacts = self
            .impacts
            .read()
            .map_err(|_| ImpactError("impact table lock poisoned".to_string()))?;
        Ok(impacts.get(&(tenant_id, decision_id)).copied())
    }
}
