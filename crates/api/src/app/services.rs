//! Service wiring: picks in-memory or Postgres stores and builds the
//! services every route shares.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

use vantage_core::{Clock, SystemClock};
use vantage_infra::cards::{CardService, CardStore, InMemoryCardStore, PostgresCardStore};
use vantage_infra::detection::{DetectionConfig, InMemoryRuleStore, PostgresRuleStore, RuleEngine, RuleStore};
use vantage_infra::jobs::{InMemoryJobStore, JobRegistry, JobStore, PostgresJobStore};
use vantage_infra::outcomes::{
    ImpactSource, InMemoryOutcomeLedger, OutcomeEvaluator, OutcomeLedger, PostgresImpactSource,
    PostgresOutcomeLedger, StaticImpactSource,
};
use vantage_infra::pg;
use vantage_infra::pipeline::{InMemoryProcedures, PipelineOrchestrator, PipelineProcedures, PostgresProcedures};

use crate::config::AppConfig;

/// Store handles behind every service.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub rules: Arc<dyn RuleStore>,
    pub cards: Arc<dyn CardStore>,
    pub ledger: Arc<dyn OutcomeLedger>,
    pub impacts: Arc<dyn ImpactSource>,
    pub procedures: Arc<dyn PipelineProcedures>,
}

impl Stores {
    /// Process-local stores for development and tests. Nothing survives a restart.
    pub fn in_memory() -> Self {
        Self {
            jobs: InMemoryJobStore::arc(),
            rules: InMemoryRuleStore::arc(),
            cards: InMemoryCardStore::arc(),
            ledger: InMemoryOutcomeLedger::arc(),
            impacts: StaticImpactSource::arc(),
            procedures: Arc::new(InMemoryProcedures::new()),
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            jobs: Arc::new(PostgresJobStore::new(pool.clone())),
            rules: Arc::new(PostgresRuleStore::new(pool.clone())),
            cards: Arc::new(PostgresCardStore::new(pool.clone())),
            ledger: Arc::new(PostgresOutcomeLedger::new(pool.clone())),
            impacts: Arc::new(PostgresImpactSource::new(pool.clone())),
            procedures: Arc::new(PostgresProcedures::new(pool)),
        }
    }
}

#[derive(Clone)]
pub struct AppServices {
    pub clock: Arc<dyn Clock>,
    pub registry: JobRegistry,
    pub pipeline: PipelineOrchestrator,
    pub engine: RuleEngine,
    pub cards: CardService,
    pub evaluator: OutcomeEvaluator,
}

impl AppServices {
    pub fn wire(stores: Stores, clock: Arc<dyn Clock>, config: &AppConfig) -> Self {
        let registry = JobRegistry::new(stores.jobs, clock.clone());
        let cards = CardService::new(stores.cards.clone(), clock.clone());
        let detection = DetectionConfig::default().with_card_spawn_severity(config.card_spawn_severity);
        let engine = RuleEngine::new(stores.rules, clock.clone(), detection).with_cards(cards.clone());
        let pipeline = PipelineOrchestrator::new(
            registry.clone(),
            stores.procedures,
            engine.clone(),
            clock.clone(),
            config.pipeline.clone(),
        );
        let evaluator = OutcomeEvaluator::new(stores.cards, stores.ledger, stores.impacts, clock.clone());

        Self {
            clock,
            registry,
            pipeline,
            engine,
            cards,
            evaluator,
        }
    }
}

/// Postgres stores when `DATABASE_URL` is set (schema applied on startup),
/// in-memory stores otherwise.
pub async fn build_services(config: &AppConfig) -> Result<AppServices, sqlx::Error> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let stores = match &config.database_url {
        Some(url) => {
            let pool = pg::connect(url, config.database_max_connections).await?;
            pg::migrate(&pool).await?;
            Stores::postgres(pool)
        }
        None => {
            info!("DATABASE_URL not set; using in-memory stores");
            Stores::in_memory()
        }
    };

    Ok(AppServices::wire(stores, clock, config))
}
