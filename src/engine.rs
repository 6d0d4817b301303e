//! Engine wiring: one place that builds every collaborator.

use std::sync::Arc;

use chrono::Duration;

use crate::alternatives::{AlternativeFinder, ProviderSearch};
use crate::budget::BudgetBook;
use crate::detect::ChangeDetector;
use crate::events::EventEmitter;
use crate::impact::{ImpactAnalyzer, PolicyTable};
use crate::scheduler::{Pipeline, ReconciliationScheduler};
use crate::storage::{RetryConfig, StorageBackend};
use crate::strategy::StrategyExecutor;
use crate::versioning::VersionStore;

/// Tunables the engine is built from.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub policy: PolicyTable,
    pub retry: RetryConfig,
    /// How long a fresh quote stays valid.
    pub quote_ttl: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            policy: PolicyTable::default(),
            retry: RetryConfig::default(),
            quote_ttl: Duration::hours(168),
        }
    }
}

pub struct Engine {
    pub book: Arc<BudgetBook>,
    pub versions: Arc<VersionStore>,
    pub finder: Arc<AlternativeFinder>,
    pub analyzer: ImpactAnalyzer,
    pub scheduler: ReconciliationScheduler,
}

impl Engine {
    pub fn new(
        settings: EngineSettings,
        storage: Arc<dyn StorageBackend>,
        emitter: Arc<dyn EventEmitter>,
        providers: Vec<Arc<dyn ProviderSearch>>,
    ) -> Self {
        let EngineSettings {
            policy,
            retry,
            quote_ttl,
        } = settings;

        let versions = Arc::new(VersionStore::new(storage.clone(), retry));
        let book = Arc::new(BudgetBook::new(storage, versions.clone(), retry, quote_ttl));
        let finder = Arc::new(AlternativeFinder::new(providers, policy.alternatives));
        let analyzer = ImpactAnalyzer::new(policy.clone());

        let scheduler = ReconciliationScheduler::new(Pipeline {
            book: book.clone(),
            detector: ChangeDetector::new(policy.significance),
            analyzer: analyzer.clone(),
            executor: StrategyExecutor::new(book.clone(), finder.clone()),
            finder: finder.clone(),
            emitter,
        });

        tracing::info!(
            providers = finder.provider_count(),
            quote_ttl_hours = quote_ttl.num_hours(),
            retry_attempts = retry.max_attempts,
            "Reconciliation engine ready"
        );

        Self {
            book,
            versions,
            finder,
            analyzer,
            scheduler,
        }
    }
}
