//! Scheduler module - turns ingestion events into reconciliations.
//!
//! # Key Concepts
//! - Worker: one task per budget id, draining coalesced work until idle
//! - Pipeline: detect, analyze, apply strategy, emit events
//! - Cancellation: checked between stages; never mid-write
//!
//! Per budget the state machine is `idle -> running -> idle`. Events for a
//! running budget wait in a single pending slot (newest update wins, a
//! deletion always wins) instead of starting a second worker.

mod registry;

pub use registry::{Claim, InFlightRegistry, RunState, Work};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::alternatives::AlternativeFinder;
use crate::budget::{Budget, BudgetBook};
use crate::detect::{ChangeDetector, ChangeSet};
use crate::error::ReconcileError;
use crate::events::{AlternativesReason, DomainEvent, EventEmitter, InboundEvent};
use crate::impact::ImpactAnalyzer;
use crate::strategy::{InvalidationReason, StrategyExecutor, StrategyKind};

/// Result of dispatching an inbound event to one budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub budget_id: Uuid,
    pub claim: Claim,
}

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Workers that finished within the grace period.
    pub completed: Vec<Uuid>,
    /// Workers still running when the grace period ran out.
    pub abandoned: Vec<Uuid>,
}

/// Collaborators the pipeline runs on.
pub struct Pipeline {
    pub book: Arc<BudgetBook>,
    pub detector: ChangeDetector,
    pub analyzer: ImpactAnalyzer,
    pub executor: StrategyExecutor,
    pub finder: Arc<AlternativeFinder>,
    pub emitter: Arc<dyn EventEmitter>,
}

struct Inner {
    pipeline: Pipeline,
    registry: InFlightRegistry,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ReconciliationScheduler {
    inner: Arc<Inner>,
}

impl ReconciliationScheduler {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipeline,
                registry: InFlightRegistry::new(),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Route an ingestion event to every active budget quoting the package.
    pub async fn handle(&self, event: InboundEvent) -> Result<Vec<Dispatch>, ReconcileError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ReconcileError::SchedulerClosed);
        }

        let affected: Vec<Budget> = self
            .inner
            .pipeline
            .book
            .affected_by(event.package_id())
            .await?
            .into_iter()
            .filter(|b| b.package.provider_id == event.provider_id())
            .collect();

        tracing::info!(
            package_id = event.package_id(),
            provider_id = event.provider_id(),
            affected = affected.len(),
            "Package event received"
        );

        let work = match event {
            InboundEvent::PackageUpdated { snapshot, .. } => Work::Update(snapshot),
            InboundEvent::PackageDeleted { .. } => Work::Withdraw,
        };

        let mut dispatched = Vec::with_capacity(affected.len());
        for budget in affected {
            let claim = self.submit(budget.id, work.clone())?;
            dispatched.push(Dispatch {
                budget_id: budget.id,
                claim,
            });
        }
        Ok(dispatched)
    }

    /// Queue `work` for one budget, starting a worker if none is running.
    ///
    /// Refused with `SchedulerClosed` once shutdown has drained the registry,
    /// even when the caller passed the check in `handle` before it began.
    pub fn submit(&self, budget_id: Uuid, work: Work) -> Result<Claim, ReconcileError> {
        let inner = self.inner.clone();
        self.inner
            .registry
            .claim(budget_id, work, &self.inner.shutdown, move |cancel, work| {
                tokio::spawn(run_worker(inner, budget_id, work, cancel))
            })
    }

    pub fn state(&self, budget_id: Uuid) -> RunState {
        self.inner.registry.state(budget_id)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.registry.in_flight()
    }

    pub async fn wait_idle(&self) {
        self.inner.registry.wait_idle().await
    }

    /// Periodically expire lapsed quotes until shutdown.
    pub fn spawn_expiry_sweep(&self, period: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match inner.pipeline.book.expire_due(Utc::now()).await {
                            Ok(expired) if !expired.is_empty() => {
                                tracing::info!(count = expired.len(), "Expired lapsed budgets");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::warn!(error = %e, "Expiry sweep failed"),
                        }
                    }
                }
            }
            tracing::debug!("Expiry sweep stopped");
        })
    }

    /// Stop accepting events, cancel workers and wait up to `grace` for them.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();

        let drained = self.inner.registry.drain();
        tracing::info!(workers = drained.len(), grace_ms = grace.as_millis() as u64, "Shutting down scheduler");

        let deadline = tokio::time::Instant::now() + grace;
        let waits = drained.into_iter().map(|entry| async move {
            if let Some(pending) = &entry.pending {
                tracing::warn!(
                    budget_id = %entry.budget_id,
                    work = pending.name(),
                    "Dropping queued work at shutdown"
                );
            }
            let finished = match entry.handle {
                Some(mut handle) => {
                    match tokio::time::timeout_at(deadline, &mut handle).await {
                        Ok(_) => true,
                        Err(_) => {
                            handle.abort();
                            false
                        }
                    }
                }
                None => true,
            };
            (entry.budget_id, finished)
        });

        let mut report = ShutdownReport::default();
        for (budget_id, finished) in join_all(waits).await {
            if finished {
                report.completed.push(budget_id);
            } else {
                tracing::warn!(budget_id = %budget_id, "Reconciliation abandoned at shutdown");
                report.abandoned.push(budget_id);
            }
        }
        report.completed.sort();
        report.abandoned.sort();
        report
    }
}

async fn run_worker(inner: Arc<Inner>, budget_id: Uuid, mut work: Work, cancel: CancellationToken) {
    loop {
        tracing::debug!(budget_id = %budget_id, work = work.name(), "Worker picked up work");
        if let Err(e) = inner.reconcile(budget_id, &work, &cancel).await {
            match &e {
                ReconcileError::Cancelled(_) => {
                    tracing::info!(budget_id = %budget_id, "Reconciliation cancelled");
                }
                _ => {
                    tracing::error!(budget_id = %budget_id, error = %e, "Reconciliation failed");
                    inner
                        .pipeline
                        .emitter
                        .emit(DomainEvent::BudgetReconstructionFailed {
                            budget_id,
                            reason: format!("{}: {}", e.code(), e),
                        })
                        .await;
                }
            }
        }

        if cancel.is_cancelled() {
            if let Some(pending) = inner.registry.release(budget_id) {
                tracing::warn!(budget_id = %budget_id, work = pending.name(), "Dropping queued work after cancellation");
            }
            break;
        }
        match inner.registry.next_or_release(budget_id) {
            Some(next) => work = next,
            None => break,
        }
    }
}

impl Inner {
    async fn reconcile(
        &self,
        budget_id: Uuid,
        work: &Work,
        cancel: &CancellationToken,
    ) -> Result<(), ReconcileError> {
        let p = &self.pipeline;
        let budget = p.book.get(budget_id).await?;
        if !budget.is_active() {
            tracing::debug!(budget_id = %budget_id, status = %budget.status, "Budget no longer active, skipping");
            return Ok(());
        }

        let (changes, invalidation) = match work {
            Work::Update(current) if p.detector.identity_changed(&budget.package, current) => {
                tracing::info!(
                    budget_id = %budget_id,
                    currency = %current.currency,
                    destination = %current.destination,
                    origin = %current.origin,
                    "Package currency or route changed"
                );
                (
                    ChangeSet::withdrawal(&budget.package, current.captured_at),
                    Some(InvalidationReason::PackageChanged),
                )
            }
            Work::Update(current) => (p.detector.detect(&budget.package, current), None),
            Work::Withdraw => (
                ChangeSet::withdrawal(&budget.package, Utc::now()),
                Some(InvalidationReason::PackageDeleted),
            ),
        };
        if changes.is_empty() {
            tracing::debug!(budget_id = %budget_id, "No field changed");
            return Ok(());
        }
        if !p.detector.requires_reconciliation(&changes) {
            tracing::debug!(
                budget_id = %budget_id,
                changed = ?changes.changed_fields(),
                "Cosmetic change, not reconciling"
            );
            return Ok(());
        }

        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled(budget_id));
        }
        let assessment = p.analyzer.analyze(&changes, &budget);
        tracing::info!(
            budget_id = %budget_id,
            severity = assessment.severity,
            strategy = %assessment.recommended_strategy,
            alternatives_required = assessment.alternatives_required,
            "Change assessed"
        );
        if p.analyzer.policy().is_high_impact(assessment.severity) {
            p.emitter
                .emit(DomainEvent::BudgetImpactHigh {
                    budget_id,
                    impact: assessment.clone(),
                })
                .await;
        }

        if let Some(reason) = invalidation {
            if cancel.is_cancelled() {
                return Err(ReconcileError::Cancelled(budget_id));
            }
            let invalid = p
                .executor
                .invalidate(&budget, &changes, &assessment, reason, cancel)
                .await?;
            p.emitter
                .emit(DomainEvent::BudgetInvalidated {
                    budget_id,
                    version: invalid.version,
                    reason: reason.to_string(),
                })
                .await;
            return Ok(());
        }

        let strategy = assessment.recommended_strategy;
        if assessment.alternatives_required && strategy != StrategyKind::BestAlternative {
            match p.finder.find_alternatives(&budget, &changes).await {
                Ok(found) if !found.is_empty() => {
                    p.emitter
                        .emit(DomainEvent::AlternativesFound {
                            budget_id,
                            alternatives: found,
                            reason: AlternativesReason::HighImpactChanges,
                        })
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(budget_id = %budget_id, error = %e, "Informational alternative search failed");
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled(budget_id));
        }
        let outcome = p
            .executor
            .apply(&budget, &changes, &assessment, strategy, cancel)
            .await?;

        if strategy == StrategyKind::BestAlternative && !outcome.alternatives.is_empty() {
            p.emitter
                .emit(DomainEvent::AlternativesFound {
                    budget_id,
                    alternatives: outcome.alternatives.clone(),
                    reason: AlternativesReason::BestAlternativeSearch,
                })
                .await;
        }
        p.emitter
            .emit(DomainEvent::BudgetReconstructed {
                budget_id,
                version: outcome.budget.version,
                impact: assessment,
                strategy_used: outcome.strategy_used,
                fell_back_from: outcome.fell_back_from,
                timestamp: Utc::now(),
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alternatives::{CatalogSearch, ProviderSearch};
    use crate::budget::{BudgetStatus, ModificationKind, NewBudget};
    use crate::impact::{AlternativePolicy, PolicyTable};
    use crate::package::{Accommodation, PackageSnapshot};
    use crate::storage::{InMemoryStorage, RetryConfig, StorageBackend};
    use crate::testing::{
        date, owner, snapshot, FlakyStorage, GaugeStorage, RecordingEmitter, StallingStorage,
    };
    use crate::versioning::VersionStore;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    struct Harness {
        scheduler: ReconciliationScheduler,
        book: Arc<BudgetBook>,
        events: Arc<RecordingEmitter>,
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn harness_with(
        storage: Arc<dyn StorageBackend>,
        providers: Vec<Arc<dyn ProviderSearch>>,
    ) -> Harness {
        let policy = PolicyTable::default();
        let versions = Arc::new(VersionStore::new(storage.clone(), fast_retry()));
        let book = Arc::new(BudgetBook::new(
            storage,
            versions,
            fast_retry(),
            chrono::Duration::hours(168),
        ));
        let finder = Arc::new(AlternativeFinder::new(providers, AlternativePolicy::default()));
        let events = Arc::new(RecordingEmitter::default());
        let scheduler = ReconciliationScheduler::new(Pipeline {
            book: book.clone(),
            detector: ChangeDetector::new(policy.significance),
            analyzer: ImpactAnalyzer::new(policy),
            executor: StrategyExecutor::new(book.clone(), finder.clone()),
            finder,
            emitter: events.clone(),
        });
        Harness {
            scheduler,
            book,
            events,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InMemoryStorage::new()), vec![])
    }

    async fn open(book: &BudgetBook, price: i64) -> Budget {
        book.create(NewBudget {
            package: snapshot("PKG-1", price),
            owner: owner(),
            margin: Decimal::new(20, 2),
            metadata: BTreeMap::new(),
        })
        .await
        .unwrap()
    }

    fn updated(snapshot: PackageSnapshot) -> InboundEvent {
        InboundEvent::PackageUpdated {
            package_id: snapshot.id.clone(),
            provider_id: snapshot.provider_id.clone(),
            timestamp: snapshot.captured_at,
            snapshot,
        }
    }

    fn priced(price: i64) -> InboundEvent {
        updated(snapshot("PKG-1", price))
    }

    fn deleted() -> InboundEvent {
        InboundEvent::PackageDeleted {
            package_id: "PKG-1".to_string(),
            provider_id: "ola".to_string(),
        }
    }

    #[tokio::test]
    async fn test_price_rise_preserves_margin() {
        let h = harness();
        let budget = open(&h.book, 1000).await;

        let dispatched = h.scheduler.handle(priced(1100)).await.unwrap();
        assert_eq!(dispatched, vec![Dispatch { budget_id: budget.id, claim: Claim::Started }]);
        h.scheduler.wait_idle().await;

        let stored = h.book.get(budget.id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.final_price, Decimal::new(132000, 2));
        assert_eq!(h.events.names(), vec!["budget_reconstructed"]);
        match &h.events.events()[0] {
            DomainEvent::BudgetReconstructed { strategy_used, version, impact, .. } => {
                assert_eq!(*strategy_used, StrategyKind::PreserveMargin);
                assert_eq!(*version, 2);
                assert!((impact.severity - 0.6).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cosmetic_change_is_ignored() {
        let h = harness();
        let budget = open(&h.book, 1000).await;
        h.scheduler.handle(priced(1030)).await.unwrap();
        h.scheduler.wait_idle().await;

        assert_eq!(h.book.get(budget.id).await.unwrap().version, 1);
        assert!(h.events.names().is_empty());
    }

    #[tokio::test]
    async fn test_removed_date_triggers_reconciliation() {
        let h = harness();
        let budget = open(&h.book, 1000).await;
        let mut current = budget.package.clone();
        current.availability.remove(&date(2025, 3, 2));

        h.scheduler.handle(updated(current.clone())).await.unwrap();
        h.scheduler.wait_idle().await;

        let stored = h.book.get(budget.id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.package.availability, current.availability);
        assert_eq!(stored.final_price, budget.final_price);
    }

    #[tokio::test]
    async fn test_trip_change_without_price_move_is_reconciled() {
        let h = harness();
        let budget = open(&h.book, 1000).await;
        let mut current = budget.package.clone();
        current.duration_days = 11;
        current.accommodation = Accommodation::new("hostel", 2.0);

        h.scheduler.handle(updated(current)).await.unwrap();
        h.scheduler.wait_idle().await;

        let stored = h.book.get(budget.id).await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.package.duration_days, 11);
        assert_eq!(stored.package.accommodation.kind, "hostel");
        assert_eq!(stored.final_price, budget.final_price);
        assert_eq!(
            stored.modifications.last().unwrap().kind,
            ModificationKind::ProportionalAdjustment
        );
        assert_eq!(h.events.names(), vec!["budget_reconstructed"]);
    }

    #[tokio::test]
    async fn test_currency_change_invalidates_budget() {
        let h = harness();
        let budget = open(&h.book, 1000).await;
        let mut current = budget.package.clone();
        current.currency = "EUR".to_string();

        h.scheduler.handle(updated(current)).await.unwrap();
        h.scheduler.wait_idle().await;

        let stored = h.book.get(budget.id).await.unwrap();
        assert_eq!(stored.status, BudgetStatus::Invalid);
        assert_eq!(stored.package.currency, budget.package.currency);
        assert_eq!(stored.metadata["invalidated_reason"], serde_json::json!("package_changed"));
        assert!(h.events.names().contains(&"budget_invalidated"));
        assert!(!h.events.names().contains(&"budget_reconstructed"));
    }

    #[tokio::test]
    async fn test_deletion_invalidates_without_repricing() {
        let h = harness();
        let budget = open(&h.book, 1000).await;
        h.scheduler.handle(deleted()).await.unwrap();
        h.scheduler.wait_idle().await;

        let stored = h.book.get(budget.id).await.unwrap();
        assert_eq!(stored.status, BudgetStatus::Invalid);
        assert_eq!(stored.final_price, budget.final_price);
        assert!(h.events.names().contains(&"budget_invalidated"));
        assert!(!h.events.names().contains(&"budget_reconstructed"));

        // Invalid budgets are no longer affected by package events
        let dispatched = h.scheduler.handle(priced(1500)).await.unwrap();
        assert!(dispatched.is_empty());
    }

    #[tokio::test]
    async fn test_high_impact_without_substitute_falls_back() {
        let h = harness();
        let budget = open(&h.book, 1000).await;
        let mut current = budget.package.clone();
        current.price = Decimal::from(1500);
        current.duration_days += 3;
        current.accommodation = Accommodation::new("hostel", 2.0);

        h.scheduler.handle(updated(current)).await.unwrap();
        h.scheduler.wait_idle().await;

        assert_eq!(h.events.names(), vec!["budget_impact_high", "budget_reconstructed"]);
        match &h.events.events()[1] {
            DomainEvent::BudgetReconstructed { strategy_used, fell_back_from, .. } => {
                assert_eq!(*strategy_used, StrategyKind::PreservePrice);
                assert_eq!(*fell_back_from, Some(StrategyKind::BestAlternative));
            }
            other => panic!("unexpected {:?}", other),
        }
        let stored = h.book.get(budget.id).await.unwrap();
        assert_eq!(stored.final_price, budget.final_price);
    }

    #[tokio::test]
    async fn test_high_impact_surfaces_informational_alternatives() {
        let mut alt = snapshot("PKG-ALT", 1010);
        alt.provider_id = "aero".to_string();
        let catalog: Arc<dyn ProviderSearch> = Arc::new(CatalogSearch::with_packages("aero", vec![alt]));
        let h = harness_with(Arc::new(InMemoryStorage::new()), vec![catalog]);
        let budget = open(&h.book, 1000).await;
        let mut current = budget.package.clone();
        current.price = Decimal::from(1100);
        current.duration_days += 1;

        // 0.6 price + 0.1 duration: preserve_price band, alternatives required
        h.scheduler.handle(updated(current)).await.unwrap();
        h.scheduler.wait_idle().await;

        assert_eq!(
            h.events.names(),
            vec!["budget_impact_high", "alternatives_found", "budget_reconstructed"]
        );
        match &h.events.events()[1] {
            DomainEvent::AlternativesFound { reason, alternatives, .. } => {
                assert_eq!(*reason, AlternativesReason::HighImpactChanges);
                assert_eq!(alternatives[0].package.id, "PKG-ALT");
            }
            other => panic!("unexpected {:?}", other),
        }
        let stored = h.book.get(budget.id).await.unwrap();
        assert_eq!(stored.package.id, "PKG-1");
        assert_eq!(
            stored.modifications.last().unwrap().kind,
            ModificationKind::PricePreservation
        );
    }

    #[tokio::test]
    async fn test_burst_coalesces_behind_running_worker() {
        let storage = Arc::new(StallingStorage::new());
        let h = harness_with(storage.clone(), vec![]);
        let budget = open(&h.book, 1000).await;

        storage.stall();
        assert_eq!(h.scheduler.handle(priced(1100)).await.unwrap()[0].claim, Claim::Started);
        storage.entered.notified().await;

        for price in [1200, 1300, 1400] {
            let dispatched = h.scheduler.handle(priced(price)).await.unwrap();
            assert_eq!(dispatched[0].claim, Claim::Queued);
        }
        assert_eq!(
            h.scheduler.state(budget.id),
            RunState::Running { pending: Some("update") }
        );

        storage.release();
        h.scheduler.wait_idle().await;

        let stored = h.book.get(budget.id).await.unwrap();
        assert_eq!(stored.version, 3);
        assert_eq!(stored.package.price, Decimal::from(1400));
        assert_eq!(h.scheduler.state(budget.id), RunState::Idle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_burst_runs_one_worker() {
        let storage = Arc::new(GaugeStorage::new());
        let h = harness_with(storage.clone(), vec![]);
        let budget = open(&h.book, 1000).await;
        let sibling = open(&h.book, 1000).await;

        let sends = (0..16).map(|i| {
            let scheduler = h.scheduler.clone();
            tokio::spawn(async move { scheduler.handle(priced(1100 + i * 100)).await })
        });
        let mut started = 0;
        for result in join_all(sends).await {
            let dispatched = result.unwrap().unwrap();
            assert_eq!(dispatched.len(), 2);
            started += dispatched.iter().filter(|d| d.claim == Claim::Started).count();
            assert!(h.scheduler.in_flight() <= 2);
        }
        h.scheduler.wait_idle().await;

        assert!(started >= 2);
        for id in [budget.id, sibling.id] {
            assert_eq!(storage.peak_for(id), 1);
            let history = h.book.versions().history(id).await.unwrap();
            assert!(history.windows(2).all(|w| w[1].version == w[0].version
                || w[1].version == w[0].version + 1));
        }
    }

    #[tokio::test]
    async fn test_exhausted_retries_release_the_slot() {
        let storage = Arc::new(FlakyStorage::new());
        let h = harness_with(storage.clone(), vec![]);
        let budget = open(&h.book, 1000).await;

        storage.fail_next(3);
        h.scheduler.handle(priced(1100)).await.unwrap();
        h.scheduler.wait_idle().await;

        assert_eq!(h.events.names(), vec!["budget_reconstruction_failed"]);
        assert_eq!(h.book.get(budget.id).await.unwrap().version, 1);
        assert_eq!(h.scheduler.state(budget.id), RunState::Idle);

        // A later event reconciles normally
        h.scheduler.handle(priced(1100)).await.unwrap();
        h.scheduler.wait_idle().await;
        assert_eq!(h.book.get(budget.id).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_validation_failure_is_reported() {
        let h = harness();
        let budget = open(&h.book, 1000).await;
        h.scheduler.handle(priced(0)).await.unwrap();
        h.scheduler.wait_idle().await;

        assert!(h.events.names().contains(&"budget_reconstruction_failed"));
        let latest = h.book.versions().latest(budget.id).await.unwrap().unwrap();
        assert_eq!(latest.version, 1);
        assert_eq!(
            h.book.versions().reconstruct(budget.id, 1).await.unwrap(),
            budget
        );
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_other_budgets() {
        let storage = Arc::new(InMemoryStorage::new());
        let h = harness_with(storage, vec![]);
        let doomed = open(&h.book, 1000).await;
        let other_pkg = snapshot("PKG-2", 1000);
        let healthy = h
            .book
            .create(NewBudget {
                package: other_pkg.clone(),
                owner: owner(),
                margin: Decimal::new(20, 2),
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();

        h.scheduler.handle(priced(0)).await.unwrap();
        let mut raised = other_pkg;
        raised.price = Decimal::from(1100);
        h.scheduler.handle(updated(raised)).await.unwrap();
        h.scheduler.wait_idle().await;

        assert_eq!(h.book.get(doomed.id).await.unwrap().version, 1);
        assert_eq!(h.book.get(healthy.id).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_shutdown_reports_abandoned_workers() {
        let storage = Arc::new(StallingStorage::new());
        let h = harness_with(storage.clone(), vec![]);
        let budget = open(&h.book, 1000).await;

        storage.stall();
        h.scheduler.handle(priced(1100)).await.unwrap();
        storage.entered.notified().await;
        h.scheduler.handle(priced(1200)).await.unwrap();

        let report = h.scheduler.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report.abandoned, vec![budget.id]);
        assert!(report.completed.is_empty());
        assert_eq!(h.scheduler.in_flight(), 0);

        let err = h.scheduler.handle(priced(1300)).await.unwrap_err();
        assert!(matches!(err, ReconcileError::SchedulerClosed));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_refused() {
        let h = harness();
        let budget = open(&h.book, 1000).await;
        h.scheduler.shutdown(Duration::from_millis(10)).await;

        // A caller that passed the closed check in `handle` before shutdown
        let err = h.scheduler.submit(budget.id, Work::Withdraw).unwrap_err();
        assert!(matches!(err, ReconcileError::SchedulerClosed));
        assert_eq!(h.scheduler.in_flight(), 0);
        assert_eq!(h.book.get(budget.id).await.unwrap().status, BudgetStatus::Active);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_cooperative_workers() {
        let h = harness();
        let report = h.scheduler.shutdown(Duration::from_millis(50)).await;
        assert_eq!(report, ShutdownReport::default());
    }

    #[tokio::test]
    async fn test_expiry_sweep_stops_on_shutdown() {
        let h = harness();
        let sweep = h.scheduler.spawn_expiry_sweep(Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.scheduler.shutdown(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(1), sweep)
            .await
            .unwrap()
            .unwrap();
    }
}
