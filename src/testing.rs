//! Fixtures and collaborator doubles shared by unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::alternatives::{ProviderResult, ProviderSearch, ProviderSearchError, SearchCriteria};
use crate::budget::{
    round_currency, Budget, BudgetOwner, BudgetStatus, Modification, ModificationKind,
    PricingAnchor,
};
use crate::events::{DomainEvent, EventEmitter};
use crate::package::{Accommodation, PackageSnapshot};
use crate::storage::{
    Document, InMemoryStorage, Query, StorageBackend, StorageError, BUDGETS, CHECKPOINTS,
};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn captured() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 12, 0, 0).unwrap()
}

/// A seven-night Cancun package from provider "ola".
pub fn snapshot(id: &str, price: i64) -> PackageSnapshot {
    PackageSnapshot {
        id: id.to_string(),
        provider_id: "ola".to_string(),
        destination: "Cancun".to_string(),
        origin: "Buenos Aires".to_string(),
        duration_days: 7,
        currency: "USD".to_string(),
        price: Decimal::from(price),
        taxes: Decimal::from(150),
        availability: [date(2025, 3, 2), date(2025, 3, 25), date(2025, 4, 10)]
            .into_iter()
            .collect(),
        accommodation: Accommodation::new("hotel", 4.0),
        captured_at: captured(),
    }
}

pub fn owner() -> BudgetOwner {
    BudgetOwner {
        session_id: "session-1".to_string(),
        vendor_id: "vendor-1".to_string(),
        customer_id: "customer-1".to_string(),
    }
}

/// Active version-1 budget over `snapshot("PKG-1", base)`.
pub fn budget_at(base: i64, margin: Decimal) -> Budget {
    let package = snapshot("PKG-1", base);
    let base_price = package.price;
    let final_price = round_currency(base_price * (Decimal::ONE + margin));
    let mut budget = Budget {
        id: Uuid::new_v4(),
        version: 1,
        owner: owner(),
        package,
        base_price,
        margin,
        final_price,
        anchor: PricingAnchor::Margin,
        status: BudgetStatus::Active,
        modifications: Vec::new(),
        metadata: BTreeMap::new(),
        created_at: captured(),
        valid_until: captured() + chrono::Duration::days(7),
    };
    budget
        .modifications
        .push(Modification::new(ModificationKind::SessionInit, 1, budget.pricing()));
    budget
}

/// Emitter that keeps every event in memory.
#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<DomainEvent>>,
}

impl RecordingEmitter {
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().iter().map(|e| e.name()).collect()
    }
}

#[async_trait]
impl EventEmitter for RecordingEmitter {
    async fn emit(&self, event: DomainEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Provider whose search always fails.
pub struct FailingSearch {
    provider_id: String,
}

impl FailingSearch {
    pub fn new(provider_id: &str) -> Self {
        Self {
            provider_id: provider_id.to_string(),
        }
    }
}

#[async_trait]
impl ProviderSearch for FailingSearch {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn search_packages(
        &self,
        _criteria: &SearchCriteria,
    ) -> Result<Vec<ProviderResult>, ProviderSearchError> {
        Err(ProviderSearchError::Provider {
            provider_id: self.provider_id.clone(),
            message: "connection reset".to_string(),
        })
    }
}

/// Storage whose writes fail transiently a configurable number of times.
#[derive(Default)]
pub struct FlakyStorage {
    inner: InMemoryStorage,
    failures_left: AtomicUsize,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with `Transient`.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn trip(&self) -> Result<(), StorageError> {
        let tripped = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StorageError::Transient("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageBackend for FlakyStorage {
    async fn save(&self, collection: &str, id: &str, data: Document) -> Result<(), StorageError> {
        self.trip()?;
        self.inner.save(collection, id, data).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError> {
        self.inner.get(collection, id).await
    }

    async fn update(&self, collection: &str, id: &str, data: Document) -> Result<(), StorageError> {
        self.trip()?;
        self.inner.update(collection, id, data).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        self.inner.delete(collection, id).await
    }

    async fn find(
        &self,
        collection: &str,
        query: &Query,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StorageError> {
        self.inner.find(collection, query, limit).await
    }
}

/// Storage that records how many calls touch each budget at once.
///
/// Budget reads, budget writes and checkpoint writes are gauged by budget id.
/// Each gauged call lingers for a couple of milliseconds so overlapping
/// workers show up.
#[derive(Default)]
pub struct GaugeStorage {
    inner: InMemoryStorage,
    per_budget: Mutex<HashMap<String, (usize, usize)>>,
}

impl GaugeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest number of gauged calls in flight for `budget_id`.
    pub fn peak_for(&self, budget_id: Uuid) -> usize {
        let per_budget = self.per_budget.lock().unwrap();
        per_budget.get(&budget_id.to_string()).map(|(_, peak)| *peak).unwrap_or(0)
    }

    async fn gauged<T>(&self, id: &str, call: impl std::future::Future<Output = T>) -> T {
        let key = id.split('/').next().unwrap_or(id).to_string();
        {
            let mut per_budget = self.per_budget.lock().unwrap();
            let entry = per_budget.entry(key.clone()).or_default();
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        let result = call.await;
        if let Some(entry) = self.per_budget.lock().unwrap().get_mut(&key) {
            entry.0 -= 1;
        }
        result
    }
}

#[async_trait]
impl StorageBackend for GaugeStorage {
    async fn save(&self, collection: &str, id: &str, data: Document) -> Result<(), StorageError> {
        if collection != CHECKPOINTS {
            return self.inner.save(collection, id, data).await;
        }
        self.gauged(id, self.inner.save(collection, id, data)).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError> {
        if collection != BUDGETS {
            return self.inner.get(collection, id).await;
        }
        self.gauged(id, self.inner.get(collection, id)).await
    }

    async fn update(&self, collection: &str, id: &str, data: Document) -> Result<(), StorageError> {
        if collection != BUDGETS {
            return self.inner.update(collection, id, data).await;
        }
        self.gauged(id, self.inner.update(collection, id, data)).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        self.inner.delete(collection, id).await
    }

    async fn find(
        &self,
        collection: &str,
        query: &Query,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StorageError> {
        self.inner.find(collection, query, limit).await
    }
}

/// Storage whose checkpoint writes park while stalled.
///
/// `entered` is signalled each time a write parks; `release` lets them go.
#[derive(Default)]
pub struct StallingStorage {
    inner: InMemoryStorage,
    stalled: AtomicBool,
    gate: Notify,
    pub entered: Notify,
}

impl StallingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stall(&self) {
        self.stalled.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.stalled.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
    }
}

#[async_trait]
impl StorageBackend for StallingStorage {
    async fn save(&self, collection: &str, id: &str, data: Document) -> Result<(), StorageError> {
        if collection == CHECKPOINTS && self.stalled.load(Ordering::SeqCst) {
            self.entered.notify_one();
            loop {
                let released = self.gate.notified();
                if !self.stalled.load(Ordering::SeqCst) {
                    break;
                }
                released.await;
            }
        }
        self.inner.save(collection, id, data).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError> {
        self.inner.get(collection, id).await
    }

    async fn update(&self, collection: &str, id: &str, data: Document) -> Result<(), StorageError> {
        self.inner.update(collection, id, data).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StorageError> {
        self.inner.delete(collection, id).await
    }

    async fn find(
        &self,
        collection: &str,
        query: &Query,
        limit: Option<usize>,
    ) -> Result<Vec<Document>, StorageError> {
        self.inner.find(collection, query, limit).await
    }
}
