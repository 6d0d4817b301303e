//! Persistence and lifecycle operations for budgets.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::budget::{price_with_margin, round_currency, Budget, BudgetOwner, BudgetStatus, PricingAnchor};
use super::modification::{Modification, ModificationKind};
use crate::error::ReconcileError;
use crate::package::PackageSnapshot;
use crate::storage::{
    from_document, to_document, with_retry, Query, RetryConfig, StorageBackend, StorageError,
    BUDGETS,
};
use crate::versioning::{Checkpoint, CheckpointTag, VersionStore};

/// Request to open a new budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBudget {
    pub package: PackageSnapshot,
    pub owner: BudgetOwner,
    pub margin: Decimal,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Explicit vendor change to a budget's pricing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "edit", content = "value", rename_all = "snake_case")]
pub enum VendorEdit {
    /// Anchor the margin; the final price follows the base price.
    SetMargin(Decimal),
    /// Anchor the final price; the margin is derived.
    SetFinalPrice(Decimal),
}

/// Writes budgets and keeps their checkpoint chains in step.
pub struct BudgetBook {
    storage: Arc<dyn StorageBackend>,
    versions: Arc<VersionStore>,
    retry: RetryConfig,
    quote_ttl: chrono::Duration,
    /// Serializes writers of the same budget.
    locks: StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl BudgetBook {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        versions: Arc<VersionStore>,
        retry: RetryConfig,
        quote_ttl: chrono::Duration,
    ) -> Self {
        Self {
            storage,
            versions,
            retry,
            quote_ttl,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn versions(&self) -> &Arc<VersionStore> {
        &self.versions
    }

    fn lease(&self, budget_id: Uuid) -> LockLease<'_> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        let lock = locks.entry(budget_id).or_default().clone();
        LockLease {
            locks: &self.locks,
            budget_id,
            lock,
        }
    }

    #[cfg(test)]
    pub(crate) fn cached_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Open a budget at version 1 with a `session_init` checkpoint.
    pub async fn create(&self, request: NewBudget) -> Result<Budget, ReconcileError> {
        let now = Utc::now();
        let base_price = request.package.price;
        let id = Uuid::new_v4();
        let Some(final_price) = price_with_margin(base_price, request.margin) else {
            return Err(ReconcileError::ValidationFailure {
                budget_id: id,
                issues: vec![format!(
                    "final_price overflows for base_price {} and margin {}",
                    base_price, request.margin
                )],
            });
        };
        let mut budget = Budget {
            id,
            version: 1,
            owner: request.owner,
            package: request.package,
            base_price,
            margin: request.margin,
            final_price,
            anchor: PricingAnchor::Margin,
            status: BudgetStatus::Active,
            modifications: Vec::new(),
            metadata: request.metadata,
            created_at: now,
            valid_until: now + self.quote_ttl,
        };
        budget.modifications.push(Modification::new(
            ModificationKind::SessionInit,
            budget.version,
            budget.pricing(),
        ));

        let issues = VersionStore::validation_issues(&budget);
        if !issues.is_empty() {
            return Err(ReconcileError::ValidationFailure {
                budget_id: budget.id,
                issues,
            });
        }

        self.versions
            .checkpoint(&budget, CheckpointTag::SessionInit, BTreeMap::new())
            .await?;
        let doc = to_document(&budget)?;
        let (storage, id) = (&self.storage, budget.id.to_string());
        let id = id.as_str();
        with_retry(&self.retry, "save_budget", move || {
            storage.save(BUDGETS, id, doc.clone())
        })
        .await?;

        tracing::info!(
            budget_id = %budget.id,
            package_id = %budget.package.id,
            session_id = %budget.owner.session_id,
            final_price = %budget.final_price,
            "Budget created"
        );
        Ok(budget)
    }

    pub async fn get(&self, budget_id: Uuid) -> Result<Budget, ReconcileError> {
        let (storage, id) = (&self.storage, budget_id.to_string());
        let id = id.as_str();
        let doc = with_retry(&self.retry, "get_budget", move || storage.get(BUDGETS, id)).await?;
        match doc {
            Some(doc) => Ok(from_document(doc)?),
            None => Err(ReconcileError::BudgetNotFound(budget_id)),
        }
    }

    /// Active budgets quoting `package_id`.
    pub async fn affected_by(&self, package_id: &str) -> Result<Vec<Budget>, ReconcileError> {
        self.find(Query::new().eq("package.id", package_id).eq("status", "active"))
            .await
    }

    async fn find(&self, query: Query) -> Result<Vec<Budget>, ReconcileError> {
        let (storage, query) = (&self.storage, &query);
        let docs = with_retry(&self.retry, "find_budgets", move || {
            storage.find(BUDGETS, query, None)
        })
        .await?;
        Ok(docs
            .into_iter()
            .map(from_document::<Budget>)
            .collect::<Result<Vec<_>, StorageError>>()?)
    }

    /// Persist `next` as the successor of `prev`.
    ///
    /// `prev` is checkpointed first, then `next` is validated, committed and
    /// checkpointed. A rejected `next` leaves `prev` as the latest recorded
    /// state.
    pub async fn transition(
        &self,
        prev: &Budget,
        next: Budget,
        cancel: &CancellationToken,
    ) -> Result<Budget, ReconcileError> {
        let lease = self.lease(prev.id);
        let _guard = lease.lock.lock().await;

        let stored = self.get(prev.id).await?;
        if stored.version != prev.version || next.version != prev.version + 1 {
            tracing::warn!(
                budget_id = %prev.id,
                stored = stored.version,
                prev = prev.version,
                next = next.version,
                "Stale budget version, refusing transition"
            );
            return Err(ReconcileError::VersionConflict {
                budget_id: prev.id,
                expected: prev.version,
                found: stored.version,
            });
        }

        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled(prev.id));
        }
        let mut pre_meta = BTreeMap::new();
        pre_meta.insert("next_version".to_string(), next.version.into());
        self.versions
            .checkpoint(prev, CheckpointTag::PreModification, pre_meta)
            .await?;

        let issues = VersionStore::validation_issues(&next);
        if !issues.is_empty() {
            tracing::warn!(budget_id = %next.id, version = next.version, ?issues, "Budget failed validation");
            return Err(ReconcileError::ValidationFailure {
                budget_id: next.id,
                issues,
            });
        }

        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled(prev.id));
        }
        let doc = to_document(&next)?;
        let (storage, id) = (&self.storage, next.id.to_string());
        let id = id.as_str();
        with_retry(&self.retry, "update_budget", move || {
            storage.update(BUDGETS, id, doc.clone())
        })
        .await?;

        let mut post_meta = BTreeMap::new();
        if let Some(kind) = next.modifications.last().map(|m| m.kind) {
            post_meta.insert("modification".to_string(), kind.as_str().into());
        }
        if let Err(e) = self
            .versions
            .checkpoint(&next, CheckpointTag::PostModification, post_meta)
            .await
        {
            // Committed; the next pre-checkpoint re-records this version
            tracing::error!(budget_id = %next.id, version = next.version, error = %e, "Post-modification checkpoint failed");
        }

        if !next.is_active() {
            // Terminal: nothing appends to this chain through the cache again
            self.versions.forget(next.id);
        }

        tracing::info!(
            budget_id = %next.id,
            version = next.version,
            status = %next.status,
            final_price = %next.final_price,
            "Budget version committed"
        );
        Ok(next)
    }

    /// Apply a vendor pricing change to an active budget.
    pub async fn vendor_edit(
        &self,
        budget_id: Uuid,
        edit: VendorEdit,
    ) -> Result<Budget, ReconcileError> {
        let current = self.get(budget_id).await?;
        Self::require_active(&current, "vendor_edit")?;

        let mut next = current.next_version();
        match edit {
            VendorEdit::SetMargin(margin) => {
                next.margin = margin;
                if !next.reprice_keeping_margin(next.base_price) {
                    return Err(ReconcileError::ValidationFailure {
                        budget_id,
                        issues: vec![format!(
                            "final_price overflows for base_price {} and margin {}",
                            next.base_price, margin
                        )],
                    });
                }
            }
            VendorEdit::SetFinalPrice(final_price) => {
                next.final_price = round_currency(final_price);
                next.reprice_keeping_final(next.base_price);
            }
        }
        next.modifications.push(
            Modification::new(ModificationKind::VendorAdjustment, next.version, next.pricing())
                .with_note(format!("vendor {}", next.owner.vendor_id)),
        );

        self.transition(&current, next, &CancellationToken::new())
            .await
    }

    /// Create a new version carrying the priced content of `target_version`.
    ///
    /// History is never rewound: the restored state is appended as the next
    /// version with a `version_restore` modification. Only active budgets can
    /// be restored; the restored quote gets a fresh validity window.
    pub async fn restore(
        &self,
        budget_id: Uuid,
        target_version: u64,
    ) -> Result<Budget, ReconcileError> {
        let current = self.get(budget_id).await?;
        Self::require_active(&current, "restore")?;
        let past = self.versions.reconstruct(budget_id, target_version).await?;

        let mut next = current.next_version();
        next.package = past.package;
        next.base_price = past.base_price;
        next.margin = past.margin;
        next.final_price = past.final_price;
        next.anchor = past.anchor;
        next.valid_until = Utc::now() + self.quote_ttl;
        next.set_flag("restored_from", target_version);
        next.modifications.push(
            Modification::new(ModificationKind::VersionRestore, next.version, next.pricing())
                .with_note(format!("restored from version {}", target_version)),
        );

        tracing::info!(budget_id = %budget_id, from = current.version, target_version, "Restoring budget version");
        self.transition(&current, next, &CancellationToken::new())
            .await
    }

    /// Record the end of the owning session without changing the budget.
    pub async fn close_session(&self, budget_id: Uuid) -> Result<Checkpoint, ReconcileError> {
        let lease = self.lease(budget_id);
        let _guard = lease.lock.lock().await;

        let current = self.get(budget_id).await?;
        let mut meta = BTreeMap::new();
        meta.insert(
            "session_id".to_string(),
            current.owner.session_id.clone().into(),
        );
        let checkpoint = self
            .versions
            .checkpoint(&current, CheckpointTag::SessionClose, meta)
            .await?;
        tracing::info!(budget_id = %budget_id, version = current.version, "Session closed");
        Ok(checkpoint)
    }

    /// Expire every active budget whose quote lapsed at or before `now`.
    ///
    /// Returns the ids that were expired. A failure on one budget is logged
    /// and does not stop the sweep.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, ReconcileError> {
        let due: Vec<Budget> = self
            .find(Query::new().eq("status", "active"))
            .await?
            .into_iter()
            .filter(|b| b.valid_until <= now)
            .collect();

        let mut expired = Vec::new();
        for current in due {
            let mut next = current.next_version();
            next.status = BudgetStatus::Expired;
            next.modifications.push(
                Modification::new(ModificationKind::Expiration, next.version, next.pricing())
                    .with_note(format!("quote valid until {}", current.valid_until)),
            );
            match self
                .transition(&current, next, &CancellationToken::new())
                .await
            {
                Ok(budget) => {
                    tracing::info!(budget_id = %budget.id, version = budget.version, "Budget expired");
                    expired.push(budget.id);
                }
                Err(e) => {
                    tracing::warn!(budget_id = %current.id, error = %e, "Failed to expire budget");
                }
            }
        }
        Ok(expired)
    }

    fn require_active(budget: &Budget, operation: &'static str) -> Result<(), ReconcileError> {
        if budget.is_active() {
            Ok(())
        } else {
            Err(ReconcileError::InvalidState {
                budget_id: budget.id,
                status: budget.status,
                operation,
            })
        }
    }
}

/// Holds a per-budget writer lock and drops the map entry once no other
/// writer shares it.
struct LockLease<'a> {
    locks: &'a StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    budget_id: Uuid,
    lock: Arc<Mutex<()>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // The map and this lease are the only owners left
        let idle = locks
            .get(&self.budget_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2);
        if idle {
            locks.remove(&self.budget_id);
        }
    }
}
