//! Versioning module - append-only checkpoint chains and replay.
//!
//! # Key Concepts
//! - Checkpoint: full budget snapshot at one version, digest-sealed
//! - Chain: the ordered checkpoints of one budget; the audit trail
//! - Replay: folding the chain up to a version reconstructs that version
//!
//! A chain only ever grows. A new checkpoint either re-records the latest
//! version with an identical digest or advances the version by exactly one.

mod checkpoint;
mod delta;

pub use checkpoint::{digest, Checkpoint, CheckpointTag};
pub use delta::{BudgetDelta, ModificationChange};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::budget::{Budget, PricingAnchor};
use crate::error::ReconcileError;
use crate::storage::{
    from_document, to_document, with_retry, Query, RetryConfig, StorageBackend, StorageError,
    CHECKPOINTS,
};

#[derive(Debug, Clone)]
struct Tail {
    version: u64,
    sequence: u64,
    digest: String,
}

/// Checkpoint store over a storage collaborator.
pub struct VersionStore {
    storage: Arc<dyn StorageBackend>,
    retry: RetryConfig,
    /// Per-budget append lock with the cached chain tail.
    tails: StdMutex<HashMap<Uuid, Arc<Mutex<Option<Tail>>>>>,
}

impl VersionStore {
    pub fn new(storage: Arc<dyn StorageBackend>, retry: RetryConfig) -> Self {
        Self {
            storage,
            retry,
            tails: StdMutex::new(HashMap::new()),
        }
    }

    fn tail_slot(&self, budget_id: Uuid) -> Arc<Mutex<Option<Tail>>> {
        let mut tails = self.tails.lock().unwrap_or_else(|e| e.into_inner());
        tails.entry(budget_id).or_default().clone()
    }

    /// Drop the cached tail of `budget_id`; the next append reloads it.
    pub fn forget(&self, budget_id: Uuid) {
        let mut tails = self.tails.lock().unwrap_or_else(|e| e.into_inner());
        tails.remove(&budget_id);
    }

    #[cfg(test)]
    pub(crate) fn cached_tails(&self) -> usize {
        self.tails.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Append a checkpoint of `budget`.
    pub async fn checkpoint(
        &self,
        budget: &Budget,
        tag: CheckpointTag,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Result<Checkpoint, ReconcileError> {
        let slot = self.tail_slot(budget.id);
        let mut tail = slot.lock().await;
        if tail.is_none() {
            *tail = self.load_tail(budget.id).await?;
        }

        let digest = digest(budget)?;
        let sequence = match tail.as_ref() {
            None if budget.version == 1 => 0,
            None => {
                return Err(ReconcileError::VersionConflict {
                    budget_id: budget.id,
                    expected: 1,
                    found: budget.version,
                })
            }
            Some(t) if budget.version == t.version && digest == t.digest => t.sequence + 1,
            Some(t) if budget.version == t.version + 1 => t.sequence + 1,
            Some(t) => {
                return Err(ReconcileError::VersionConflict {
                    budget_id: budget.id,
                    expected: t.version + 1,
                    found: budget.version,
                })
            }
        };

        let checkpoint = Checkpoint {
            budget_id: budget.id,
            version: budget.version,
            sequence,
            tag,
            snapshot: budget.clone(),
            digest,
            metadata,
            recorded_at: Utc::now(),
        };
        let id = checkpoint.id();
        let doc = to_document(&checkpoint)?;
        let (storage, id) = (&self.storage, id.as_str());
        with_retry(&self.retry, "save_checkpoint", move || {
            storage.save(CHECKPOINTS, id, doc.clone())
        })
        .await?;

        tracing::debug!(
            budget_id = %budget.id,
            version = budget.version,
            sequence,
            tag = tag.as_str(),
            "Checkpoint recorded"
        );
        *tail = Some(Tail {
            version: checkpoint.version,
            sequence,
            digest: checkpoint.digest.clone(),
        });
        Ok(checkpoint)
    }

    async fn load_tail(&self, budget_id: Uuid) -> Result<Option<Tail>, ReconcileError> {
        Ok(self.history(budget_id).await?.pop().map(|c| Tail {
            version: c.version,
            sequence: c.sequence,
            digest: c.digest,
        }))
    }

    /// The full chain of `budget_id`, oldest first.
    pub async fn history(&self, budget_id: Uuid) -> Result<Vec<Checkpoint>, ReconcileError> {
        let query = Query::new().eq("budget_id", budget_id.to_string());
        let storage = &self.storage;
        let query = &query;
        let docs = with_retry(&self.retry, "find_checkpoints", move || {
            storage.find(CHECKPOINTS, query, None)
        })
        .await?;
        let mut chain = docs
            .into_iter()
            .map(from_document::<Checkpoint>)
            .collect::<Result<Vec<_>, StorageError>>()?;
        chain.sort_by_key(|c| c.sequence);
        Ok(chain)
    }

    pub async fn latest(&self, budget_id: Uuid) -> Result<Option<Checkpoint>, ReconcileError> {
        Ok(self.history(budget_id).await?.pop())
    }

    /// Replay the chain up to `target_version`.
    ///
    /// Every checkpoint folded in must pass digest verification. Calling this
    /// twice with the same arguments yields identical budgets.
    pub async fn reconstruct(
        &self,
        budget_id: Uuid,
        target_version: u64,
    ) -> Result<Budget, ReconcileError> {
        let chain = self.history(budget_id).await?;
        if chain.is_empty() {
            return Err(ReconcileError::BudgetNotFound(budget_id));
        }

        let mut state: Option<Budget> = None;
        for checkpoint in chain.into_iter().take_while(|c| c.version <= target_version) {
            if !checkpoint.verify()? {
                tracing::error!(
                    budget_id = %budget_id,
                    sequence = checkpoint.sequence,
                    "Checkpoint digest mismatch"
                );
                return Err(ReconcileError::CorruptCheckpoint {
                    budget_id,
                    sequence: checkpoint.sequence,
                });
            }
            state = Some(checkpoint.snapshot);
        }

        match state {
            Some(budget) if budget.version == target_version => Ok(budget),
            _ => Err(ReconcileError::VersionNotFound {
                budget_id,
                version: target_version,
            }),
        }
    }

    /// What changed between two recorded versions.
    pub async fn diff(
        &self,
        budget_id: Uuid,
        from_version: u64,
        to_version: u64,
    ) -> Result<BudgetDelta, ReconcileError> {
        let from = self.reconstruct(budget_id, from_version).await?;
        let to = self.reconstruct(budget_id, to_version).await?;
        Ok(BudgetDelta::between(&from, &to))
    }

    pub fn validate(budget: &Budget) -> bool {
        Self::validation_issues(budget).is_empty()
    }

    /// Broken structural invariants of `budget`, empty when valid.
    pub fn validation_issues(budget: &Budget) -> Vec<String> {
        let mut issues = Vec::new();
        if budget.version == 0 {
            issues.push("version must start at 1".to_string());
        }
        if budget.base_price <= Decimal::ZERO {
            issues.push(format!("base_price must be positive, got {}", budget.base_price));
        }
        if budget.final_price <= Decimal::ZERO {
            issues.push(format!("final_price must be positive, got {}", budget.final_price));
        }
        if budget.margin <= -Decimal::ONE {
            issues.push(format!("margin must exceed -1, got {}", budget.margin));
        }
        if budget.package.id.trim().is_empty() {
            issues.push("package reference is empty".to_string());
        }
        if budget.package.provider_id.trim().is_empty() {
            issues.push("package provider is empty".to_string());
        }
        match budget.anchor {
            PricingAnchor::Margin => match budget.derived_final_price() {
                Some(expected) if expected == budget.final_price => {}
                Some(expected) => issues.push(format!(
                    "final_price {} is not derived from margin {} (expected {})",
                    budget.final_price, budget.margin, expected
                )),
                None => issues.push(format!(
                    "final_price overflows for base_price {} and margin {}",
                    budget.base_price, budget.margin
                )),
            },
            PricingAnchor::FinalPrice if budget.derived_margin() != Some(budget.margin) => {
                issues.push(format!(
                    "margin {} is not derived from final_price {}",
                    budget.margin, budget.final_price
                ));
            }
            _ => {}
        }
        issues
    }
}
