//! Failure taxonomy of the reconciliation engine.

use thiserror::Error;
use uuid::Uuid;

use crate::alternatives::ProviderSearchError;
use crate::budget::BudgetStatus;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A produced budget broke a structural invariant. Never retried.
    #[error("budget {budget_id} failed validation: {}", issues.join("; "))]
    ValidationFailure { budget_id: Uuid, issues: Vec<String> },

    #[error("budget {0} not found")]
    BudgetNotFound(Uuid),

    #[error("budget {budget_id} has no version {version}")]
    VersionNotFound { budget_id: Uuid, version: u64 },

    #[error("version conflict on budget {budget_id}: expected {expected}, found {found}")]
    VersionConflict {
        budget_id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("checkpoint {sequence} of budget {budget_id} failed digest verification")]
    CorruptCheckpoint { budget_id: Uuid, sequence: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    ProviderSearch(#[from] ProviderSearchError),

    #[error("reconciliation of budget {0} was cancelled")]
    Cancelled(Uuid),

    #[error("budget {budget_id} is {status}; {operation} needs an active budget")]
    InvalidState {
        budget_id: Uuid,
        status: BudgetStatus,
        operation: &'static str,
    },

    #[error("scheduler is shut down")]
    SchedulerClosed,
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BudgetNotFound(_) | Self::VersionNotFound { .. })
    }

    /// Stable short code used in outbound failure events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailure { .. } => "validation_failure",
            Self::BudgetNotFound(_) | Self::VersionNotFound { .. } => "not_found",
            Self::VersionConflict { .. } => "version_conflict",
            Self::CorruptCheckpoint { .. } => "corrupt_checkpoint",
            Self::Storage(e) if e.is_transient() => "storage_retries_exhausted",
            Self::Storage(_) => "storage_error",
            Self::ProviderSearch(_) => "provider_search_error",
            Self::Cancelled(_) => "cancelled",
            Self::InvalidState { .. } => "invalid_state",
            Self::SchedulerClosed => "scheduler_closed",
        }
    }
}
