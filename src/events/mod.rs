//! Events module - inbound ingestion events and outbound domain events.
//!
//! # Key Concepts
//! - InboundEvent: what the scraping side reports about a package
//! - DomainEvent: what downstream consumers learn about a budget
//! - EventEmitter: sink for domain events; `BroadcastEmitter` fans them out

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::alternatives::Candidate;
use crate::impact::ImpactAssessment;
use crate::package::PackageSnapshot;
use crate::strategy::StrategyKind;

/// Event emitted by package ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// A package was re-scraped; `snapshot` is its current state.
    PackageUpdated {
        package_id: String,
        provider_id: String,
        snapshot: PackageSnapshot,
        timestamp: DateTime<Utc>,
    },
    PackageDeleted {
        package_id: String,
        provider_id: String,
    },
}

impl InboundEvent {
    pub fn package_id(&self) -> &str {
        match self {
            Self::PackageUpdated { package_id, .. } | Self::PackageDeleted { package_id, .. } => {
                package_id
            }
        }
    }

    pub fn provider_id(&self) -> &str {
        match self {
            Self::PackageUpdated { provider_id, .. } | Self::PackageDeleted { provider_id, .. } => {
                provider_id
            }
        }
    }
}

/// Why an `alternatives_found` event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlternativesReason {
    /// Severity crossed the alternatives threshold; purely informational.
    HighImpactChanges,
    /// Candidates considered by the best-alternative strategy.
    BestAlternativeSearch,
}

/// Outbound notification about a budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    BudgetImpactHigh {
        budget_id: Uuid,
        impact: ImpactAssessment,
    },
    BudgetReconstructed {
        budget_id: Uuid,
        version: u64,
        impact: ImpactAssessment,
        strategy_used: StrategyKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fell_back_from: Option<StrategyKind>,
        timestamp: DateTime<Utc>,
    },
    AlternativesFound {
        budget_id: Uuid,
        alternatives: Vec<Candidate>,
        reason: AlternativesReason,
    },
    BudgetInvalidated {
        budget_id: Uuid,
        version: u64,
        reason: String,
    },
    BudgetReconstructionFailed {
        budget_id: Uuid,
        reason: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BudgetImpactHigh { .. } => "budget_impact_high",
            Self::BudgetReconstructed { .. } => "budget_reconstructed",
            Self::AlternativesFound { .. } => "alternatives_found",
            Self::BudgetInvalidated { .. } => "budget_invalidated",
            Self::BudgetReconstructionFailed { .. } => "budget_reconstruction_failed",
        }
    }

    pub fn budget_id(&self) -> Uuid {
        match self {
            Self::BudgetImpactHigh { budget_id, .. }
            | Self::BudgetReconstructed { budget_id, .. }
            | Self::AlternativesFound { budget_id, .. }
            | Self::BudgetInvalidated { budget_id, .. }
            | Self::BudgetReconstructionFailed { budget_id, .. } => *budget_id,
        }
    }
}

/// Sink for domain events. Emission never fails the pipeline.
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: DomainEvent);
}

/// Fans domain events out to any number of subscribers.
pub struct BroadcastEmitter {
    tx: broadcast::Sender<DomainEvent>,
}

impl BroadcastEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventEmitter for BroadcastEmitter {
    async fn emit(&self, event: DomainEvent) {
        tracing::debug!(budget_id = %event.budget_id(), event = event.name(), "Emitting domain event");
        // No subscribers is not an error
        let _ = self.tx.send(event);
    }
}
