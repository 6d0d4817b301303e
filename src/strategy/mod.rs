//! Strategy module - reconciliation algorithms producing a new budget version.
//!
//! # Key Concepts
//! - StrategyKind: closed set of reconciliation algorithms
//! - StrategyExecutor: applies one strategy and persists the result
//! - Fallback: best-alternative degrades to preserve-price
//!
//! Every strategy reprices against the package as it is now, appends exactly
//! one modification, and hands the result to the budget book, which records
//! the checkpoints around the commit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::alternatives::{AlternativeFinder, Candidate};
use crate::budget::{
    AlternativeChoice, Budget, BudgetBook, BudgetStatus, Modification, ModificationKind,
};
use crate::detect::ChangeSet;
use crate::error::ReconcileError;
use crate::impact::ImpactAssessment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Margin fixed, final price follows the new base price.
    PreserveMargin,
    /// Final price fixed, margin absorbs the change.
    PreservePrice,
    /// Same arithmetic as `PreserveMargin`, audited separately.
    AdjustProportionally,
    /// Substitute the most similar package, else preserve the price.
    BestAlternative,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreserveMargin => "preserve_margin",
            Self::PreservePrice => "preserve_price",
            Self::AdjustProportionally => "adjust_proportionally",
            Self::BestAlternative => "best_alternative",
        }
    }

    pub fn modification_kind(&self) -> ModificationKind {
        match self {
            Self::PreserveMargin => ModificationKind::MarginPreservation,
            Self::PreservePrice => ModificationKind::PricePreservation,
            Self::AdjustProportionally => ModificationKind::ProportionalAdjustment,
            Self::BestAlternative => ModificationKind::AlternativeSelection,
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of applying a strategy.
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    /// The committed new version.
    pub budget: Budget,
    /// Strategy whose arithmetic produced `budget`.
    pub strategy_used: StrategyKind,
    /// Set when the requested strategy could not be honoured.
    pub fell_back_from: Option<StrategyKind>,
    /// Candidates ranked by a best-alternative search, if one ran.
    pub alternatives: Vec<Candidate>,
}

pub struct StrategyExecutor {
    book: Arc<BudgetBook>,
    finder: Arc<AlternativeFinder>,
}

impl StrategyExecutor {
    pub fn new(book: Arc<BudgetBook>, finder: Arc<AlternativeFinder>) -> Self {
        Self { book, finder }
    }

    /// Reconcile `budget` with `changes` using `strategy`.
    pub async fn apply(
        &self,
        budget: &Budget,
        changes: &ChangeSet,
        assessment: &ImpactAssessment,
        strategy: StrategyKind,
        cancel: &CancellationToken,
    ) -> Result<StrategyOutcome, ReconcileError> {
        match strategy {
            StrategyKind::PreserveMargin | StrategyKind::AdjustProportionally => {
                let next = reprice_with_margin(budget, changes, assessment, strategy);
                self.commit(budget, next, strategy, None, Vec::new(), cancel)
                    .await
            }
            StrategyKind::PreservePrice => {
                let next = reprice_with_price(budget, changes, assessment);
                self.commit(budget, next, strategy, None, Vec::new(), cancel)
                    .await
            }
            StrategyKind::BestAlternative => {
                self.best_alternative(budget, changes, assessment, cancel)
                    .await
            }
        }
    }

    async fn best_alternative(
        &self,
        budget: &Budget,
        changes: &ChangeSet,
        assessment: &ImpactAssessment,
        cancel: &CancellationToken,
    ) -> Result<StrategyOutcome, ReconcileError> {
        let candidates = match self.finder.find_alternatives(budget, changes).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(
                    budget_id = %budget.id,
                    error = %e,
                    "Alternative search failed, falling back to preserve_price"
                );
                Vec::new()
            }
        };
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled(budget.id));
        }

        let Some(best) = self.finder.best_substitute(&candidates).cloned() else {
            tracing::info!(
                budget_id = %budget.id,
                candidates = candidates.len(),
                "No substitute above similarity threshold, falling back to preserve_price"
            );
            let next = reprice_with_price(budget, changes, assessment);
            return self
                .commit(
                    budget,
                    next,
                    StrategyKind::PreservePrice,
                    Some(StrategyKind::BestAlternative),
                    candidates,
                    cancel,
                )
                .await;
        };

        let mut next = budget.next_version();
        next.package = best.package.clone();
        let _ = next.reprice_keeping_margin(best.package.price);
        next.set_flag("alternative_selected", true);
        next.set_flag("original_package_id", budget.package.id.clone());
        next.modifications.push(
            Modification::new(
                ModificationKind::AlternativeSelection,
                next.version,
                next.pricing(),
            )
            .with_changes(changes, assessment)
            .with_alternative(AlternativeChoice {
                package_id: best.package.id.clone(),
                provider_id: best.provider_id.clone(),
                similarity_score: best.similarity_score,
                price_difference: best.price_difference,
            }),
        );
        tracing::info!(
            budget_id = %budget.id,
            original = %budget.package.id,
            substitute = %best.package.id,
            similarity = best.similarity_score,
            "Substituting alternative package"
        );
        self.commit(
            budget,
            next,
            StrategyKind::BestAlternative,
            None,
            candidates,
            cancel,
        )
        .await
    }

    /// Mark `budget` invalid after its package disappeared upstream or
    /// became a different product.
    ///
    /// Pricing is left exactly as it was.
    pub async fn invalidate(
        &self,
        budget: &Budget,
        changes: &ChangeSet,
        assessment: &ImpactAssessment,
        reason: InvalidationReason,
        cancel: &CancellationToken,
    ) -> Result<Budget, ReconcileError> {
        let mut next = budget.next_version();
        next.status = BudgetStatus::Invalid;
        next.set_flag("invalidated_reason", reason.as_str());
        next.modifications.push(
            Modification::new(ModificationKind::PackageWithdrawal, next.version, next.pricing())
                .with_changes(changes, assessment)
                .with_note(reason.note()),
        );
        self.book.transition(budget, next, cancel).await
    }

    async fn commit(
        &self,
        prev: &Budget,
        next: Budget,
        strategy_used: StrategyKind,
        fell_back_from: Option<StrategyKind>,
        alternatives: Vec<Candidate>,
        cancel: &CancellationToken,
    ) -> Result<StrategyOutcome, ReconcileError> {
        let budget = self.book.transition(prev, next, cancel).await?;
        Ok(StrategyOutcome {
            budget,
            strategy_used,
            fell_back_from,
            alternatives,
        })
    }
}

fn reprice_with_margin(
    budget: &Budget,
    changes: &ChangeSet,
    assessment: &ImpactAssessment,
    strategy: StrategyKind,
) -> Budget {
    let mut next = budget.next_version();
    next.package = changes.apply_to(&budget.package);
    // On overflow the final price is stale; validation rejects the version
    let _ = next.reprice_keeping_margin(next.package.price);
    let flag = match strategy {
        StrategyKind::AdjustProportionally => "adjusted_proportionally",
        _ => "margin_preserved",
    };
    next.set_flag(flag, true);
    next.modifications.push(
        Modification::new(strategy.modification_kind(), next.version, next.pricing())
            .with_changes(changes, assessment),
    );
    next
}

fn reprice_with_price(budget: &Budget, changes: &ChangeSet, assessment: &ImpactAssessment) -> Budget {
    let mut next = budget.next_version();
    next.package = changes.apply_to(&budget.package);
    let price = next.package.price;
    if !next.reprice_keeping_final(price) {
        // Zero base price; validation rejects the version
        next.base_price = price;
    }
    next.set_flag("price_preserved", true);
    next.modifications.push(
        Modification::new(ModificationKind::PricePreservation, next.version, next.pricing())
            .with_changes(changes, assessment),
    );
    next
}

/// Why a budget was invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    /// The package was deleted upstream.
    PackageDeleted,
    /// The package now has another currency or route.
    PackageChanged,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PackageDeleted => "package_deleted",
            Self::PackageChanged => "package_changed",
        }
    }

    fn note(&self) -> &'static str {
        match self {
            Self::PackageDeleted => "package withdrawn upstream",
            Self::PackageChanged => "package currency or route changed upstream",
        }
    }
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
