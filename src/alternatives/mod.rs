//! Alternative package search for budgets whose package degraded.
//!
//! # Key Concepts
//! - ProviderSearch: one collaborator per wholesaler, queried concurrently
//! - Candidate: a substitute package ranked by similarity, then price gap
//!
//! A provider failing does not fail the search; only all providers failing
//! does.

mod catalog;
mod similarity;

pub use catalog::{
    CatalogSearch, ProviderResult, ProviderSearch, ProviderSearchError, SearchCriteria,
};
pub use similarity::similarity;

use std::cmp::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::budget::Budget;
use crate::detect::ChangeSet;
use crate::impact::AlternativePolicy;
use crate::package::PackageSnapshot;

/// A ranked substitute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub provider_id: String,
    pub package: PackageSnapshot,
    pub similarity_score: f64,
    /// `candidate.price - original.price`.
    pub price_difference: Decimal,
}

pub struct AlternativeFinder {
    providers: Vec<Arc<dyn ProviderSearch>>,
    policy: AlternativePolicy,
}

impl AlternativeFinder {
    pub fn new(providers: Vec<Arc<dyn ProviderSearch>>, policy: AlternativePolicy) -> Self {
        Self { providers, policy }
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    pub fn policy(&self) -> &AlternativePolicy {
        &self.policy
    }

    /// Ranked substitutes for the package `budget` quotes.
    ///
    /// # Postconditions
    /// - ordered by `(similarity desc, |price_difference| asc)`
    /// - at most `policy.max_results` entries
    /// - never contains the quoted package itself
    pub async fn find_alternatives(
        &self,
        budget: &Budget,
        changes: &ChangeSet,
    ) -> Result<Vec<Candidate>, ProviderSearchError> {
        let original = &budget.package;
        let criteria = SearchCriteria::similar_to(original);

        let outcomes = join_all(
            self.providers
                .iter()
                .map(|provider| provider.search_packages(&criteria)),
        )
        .await;

        let mut failures = 0usize;
        let mut candidates = Vec::new();
        for (provider, outcome) in self.providers.iter().zip(outcomes) {
            match outcome {
                Ok(results) => {
                    candidates.extend(
                        results
                            .into_iter()
                            .filter(|r| !r.package.same_package(original))
                            .filter(|r| r.package.currency == original.currency)
                            .map(|r| Candidate {
                                similarity_score: similarity(original, &r.package),
                                price_difference: r.package.price.saturating_sub(original.price),
                                provider_id: r.provider_id,
                                package: r.package,
                            }),
                    );
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        budget_id = %budget.id,
                        provider_id = provider.provider_id(),
                        error = %e,
                        "Provider search failed"
                    );
                }
            }
        }

        if !self.providers.is_empty() && failures == self.providers.len() {
            return Err(ProviderSearchError::AllProvidersFailed(failures));
        }

        rank(&mut candidates);
        candidates.truncate(self.policy.max_results);

        tracing::debug!(
            budget_id = %budget.id,
            changed = ?changes.changed_fields(),
            found = candidates.len(),
            "Alternative search finished"
        );
        Ok(candidates)
    }

    /// Best candidate that clears the substitution threshold.
    pub fn best_substitute<'a>(&self, candidates: &'a [Candidate]) -> Option<&'a Candidate> {
        candidates
            .first()
            .filter(|c| c.similarity_score + crate::impact::SEVERITY_EPSILON >= self.policy.min_similarity)
    }
}

fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.similarity_score
            .partial_cmp(&a.similarity_score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.price_difference.abs().cmp(&b.price_difference.abs()))
            .then_with(|| a.package.id.cmp(&b.package.id))
    });
}
