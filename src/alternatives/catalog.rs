//! Provider search collaborator and its in-memory catalog implementation.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::detect::same_place;
use crate::package::PackageSnapshot;

/// What a substitute package has to look like.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub destination: String,
    pub origin: String,
    pub min_duration_days: u32,
    pub max_duration_days: u32,
    pub currency: String,
    /// Dates the customer can travel; empty means any.
    pub dates: BTreeSet<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<Decimal>,
}

impl SearchCriteria {
    /// Criteria for substitutes of `package`: same route, duration within two
    /// days, price at most 15 % above.
    pub fn similar_to(package: &PackageSnapshot) -> Self {
        Self {
            destination: package.destination.clone(),
            origin: package.origin.clone(),
            min_duration_days: package.duration_days.saturating_sub(2),
            max_duration_days: package.duration_days.saturating_add(2),
            currency: package.currency.clone(),
            dates: package.availability.clone(),
            max_price: package.price.checked_mul(Decimal::new(115, 2)),
        }
    }

    pub fn matches(&self, package: &PackageSnapshot) -> bool {
        same_place(&package.destination, &self.destination)
            && package.currency.trim().eq_ignore_ascii_case(self.currency.trim())
            && (self.min_duration_days..=self.max_duration_days).contains(&package.duration_days)
            && self.max_price.map(|max| package.price <= max).unwrap_or(true)
            && (self.dates.is_empty() || !self.dates.is_disjoint(&package.availability))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ProviderSearchError {
    #[error("provider {provider_id} search failed: {message}")]
    Provider { provider_id: String, message: String },

    #[error("all {0} providers failed")]
    AllProvidersFailed(usize),
}

/// A package offered by a provider in reply to a search.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResult {
    pub provider_id: String,
    pub package: PackageSnapshot,
}

/// Search collaborator backed by one wholesaler.
#[async_trait]
pub trait ProviderSearch: Send + Sync {
    fn provider_id(&self) -> &str;

    async fn search_packages(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<ProviderResult>, ProviderSearchError>;
}

/// In-memory catalog of the latest known snapshot per package.
///
/// Kept current from ingestion events so substitutes reflect the latest
/// scraped data.
pub struct CatalogSearch {
    provider_id: String,
    packages: RwLock<HashMap<String, PackageSnapshot>>,
}

impl CatalogSearch {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            packages: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_packages(provider_id: impl Into<String>, packages: Vec<PackageSnapshot>) -> Self {
        let packages = packages.into_iter().map(|p| (p.id.clone(), p)).collect();
        Self {
            provider_id: provider_id.into(),
            packages: RwLock::new(packages),
        }
    }

    /// Load a JSON array of snapshots.
    pub fn load(provider_id: impl Into<String>, path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let packages: Vec<PackageSnapshot> =
            serde_json::from_str(&raw).context("Failed to parse catalog JSON")?;
        Ok(Self::with_packages(provider_id, packages))
    }

    pub async fn upsert(&self, package: PackageSnapshot) {
        self.packages.write().await.insert(package.id.clone(), package);
    }

    pub async fn remove(&self, package_id: &str) -> Option<PackageSnapshot> {
        self.packages.write().await.remove(package_id)
    }

    pub async fn count(&self) -> usize {
        self.packages.read().await.len()
    }
}

#[async_trait]
impl ProviderSearch for CatalogSearch {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    async fn search_packages(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<ProviderResult>, ProviderSearchError> {
        let packages = self.packages.read().await;
        let mut results: Vec<ProviderResult> = packages
            .values()
            .filter(|p| criteria.matches(p))
            .map(|p| ProviderResult {
                provider_id: p.provider_id.clone(),
                package: p.clone(),
            })
            .collect();
        results.sort_by(|a, b| a.package.id.cmp(&b.package.id));
        Ok(results)
    }
}
