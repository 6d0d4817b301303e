//! Field-level difference between two versions of one budget.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::budget::{Budget, BudgetStatus, Modification, PricingAnchor};
use crate::package::PackageSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "entries", rename_all = "snake_case")]
pub enum ModificationChange {
    /// The newer history extends the older one.
    Appended(Vec<Modification>),
    /// The older history is not a prefix; the full newer list.
    Replaced(Vec<Modification>),
}

/// Everything that differs between `from_version` and `to_version`.
///
/// `delta.apply(&from) == to` for any pair produced by [`BudgetDelta::between`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetDelta {
    pub from_version: u64,
    pub to_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_price: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<PricingAnchor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BudgetStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<PackageSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata_set: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub metadata_removed: BTreeSet<String>,
    pub modifications: ModificationChange,
}

fn changed<T: PartialEq + Clone>(from: &T, to: &T) -> Option<T> {
    (from != to).then(|| to.clone())
}

impl BudgetDelta {
    pub fn between(from: &Budget, to: &Budget) -> Self {
        let metadata_set = to
            .metadata
            .iter()
            .filter(|(key, value)| from.metadata.get(*key) != Some(*value))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let metadata_removed = from
            .metadata
            .keys()
            .filter(|key| !to.metadata.contains_key(*key))
            .cloned()
            .collect();

        let modifications = if to.modifications.starts_with(&from.modifications) {
            ModificationChange::Appended(to.modifications[from.modifications.len()..].to_vec())
        } else {
            ModificationChange::Replaced(to.modifications.clone())
        };

        Self {
            from_version: from.version,
            to_version: to.version,
            base_price: changed(&from.base_price, &to.base_price),
            margin: changed(&from.margin, &to.margin),
            final_price: changed(&from.final_price, &to.final_price),
            anchor: changed(&from.anchor, &to.anchor),
            status: changed(&from.status, &to.status),
            package: changed(&from.package, &to.package),
            valid_until: changed(&from.valid_until, &to.valid_until),
            metadata_set,
            metadata_removed,
            modifications,
        }
    }

    /// True when nothing but the version number differs.
    pub fn is_empty(&self) -> bool {
        self.base_price.is_none()
            && self.margin.is_none()
            && self.final_price.is_none()
            && self.anchor.is_none()
            && self.status.is_none()
            && self.package.is_none()
            && self.valid_until.is_none()
            && self.metadata_set.is_empty()
            && self.metadata_removed.is_empty()
            && matches!(&self.modifications, ModificationChange::Appended(m) if m.is_empty())
    }

    pub fn apply(&self, from: &Budget) -> Budget {
        let mut next = from.clone();
        next.version = self.to_version;
        if let Some(base_price) = self.base_price {
            next.base_price = base_price;
        }
        if let Some(margin) = self.margin {
            next.margin = margin;
        }
        if let Some(final_price) = self.final_price {
            next.final_price = final_price;
        }
        if let Some(anchor) = self.anchor {
            next.anchor = anchor;
        }
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(package) = &self.package {
            next.package = package.clone();
        }
        if let Some(valid_until) = self.valid_until {
            next.valid_until = valid_until;
        }
        for key in &self.metadata_removed {
            next.metadata.remove(key);
        }
        next.metadata
            .extend(self.metadata_set.iter().map(|(k, v)| (k.clone(), v.clone())));
        match &self.modifications {
            ModificationChange::Appended(extra) => next.modifications.extend(extra.iter().cloned()),
            ModificationChange::Replaced(all) => next.modifications = all.clone(),
        }
        next
    }
}
