//! Point-in-time package snapshots as scraped from a wholesaler.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Accommodation descriptor attached to a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accommodation {
    /// Free-form category, e.g. "hotel", "resort", "apartment".
    pub kind: String,
    /// Star rating (0-5, half stars allowed).
    pub rating: f64,
}

impl Accommodation {
    pub fn new(kind: impl Into<String>, rating: f64) -> Self {
        Self {
            kind: kind.into(),
            rating,
        }
    }
}

/// Upstream status of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageStatus {
    Available,
    Withdrawn,
}

/// Immutable description of a travel package at the moment it was observed.
///
/// Snapshots are never edited in place; a newer observation is a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSnapshot {
    pub id: String,
    pub provider_id: String,
    pub destination: String,
    pub origin: String,
    pub duration_days: u32,
    /// ISO 4217 code shared by `price` and `taxes`.
    pub currency: String,
    pub price: Decimal,
    pub taxes: Decimal,
    pub availability: BTreeSet<NaiveDate>,
    pub accommodation: Accommodation,
    pub captured_at: DateTime<Utc>,
}

impl PackageSnapshot {
    /// True when `other` describes the same upstream package.
    pub fn same_package(&self, other: &PackageSnapshot) -> bool {
        self.id == other.id && self.provider_id == other.provider_id
    }

    /// Price including taxes.
    pub fn total(&self) -> Decimal {
        self.price.saturating_add(self.taxes)
    }
}
