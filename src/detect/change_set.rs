//! Typed diff between two package snapshots.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::package::{Accommodation, PackageSnapshot, PackageStatus};

/// Fields the detector compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeField {
    Price,
    Taxes,
    Availability,
    Duration,
    Accommodation,
    Status,
}

impl ChangeField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "price",
            Self::Taxes => "taxes",
            Self::Availability => "availability",
            Self::Duration => "duration",
            Self::Accommodation => "accommodation",
            Self::Status => "status",
        }
    }
}

impl std::fmt::Display for ChangeField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change of a monetary amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountDelta {
    pub previous: Decimal,
    pub current: Decimal,
    /// `current - previous`, signed.
    pub absolute_diff: Decimal,
    /// Signed percentage of `previous` (10.0 means +10 %).
    pub percent_diff: f64,
}

impl AmountDelta {
    pub fn new(previous: Decimal, current: Decimal) -> Self {
        let absolute_diff = current.saturating_sub(previous);
        let percent_diff = if previous.is_zero() {
            // No base to compare against: any appearance counts as a full move.
            if current.is_zero() {
                0.0
            } else if current.is_sign_negative() {
                -100.0
            } else {
                100.0
            }
        } else {
            absolute_diff
                .checked_div(previous)
                .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
                .and_then(|pct| pct.to_f64())
                .unwrap_or_else(|| {
                    let ratio = absolute_diff.to_f64().unwrap_or(0.0)
                        / previous.to_f64().unwrap_or(1.0);
                    ratio * 100.0
                })
        };
        Self {
            previous,
            current,
            absolute_diff,
            percent_diff,
        }
    }
}

/// Change of the availability date set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityDelta {
    pub previous: BTreeSet<NaiveDate>,
    pub current: BTreeSet<NaiveDate>,
    pub added: BTreeSet<NaiveDate>,
    pub removed: BTreeSet<NaiveDate>,
}

impl AvailabilityDelta {
    pub fn new(previous: BTreeSet<NaiveDate>, current: BTreeSet<NaiveDate>) -> Self {
        let added = current.difference(&previous).copied().collect();
        let removed = previous.difference(&current).copied().collect();
        Self {
            previous,
            current,
            added,
            removed,
        }
    }

    /// Largest distance, in days, between a removed date and the nearest
    /// date still offered.
    ///
    /// Infinite when dates were removed and nothing remains, zero when no
    /// date was removed.
    pub fn days_shifted(&self) -> f64 {
        self.removed
            .iter()
            .map(|removed| {
                self.current
                    .iter()
                    .map(|kept| (*kept - *removed).num_days().unsigned_abs() as f64)
                    .fold(f64::INFINITY, f64::min)
            })
            .fold(0.0, f64::max)
    }
}

/// Change of the trip length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurationDelta {
    pub previous: u32,
    pub current: u32,
    /// `current - previous`, signed.
    pub day_diff: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccommodationDelta {
    pub previous: Accommodation,
    pub current: Accommodation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDelta {
    pub previous: PackageStatus,
    pub current: PackageStatus,
}

/// One per-field delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldDelta {
    Amount(AmountDelta),
    Availability(AvailabilityDelta),
    Duration(DurationDelta),
    Accommodation(AccommodationDelta),
    Status(StatusDelta),
}

/// Map from changed field to its delta. Unchanged fields are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub package_id: String,
    pub observed_at: DateTime<Utc>,
    pub fields: BTreeMap<ChangeField, FieldDelta>,
}

impl ChangeSet {
    pub fn new(package_id: impl Into<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            package_id: package_id.into(),
            observed_at,
            fields: BTreeMap::new(),
        }
    }

    /// Change set describing an upstream deletion of `package`.
    pub fn withdrawal(package: &PackageSnapshot, observed_at: DateTime<Utc>) -> Self {
        let mut set = Self::new(package.id.clone(), observed_at);
        set.insert(
            ChangeField::Status,
            FieldDelta::Status(StatusDelta {
                previous: PackageStatus::Available,
                current: PackageStatus::Withdrawn,
            }),
        );
        set.insert(
            ChangeField::Availability,
            FieldDelta::Availability(AvailabilityDelta::new(
                package.availability.clone(),
                BTreeSet::new(),
            )),
        );
        set
    }

    pub fn insert(&mut self, field: ChangeField, delta: FieldDelta) {
        self.fields.insert(field, delta);
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, field: ChangeField) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn changed_fields(&self) -> BTreeSet<ChangeField> {
        self.fields.keys().copied().collect()
    }

    pub fn price(&self) -> Option<&AmountDelta> {
        match self.fields.get(&ChangeField::Price) {
            Some(FieldDelta::Amount(delta)) => Some(delta),
            _ => None,
        }
    }

    pub fn taxes(&self) -> Option<&AmountDelta> {
        match self.fields.get(&ChangeField::Taxes) {
            Some(FieldDelta::Amount(delta)) => Some(delta),
            _ => None,
        }
    }

    pub fn availability(&self) -> Option<&AvailabilityDelta> {
        match self.fields.get(&ChangeField::Availability) {
            Some(FieldDelta::Availability(delta)) => Some(delta),
            _ => None,
        }
    }

    pub fn duration(&self) -> Option<&DurationDelta> {
        match self.fields.get(&ChangeField::Duration) {
            Some(FieldDelta::Duration(delta)) => Some(delta),
            _ => None,
        }
    }

    pub fn accommodation(&self) -> Option<&AccommodationDelta> {
        match self.fields.get(&ChangeField::Accommodation) {
            Some(FieldDelta::Accommodation(delta)) => Some(delta),
            _ => None,
        }
    }

    /// True when the package disappeared upstream.
    pub fn is_withdrawal(&self) -> bool {
        matches!(
            self.fields.get(&ChangeField::Status),
            Some(FieldDelta::Status(StatusDelta {
                current: PackageStatus::Withdrawn,
                ..
            }))
        )
    }

    /// Rebuild the newer snapshot from the older one and this diff.
    pub fn apply_to(&self, previous: &PackageSnapshot) -> PackageSnapshot {
        let mut next = previous.clone();
        next.captured_at = self.observed_at;
        if let Some(price) = self.price() {
            next.price = price.current;
        }
        if let Some(taxes) = self.taxes() {
            next.taxes = taxes.current;
        }
        if let Some(availability) = self.availability() {
            next.availability = availability.current.clone();
        }
        if let Some(duration) = self.duration() {
            next.duration_days = duration.current;
        }
        if let Some(accommodation) = self.accommodation() {
            next.accommodation = accommodation.current.clone();
        }
        next
    }
}
