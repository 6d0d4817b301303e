//! Change detection between package snapshots.
//!
//! # Key Concepts
//! - ChangeSet: per-field typed deltas, unchanged fields omitted
//! - Significance: whether a change is worth reconciling or merely cosmetic
//!
//! Detection is a pure function of its inputs so severity scoring downstream
//! stays reproducible.

mod change_set;

pub use change_set::{
    AccommodationDelta, AmountDelta, AvailabilityDelta, ChangeField, ChangeSet, DurationDelta,
    FieldDelta, StatusDelta,
};

use serde::{Deserialize, Serialize};

use crate::package::PackageSnapshot;

/// Percentage moves above which a change is significant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignificanceThresholds {
    pub price_percent: f64,
    pub taxes_percent: f64,
}

impl Default for SignificanceThresholds {
    fn default() -> Self {
        Self {
            price_percent: 5.0,
            taxes_percent: 5.0,
        }
    }
}

/// Compares snapshots and classifies the result.
#[derive(Debug, Clone, Default)]
pub struct ChangeDetector {
    thresholds: SignificanceThresholds,
}

impl ChangeDetector {
    pub fn new(thresholds: SignificanceThresholds) -> Self {
        Self { thresholds }
    }

    /// Diff `previous` against `current`.
    ///
    /// # Postconditions
    /// - one entry per changed field, none for unchanged fields
    /// - identical inputs always yield an identical `ChangeSet`
    pub fn detect(&self, previous: &PackageSnapshot, current: &PackageSnapshot) -> ChangeSet {
        let mut set = ChangeSet::new(current.id.clone(), current.captured_at);

        if previous.price != current.price {
            set.insert(
                ChangeField::Price,
                FieldDelta::Amount(AmountDelta::new(previous.price, current.price)),
            );
        }

        if previous.taxes != current.taxes {
            set.insert(
                ChangeField::Taxes,
                FieldDelta::Amount(AmountDelta::new(previous.taxes, current.taxes)),
            );
        }

        if previous.availability != current.availability {
            set.insert(
                ChangeField::Availability,
                FieldDelta::Availability(AvailabilityDelta::new(
                    previous.availability.clone(),
                    current.availability.clone(),
                )),
            );
        }

        if previous.duration_days != current.duration_days {
            set.insert(
                ChangeField::Duration,
                FieldDelta::Duration(DurationDelta {
                    previous: previous.duration_days,
                    current: current.duration_days,
                    day_diff: i64::from(current.duration_days) - i64::from(previous.duration_days),
                }),
            );
        }

        if previous.accommodation != current.accommodation {
            set.insert(
                ChangeField::Accommodation,
                FieldDelta::Accommodation(AccommodationDelta {
                    previous: previous.accommodation.clone(),
                    current: current.accommodation.clone(),
                }),
            );
        }

        set
    }

    /// True when `current` no longer describes the same product: the
    /// currency or the route changed. Such a package cannot be repriced in
    /// place.
    pub fn identity_changed(&self, previous: &PackageSnapshot, current: &PackageSnapshot) -> bool {
        !previous.currency.trim().eq_ignore_ascii_case(current.currency.trim())
            || !same_place(&previous.destination, &current.destination)
            || !same_place(&previous.origin, &current.origin)
    }

    /// Whether `changes` must flow through impact analysis: a significant
    /// move, or any change to the trip itself (duration or accommodation).
    pub fn requires_reconciliation(&self, changes: &ChangeSet) -> bool {
        self.is_significant(changes)
            || changes.contains(ChangeField::Duration)
            || changes.contains(ChangeField::Accommodation)
    }

    /// True iff price or taxes moved more than their threshold, or any
    /// date disappeared. Added dates alone never qualify.
    pub fn is_significant(&self, changes: &ChangeSet) -> bool {
        if changes.is_withdrawal() {
            return true;
        }
        let price_moved = changes
            .price()
            .map(|d| d.percent_diff.abs() > self.thresholds.price_percent)
            .unwrap_or(false);
        let taxes_moved = changes
            .taxes()
            .map(|d| d.percent_diff.abs() > self.thresholds.taxes_percent)
            .unwrap_or(false);
        let dates_removed = changes
            .availability()
            .map(|d| !d.removed.is_empty())
            .unwrap_or(false);

        price_moved || taxes_moved || dates_removed
    }
}

/// Place names compare trimmed and case-insensitively.
pub fn same_place(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Accommodation;
    use crate::testing::{date, snapshot};
    use rust_decimal::Decimal;

    #[test]
    fn test_unchanged_snapshots_produce_empty_set() {
        let detector = ChangeDetector::default();
        let pkg = snapshot("PKG-1", 1000);
        let changes = detector.detect(&pkg, &pkg.clone());
        assert!(changes.is_empty());
        assert!(!detector.is_significant(&changes));
    }

    #[test]
    fn test_only_changed_fields_are_reported() {
        let detector = ChangeDetector::default();
        let before = snapshot("PKG-1", 1000);
        let mut after = before.clone();
        after.price = Decimal::from(1100);
        after.accommodation = Accommodation::new("resort", 4.0);

        let changes = detector.detect(&before, &after);
        assert_eq!(
            changes.changed_fields(),
            [ChangeField::Price, ChangeField::Accommodation]
                .into_iter()
                .collect()
        );
        let price = changes.price().unwrap();
        assert!((price.percent_diff - 10.0).abs() < 1e-9);
        assert!(detector.is_significant(&changes));
    }

    #[test]
    fn test_small_price_move_is_cosmetic() {
        let detector = ChangeDetector::default();
        let before = snapshot("PKG-1", 1000);
        let mut after = before.clone();
        after.price = Decimal::from(1050);

        let changes = detector.detect(&before, &after);
        assert!(changes.price().is_some());
        assert!(!detector.is_significant(&changes));
    }

    #[test]
    fn test_tax_move_above_threshold_is_significant() {
        let detector = ChangeDetector::default();
        let before = snapshot("PKG-1", 1000);
        let mut after = before.clone();
        after.taxes = before.taxes * Decimal::new(110, 2);

        let changes = detector.detect(&before, &after);
        assert!(changes.price().is_none());
        assert!(detector.is_significant(&changes));
    }

    #[test]
    fn test_removed_date_is_always_significant() {
        let detector = ChangeDetector::default();
        let mut before = snapshot("PKG-1", 1000);
        before.availability = [date(2025, 3, 2), date(2025, 3, 25)].into_iter().collect();
        let mut after = before.clone();
        after.availability = [date(2025, 3, 25)].into_iter().collect();

        let changes = detector.detect(&before, &after);
        let availability = changes.availability().unwrap();
        assert_eq!(availability.removed.len(), 1);
        assert!(availability.added.is_empty());
        assert!(detector.is_significant(&changes));
    }

    #[test]
    fn test_added_dates_alone_are_not_significant() {
        let detector = ChangeDetector::default();
        let before = snapshot("PKG-1", 1000);
        let mut after = before.clone();
        after.availability.insert(date(2025, 4, 1));

        let changes = detector.detect(&before, &after);
        assert!(changes.availability().is_some());
        assert!(!detector.is_significant(&changes));
    }

    #[test]
    fn test_trip_changes_require_reconciliation() {
        let detector = ChangeDetector::default();
        let before = snapshot("PKG-1", 1000);
        let mut after = before.clone();
        after.duration_days += 4;

        let changes = detector.detect(&before, &after);
        assert!(!detector.is_significant(&changes));
        assert!(detector.requires_reconciliation(&changes));

        let mut rehoused = before.clone();
        rehoused.accommodation = Accommodation::new("hostel", 2.0);
        assert!(detector.requires_reconciliation(&detector.detect(&before, &rehoused)));

        let mut cheaper = before.clone();
        cheaper.price = Decimal::from(1040);
        cheaper.availability.insert(date(2025, 4, 1));
        assert!(!detector.requires_reconciliation(&detector.detect(&before, &cheaper)));
    }

    #[test]
    fn test_currency_or_route_change_is_a_different_product() {
        let detector = ChangeDetector::default();
        let before = snapshot("PKG-1", 1000);

        let mut recased = before.clone();
        recased.destination = format!(" {} ", before.destination.to_uppercase());
        assert!(!detector.identity_changed(&before, &recased));

        let mut repriced = before.clone();
        repriced.currency = "EUR".to_string();
        assert_ne!(before.currency, repriced.currency);
        assert!(detector.identity_changed(&before, &repriced));

        let mut rerouted = before.clone();
        rerouted.origin = "Lyon".to_string();
        assert!(detector.identity_changed(&before, &rerouted));
    }

    #[test]
    fn test_apply_to_rebuilds_current_snapshot() {
        let detector = ChangeDetector::default();
        let before = snapshot("PKG-1", 1000);
        let mut after = before.clone();
        after.price = Decimal::from(900);
        after.duration_days = 9;
        after.availability.insert(date(2025, 5, 1));
        after.captured_at = before.captured_at + chrono::Duration::hours(2);

        let changes = detector.detect(&before, &after);
        assert_eq!(changes.apply_to(&before), after);
    }

    #[test]
    fn test_detection_is_deterministic() {
        let detector = ChangeDetector::default();
        let before = snapshot("PKG-1", 1000);
        let mut after = before.clone();
        after.price = Decimal::from(1234);
        after.duration_days = 5;

        assert_eq!(detector.detect(&before, &after), detector.detect(&before, &after));
    }
}
