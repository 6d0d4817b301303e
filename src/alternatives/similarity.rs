//! Substitutability heuristic between two packages.

use rust_decimal::prelude::ToPrimitive;

use crate::detect::same_place;
use crate::package::PackageSnapshot;

const DESTINATION_WEIGHT: f64 = 0.3;
const DURATION_WEIGHT: f64 = 0.2;
const ACCOMMODATION_WEIGHT: f64 = 0.2;
const PRICE_WEIGHT: f64 = 0.3;

/// Score in `[0, 1]`; weights sum to 1.
pub fn similarity(original: &PackageSnapshot, candidate: &PackageSnapshot) -> f64 {
    let mut score = 0.0;

    if same_place(&original.destination, &candidate.destination) {
        score += DESTINATION_WEIGHT;
    }

    score += DURATION_WEIGHT
        * match original.duration_days.abs_diff(candidate.duration_days) {
            0 => 1.0,
            1 => 0.7,
            2 => 0.4,
            _ => 0.0,
        };

    if original.accommodation.kind == candidate.accommodation.kind {
        score += ACCOMMODATION_WEIGHT * 0.5;
    }
    if (original.accommodation.rating - candidate.accommodation.rating).abs() <= 0.5 {
        score += ACCOMMODATION_WEIGHT * 0.5;
    }

    if let Some(ratio) = price_gap(original, candidate) {
        score += PRICE_WEIGHT
            * if ratio <= 0.05 {
                1.0
            } else if ratio <= 0.10 {
                0.7
            } else if ratio <= 0.15 {
                0.4
            } else {
                0.0
            };
    }

    score.clamp(0.0, 1.0)
}

/// `|original - candidate| / original`, `None` when the original is free.
fn price_gap(original: &PackageSnapshot, candidate: &PackageSnapshot) -> Option<f64> {
    original
        .price
        .saturating_sub(candidate.price)
        .abs()
        .checked_div(original.price)
        .and_then(|r| r.to_f64())
}
