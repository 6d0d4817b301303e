//! Impact analysis - turns a change set into a severity score and a
//! recommended reconciliation strategy.
//!
//! # Scoring
//! Each field contributes `weight * min(magnitude / saturation, 1)`, clamped
//! to `[0, weight]` before summation:
//! - price: percent move, saturating at 10 %
//! - duration: day difference, saturating at 2 days
//! - dates: days shifted, saturating at 7 days
//! - accommodation: full weight on any change
//!
//! Thresholds live in [`PolicyTable`] so they can be overridden by
//! configuration.

mod policy;

pub use policy::{
    AlternativePolicy, PolicyError, PolicyTable, Saturation, SeverityWeights, StrategyBand,
    SEVERITY_EPSILON,
};

use std::collections::BTreeSet;

use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::Budget;
use crate::detect::{ChangeField, ChangeSet};
use crate::strategy::StrategyKind;

/// Result of analyzing one change set against one budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAssessment {
    pub budget_id: Uuid,
    /// Weighted severity in `[0, 1]`.
    pub severity: f64,
    /// `|price.absolute_diff| / budget.final_price`.
    pub price_impact: f64,
    pub affected_components: BTreeSet<ChangeField>,
    pub recommended_strategy: StrategyKind,
    pub alternatives_required: bool,
}

/// Per-field contributions to a severity score.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SeverityBreakdown {
    pub price: f64,
    pub duration: f64,
    pub dates: f64,
    pub accommodation: f64,
}

impl SeverityBreakdown {
    pub fn total(&self) -> f64 {
        (self.price + self.duration + self.dates + self.accommodation).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImpactAnalyzer {
    policy: PolicyTable,
}

impl ImpactAnalyzer {
    pub fn new(policy: PolicyTable) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    /// Score `changes` against `budget`.
    pub fn analyze(&self, changes: &ChangeSet, budget: &Budget) -> ImpactAssessment {
        let severity = self.breakdown(changes).total();
        ImpactAssessment {
            budget_id: budget.id,
            severity,
            price_impact: price_impact(changes, budget),
            affected_components: changes.changed_fields(),
            recommended_strategy: self.policy.strategy_for(severity),
            alternatives_required: self.policy.requires_alternatives(severity),
        }
    }

    pub fn severity(&self, changes: &ChangeSet) -> f64 {
        self.breakdown(changes).total()
    }

    pub fn breakdown(&self, changes: &ChangeSet) -> SeverityBreakdown {
        let weights = &self.policy.weights;
        let saturation = &self.policy.saturation;

        SeverityBreakdown {
            price: changes
                .price()
                .map(|d| contribution(weights.price, d.percent_diff.abs(), saturation.price_percent))
                .unwrap_or(0.0),
            duration: changes
                .duration()
                .map(|d| {
                    contribution(
                        weights.duration,
                        d.day_diff.unsigned_abs() as f64,
                        saturation.duration_days,
                    )
                })
                .unwrap_or(0.0),
            dates: changes
                .availability()
                .map(|d| contribution(weights.dates, d.days_shifted(), saturation.dates_days))
                .unwrap_or(0.0),
            accommodation: if changes.contains(ChangeField::Accommodation) {
                weights.accommodation
            } else {
                0.0
            },
        }
    }
}

fn contribution(weight: f64, magnitude: f64, saturation: f64) -> f64 {
    if magnitude.is_nan() {
        return 0.0;
    }
    (weight * (magnitude / saturation).min(1.0)).clamp(0.0, weight)
}

fn price_impact(changes: &ChangeSet, budget: &Budget) -> f64 {
    let Some(price) = changes.price() else {
        return 0.0;
    };
    price
        .absolute_diff
        .abs()
        .checked_div(budget.final_price)
        .and_then(|ratio| ratio.to_f64())
        .unwrap_or(0.0)
}
