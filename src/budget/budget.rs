//! Versioned budget value type.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::modification::{Modification, PricingSnapshot};
use crate::package::PackageSnapshot;

/// Decimal places kept for customer-facing amounts.
pub const CURRENCY_DP: u32 = 2;

/// Decimal places kept for margins derived by division.
pub const MARGIN_DP: u32 = 8;

/// Round an amount to currency precision.
pub fn round_currency(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(CURRENCY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// Round a ratio to margin precision.
pub fn round_margin(ratio: Decimal) -> Decimal {
    ratio.round_dp_with_strategy(MARGIN_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// `round2(base_price * (1 + margin))`, or `None` when it overflows.
pub fn price_with_margin(base_price: Decimal, margin: Decimal) -> Option<Decimal> {
    Decimal::ONE
        .checked_add(margin)
        .and_then(|factor| base_price.checked_mul(factor))
        .map(round_currency)
}

/// Lifecycle status of a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Active,
    Invalid,
    Expired,
}

impl BudgetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Invalid => "invalid",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of margin / final price is held fixed. The other one is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingAnchor {
    /// `final_price = round2(base_price * (1 + margin))`
    Margin,
    /// `margin = final_price / base_price - 1`
    FinalPrice,
}

/// Who the budget belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetOwner {
    pub session_id: String,
    pub vendor_id: String,
    pub customer_id: String,
}

/// A quoted price for a travel package at one version.
///
/// # Invariants
/// - `version` increases by exactly one with every persisted mutation
/// - exactly one of `margin` / `final_price` is fixed (see `anchor`)
/// - `modifications` only ever grows
///
/// Mutations never touch an existing value: `next_version()` clones into a
/// new one that the caller edits before handing it to the budget book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    pub id: Uuid,
    pub version: u64,
    pub owner: BudgetOwner,
    pub package: PackageSnapshot,
    pub base_price: Decimal,
    pub margin: Decimal,
    pub final_price: Decimal,
    pub anchor: PricingAnchor,
    pub status: BudgetStatus,
    pub modifications: Vec<Modification>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

impl Budget {
    /// Copy of this budget at `version + 1`, ready to be edited.
    pub fn next_version(&self) -> Budget {
        let mut next = self.clone();
        next.version = self.version + 1;
        next
    }

    pub fn is_active(&self) -> bool {
        self.status == BudgetStatus::Active
    }

    pub fn currency(&self) -> &str {
        &self.package.currency
    }

    /// Reprice holding the margin fixed.
    ///
    /// Returns `false` when the final price overflows; the stale final price
    /// is then no longer derivable and validation rejects the version.
    pub fn reprice_keeping_margin(&mut self, base_price: Decimal) -> bool {
        self.base_price = base_price;
        self.anchor = PricingAnchor::Margin;
        match price_with_margin(base_price, self.margin) {
            Some(final_price) => {
                self.final_price = final_price;
                true
            }
            None => false,
        }
    }

    /// Reprice holding the final price fixed.
    ///
    /// Returns `false` and leaves the budget untouched when `base_price` is
    /// zero (no margin can be derived).
    pub fn reprice_keeping_final(&mut self, base_price: Decimal) -> bool {
        let Some(ratio) = self.final_price.checked_div(base_price) else {
            return false;
        };
        self.base_price = base_price;
        self.margin = round_margin(ratio - Decimal::ONE);
        self.anchor = PricingAnchor::FinalPrice;
        true
    }

    /// Final price implied by the anchor contract.
    pub fn derived_final_price(&self) -> Option<Decimal> {
        price_with_margin(self.base_price, self.margin)
    }

    /// Margin implied by the anchor contract, if computable.
    pub fn derived_margin(&self) -> Option<Decimal> {
        self.final_price
            .checked_div(self.base_price)
            .map(|ratio| round_margin(ratio - Decimal::ONE))
    }

    pub fn pricing(&self) -> PricingSnapshot {
        PricingSnapshot {
            base_price: self.base_price,
            margin: self.margin,
            final_price: self.final_price,
            anchor: self.anchor,
            status: self.status,
            package_id: self.package.id.clone(),
        }
    }

    pub fn set_flag(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }
}
