//! Budget module - versioned quotes and their lifecycle.
//!
//! # Key Concepts
//! - Budget: a quoted price for a package at one version
//! - Modification: audit record appended with every new version
//! - BudgetBook: the only writer of persisted budgets
//! - Anchor: which of margin / final price a budget holds fixed

mod book;
mod budget;
mod modification;

pub use book::{BudgetBook, NewBudget, VendorEdit};
pub use budget::{
    price_with_margin, round_currency, round_margin, Budget, BudgetOwner, BudgetStatus,
    PricingAnchor, CURRENCY_DP,
    MARGIN_DP,
};
pub use modification::{AlternativeChoice, Modification, ModificationKind, PricingSnapshot};
