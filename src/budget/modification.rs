//! Audit records appended to a budget on every mutation.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::budget::{BudgetStatus, PricingAnchor};
use crate::detect::ChangeSet;
use crate::impact::ImpactAssessment;

/// Why a budget version exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    SessionInit,
    MarginPreservation,
    PricePreservation,
    ProportionalAdjustment,
    AlternativeSelection,
    PackageWithdrawal,
    VendorAdjustment,
    VersionRestore,
    Expiration,
}

impl ModificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionInit => "session_init",
            Self::MarginPreservation => "margin_preservation",
            Self::PricePreservation => "price_preservation",
            Self::ProportionalAdjustment => "proportional_adjustment",
            Self::AlternativeSelection => "alternative_selection",
            Self::PackageWithdrawal => "package_withdrawal",
            Self::VendorAdjustment => "vendor_adjustment",
            Self::VersionRestore => "version_restore",
            Self::Expiration => "expiration",
        }
    }
}

impl std::fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pricing values a modification produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingSnapshot {
    pub base_price: Decimal,
    pub margin: Decimal,
    pub final_price: Decimal,
    pub anchor: PricingAnchor,
    pub status: BudgetStatus,
    pub package_id: String,
}

/// Substitute package chosen by the best-alternative strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlternativeChoice {
    pub package_id: String,
    pub provider_id: String,
    pub similarity_score: f64,
    pub price_difference: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modification {
    pub kind: ModificationKind,
    pub at: DateTime<Utc>,
    /// Budget version this modification produced.
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_set: Option<ChangeSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessment: Option<ImpactAssessment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternative: Option<AlternativeChoice>,
    pub result: PricingSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Modification {
    pub fn new(kind: ModificationKind, version: u64, result: PricingSnapshot) -> Self {
        Self {
            kind,
            at: Utc::now(),
            version,
            change_set: None,
            assessment: None,
            alternative: None,
            result,
            note: None,
        }
    }

    pub fn with_changes(mut self, change_set: &ChangeSet, assessment: &ImpactAssessment) -> Self {
        self.change_set = Some(change_set.clone());
        self.assessment = Some(assessment.clone());
        self
    }

    pub fn with_alternative(mut self, alternative: AlternativeChoice) -> Self {
        self.alternative = Some(alternative);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}
