//! Tunable policy for severity scoring and strategy selection.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detect::SignificanceThresholds;
use crate::strategy::StrategyKind;

/// Tolerance applied to threshold comparisons on summed float weights.
pub const SEVERITY_EPSILON: f64 = 1e-9;

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("weight '{name}' must be within [0, 1], got {value}")]
    WeightOutOfRange { name: &'static str, value: f64 },

    #[error("severity weights sum to {0}, which exceeds 1.0")]
    WeightsExceedOne(f64),

    #[error("saturation point '{name}' must be positive, got {value}")]
    InvalidSaturation { name: &'static str, value: f64 },

    #[error("threshold '{name}' must be within [0, 1], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("strategy bands must be sorted by strictly descending min_severity")]
    BandsNotDescending,
}

/// Maximum contribution of each field to the severity score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityWeights {
    pub price: f64,
    pub duration: f64,
    pub dates: f64,
    pub accommodation: f64,
}

impl Default for SeverityWeights {
    fn default() -> Self {
        Self {
            price: 0.6,
            duration: 0.2,
            dates: 0.1,
            accommodation: 0.1,
        }
    }
}

/// Magnitudes at which a field's contribution reaches its full weight.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Saturation {
    pub price_percent: f64,
    pub duration_days: f64,
    pub dates_days: f64,
}

impl Default for Saturation {
    fn default() -> Self {
        Self {
            price_percent: 10.0,
            duration_days: 2.0,
            dates_days: 7.0,
        }
    }
}

/// Severity band selecting a strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyBand {
    pub min_severity: f64,
    pub strategy: StrategyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlternativePolicy {
    /// Candidates scoring below this are never substituted.
    pub min_similarity: f64,
    /// Number of ranked candidates returned by a search.
    pub max_results: usize,
}

impl Default for AlternativePolicy {
    fn default() -> Self {
        Self {
            min_similarity: 0.7,
            max_results: 5,
        }
    }
}

/// Policy table consulted by the analyzer, detector and alternative finder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyTable {
    pub weights: SeverityWeights,
    pub saturation: Saturation,
    /// Checked top to bottom; first band whose `min_severity` is reached wins.
    pub bands: Vec<StrategyBand>,
    /// Strategy used below the lowest band.
    pub fallback: StrategyKind,
    pub high_impact_threshold: f64,
    pub alternatives_threshold: f64,
    pub significance: SignificanceThresholds,
    pub alternatives: AlternativePolicy,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            weights: SeverityWeights::default(),
            saturation: Saturation::default(),
            bands: vec![
                StrategyBand {
                    min_severity: 0.9,
                    strategy: StrategyKind::BestAlternative,
                },
                StrategyBand {
                    min_severity: 0.7,
                    strategy: StrategyKind::PreservePrice,
                },
                StrategyBand {
                    min_severity: 0.5,
                    strategy: StrategyKind::PreserveMargin,
                },
            ],
            fallback: StrategyKind::AdjustProportionally,
            high_impact_threshold: 0.7,
            alternatives_threshold: 0.7,
            significance: SignificanceThresholds::default(),
            alternatives: AlternativePolicy::default(),
        }
    }
}

impl PolicyTable {
    /// Parse and validate a YAML policy. Missing fields keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let policy: PolicyTable =
            serde_yaml::from_str(yaml).context("Failed to parse policy YAML")?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file {}", path.display()))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        let weights = [
            ("price", self.weights.price),
            ("duration", self.weights.duration),
            ("dates", self.weights.dates),
            ("accommodation", self.weights.accommodation),
        ];
        for (name, value) in weights {
            if !(0.0..=1.0).contains(&value) {
                return Err(PolicyError::WeightOutOfRange { name, value });
            }
        }
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if total > 1.0 + SEVERITY_EPSILON {
            return Err(PolicyError::WeightsExceedOne(total));
        }

        let saturation = [
            ("price_percent", self.saturation.price_percent),
            ("duration_days", self.saturation.duration_days),
            ("dates_days", self.saturation.dates_days),
        ];
        for (name, value) in saturation {
            if !(value > 0.0 && value.is_finite()) {
                return Err(PolicyError::InvalidSaturation { name, value });
            }
        }

        let thresholds = [
            ("high_impact_threshold", self.high_impact_threshold),
            ("alternatives_threshold", self.alternatives_threshold),
            ("min_similarity", self.alternatives.min_similarity),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(PolicyError::ThresholdOutOfRange { name, value });
            }
        }
        for band in &self.bands {
            if !(0.0..=1.0).contains(&band.min_severity) {
                return Err(PolicyError::ThresholdOutOfRange {
                    name: "min_severity",
                    value: band.min_severity,
                });
            }
        }

        if self
            .bands
            .windows(2)
            .any(|pair| pair[0].min_severity <= pair[1].min_severity)
        {
            return Err(PolicyError::BandsNotDescending);
        }

        Ok(())
    }

    /// Strategy for a severity score.
    pub fn strategy_for(&self, severity: f64) -> StrategyKind {
        self.bands
            .iter()
            .find(|band| reaches(severity, band.min_severity))
            .map(|band| band.strategy)
            .unwrap_or(self.fallback)
    }

    pub fn is_high_impact(&self, severity: f64) -> bool {
        reaches(severity, self.high_impact_threshold)
    }

    pub fn requires_alternatives(&self, severity: f64) -> bool {
        reaches(severity, self.alternatives_threshold)
    }
}

fn reaches(value: f64, threshold: f64) -> bool {
    value + SEVERITY_EPSILON >= threshold
}
