use std::path::Path;

use serde::{Deserialize, Serialize};

use super::allocation::ReferenceSplit;
use super::power::Sidedness;
use super::stratified::PoolingOptions;
use crate::dataset::ArmLabels;
use crate::error::{AuditError, Result};

fn default_alpha() -> f64 {
    0.05
}

fn default_confidence_level() -> f64 {
    0.95
}

fn default_power() -> f64 {
    0.80
}

fn default_treatment_share() -> f64 {
    0.5
}

/// Everything an audit run needs from its caller. Values are passed
/// explicitly into each computation; nothing here is read from ambient state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    #[serde(default)]
    pub arms: ArmLabels,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Overrides `alpha` for the allocation verdict only.
    #[serde(default)]
    pub srm_alpha: Option<f64>,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    /// Empty means a single equal split across the two arms.
    #[serde(default)]
    pub references: Vec<ReferenceSplit>,
    #[serde(default)]
    pub balance_covariates: Vec<String>,
    #[serde(default)]
    pub stratify_by: Vec<String>,
    #[serde(default)]
    pub stratification: PoolingOptions,
    #[serde(default)]
    pub power: Option<PowerConfig>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            arms: ArmLabels::default(),
            alpha: default_alpha(),
            srm_alpha: None,
            confidence_level: default_confidence_level(),
            references: Vec::new(),
            balance_covariates: Vec::new(),
            stratify_by: Vec::new(),
            stratification: PoolingOptions::default(),
            power: None,
        }
    }
}

/// Inputs for planning a follow-up test.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PowerConfig {
    /// Falls back to the observed control rate when absent.
    #[serde(default)]
    pub baseline_rate: Option<f64>,
    pub target_abs_lift: f64,
    #[serde(default = "default_power")]
    pub power: f64,
    #[serde(default = "default_treatment_share")]
    pub treatment_share: f64,
    #[serde(default)]
    pub daily_volume: Option<u64>,
    #[serde(default)]
    pub sidedness: Sidedness,
}

fn check_unit_interval(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value < 1.0) {
        return Err(AuditError::InvalidInput(format!(
            "{} must be in (0.0, 1.0) exclusive, got {}",
            name, value
        )));
    }
    Ok(())
}

impl AuditConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Alpha used for the allocation verdict.
    pub fn effective_srm_alpha(&self) -> f64 {
        self.srm_alpha.unwrap_or(self.alpha)
    }

    /// Declared references, or the equal split when none are declared.
    pub fn reference_splits(&self) -> Vec<ReferenceSplit> {
        if self.references.is_empty() {
            vec![ReferenceSplit::equal(&self.arms)]
        } else {
            self.references.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.arms.validate()?;
        check_unit_interval("alpha", self.alpha)?;
        if let Some(srm_alpha) = self.srm_alpha {
            check_unit_interval("srmAlpha", srm_alpha)?;
        }
        check_unit_interval("confidenceLevel", self.confidence_level)?;

        for reference in &self.references {
            reference.validate()?;
            let mut names: Vec<&str> = reference.proportions.keys().map(String::as_str).collect();
            names.sort_unstable();
            let mut declared = self.arms.as_array();
            declared.sort_unstable();
            if names != declared {
                return Err(AuditError::InvalidInput(format!(
                    "reference '{}' must give proportions for exactly the arms {:?}",
                    reference.name,
                    self.arms.as_array()
                )));
            }
        }

        if let Some(power) = &self.power {
            if let Some(baseline) = power.baseline_rate {
                check_unit_interval("power.baselineRate", baseline)?;
            }
            check_unit_interval("power.power", power.power)?;
            check_unit_interval("power.treatmentShare", power.treatment_share)?;
            if !(power.target_abs_lift.is_finite() && power.target_abs_lift > 0.0) {
                return Err(AuditError::InvalidInput(
                    "power.targetAbsLift must be a positive finite number".to_string(),
                ));
            }
            if power.daily_volume == Some(0) {
                return Err(AuditError::InvalidInput(
                    "power.dailyVolume must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}
