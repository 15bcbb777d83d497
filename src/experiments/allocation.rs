//! Sample-ratio-mismatch audit of observed arm counts.
//!
//! SRM is relative to a declared reference split: the same counts can FAIL
//! against 50/50 and PASS against a 96/4 holdout. Every reference is an
//! independent hypothesis evaluated against the same observed counts.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::stats;
use crate::dataset::ArmLabels;
use crate::error::{AuditError, Result};

/// Proportions within this distance of 1.0 are accepted as summing to 1.
const PROPORTION_SUM_TOLERANCE: f64 = 1e-6;

/// A named allocation hypothesis, arm → expected proportion.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceSplit {
    pub name: String,
    pub proportions: IndexMap<String, f64>,
}

impl ReferenceSplit {
    pub fn new<I, S>(name: impl Into<String>, proportions: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let split = Self {
            name: name.into(),
            proportions: proportions
                .into_iter()
                .map(|(arm, p)| (arm.into(), p))
                .collect(),
        };
        split.validate()?;
        Ok(split)
    }

    /// Equal allocation across both arms, used when no reference is declared.
    pub fn equal(arms: &ArmLabels) -> Self {
        Self {
            name: "equal".to_string(),
            proportions: arms.as_array().iter().map(|a| (a.to_string(), 0.5)).collect(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.proportions.len() < 2 {
            return Err(AuditError::InvalidInput(format!(
                "reference '{}' must name at least two arms",
                self.name
            )));
        }
        for (arm, &p) in &self.proportions {
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                return Err(AuditError::InvalidInput(format!(
                    "reference '{}' gives arm '{}' proportion {}, expected [0, 1]",
                    self.name, arm, p
                )));
            }
        }
        let sum: f64 = self.proportions.values().sum();
        if (sum - 1.0).abs() > PROPORTION_SUM_TOLERANCE {
            return Err(AuditError::InvalidInput(format!(
                "reference '{}' proportions sum to {}, expected 1",
                self.name, sum
            )));
        }
        Ok(())
    }

    pub fn proportion(&self, arm: &str) -> Option<f64> {
        self.proportions.get(arm).copied()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    pub fn from_p_value(p_value: f64, alpha: f64) -> Self {
        if p_value < alpha {
            Verdict::Fail
        } else {
            Verdict::Pass
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SrmResult {
    pub reference: String,
    pub proportions: IndexMap<String, f64>,
    pub observed: IndexMap<String, u64>,
    pub expected: IndexMap<String, f64>,
    pub observed_shares: IndexMap<String, f64>,
    pub chi_square: f64,
    pub degrees_of_freedom: u64,
    pub p_value: f64,
    pub alpha: f64,
    pub verdict: Verdict,
}

impl SrmResult {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

pub(crate) fn check_alpha(alpha: f64) -> Result<()> {
    if !(alpha > 0.0 && alpha < 1.0) {
        return Err(AuditError::InvalidInput(format!(
            "alpha must be in (0, 1), got {}",
            alpha
        )));
    }
    Ok(())
}

/// Chi-square goodness-of-fit of `counts` against `reference`.
///
/// Expected counts are `total × proportion`; the statistic has `k − 1`
/// degrees of freedom (1 for a two-arm experiment). FAIL when `p < alpha`.
pub fn audit(
    counts: &IndexMap<String, u64>,
    reference: &ReferenceSplit,
    alpha: f64,
) -> Result<SrmResult> {
    check_alpha(alpha)?;
    reference.validate()?;

    if counts.len() < 2 {
        return Err(AuditError::InvalidInput(
            "allocation audit needs counts for at least two arms".to_string(),
        ));
    }
    if counts.len() != reference.proportions.len()
        || counts.keys().any(|arm| !reference.proportions.contains_key(arm))
    {
        return Err(AuditError::InvalidInput(format!(
            "reference '{}' arms {:?} do not match observed arms {:?}",
            reference.name,
            reference.proportions.keys().collect::<Vec<_>>(),
            counts.keys().collect::<Vec<_>>()
        )));
    }

    let total: u64 = counts.values().sum();
    if total == 0 {
        return Err(AuditError::InvalidInput(
            "allocation audit needs at least one observation".to_string(),
        ));
    }
    let total_f = total as f64;

    let mut observed = Vec::with_capacity(counts.len());
    let mut expected = IndexMap::with_capacity(counts.len());
    let mut observed_shares = IndexMap::with_capacity(counts.len());
    for (arm, &n) in counts {
        let proportion = reference.proportion(arm).unwrap_or(0.0);
        let e = total_f * proportion;
        if e <= 0.0 {
            return Err(AuditError::DegenerateReference(format!(
                "reference '{}' expects 0 subjects in arm '{}' ({} observed)",
                reference.name, arm, n
            )));
        }
        observed.push(n as f64);
        expected.insert(arm.clone(), e);
        observed_shares.insert(arm.clone(), n as f64 / total_f);
    }

    let expected_values: Vec<f64> = expected.values().copied().collect();
    let chi_square = stats::pearson_statistic(&observed, &expected_values);
    let degrees_of_freedom = (counts.len() - 1) as u64;
    let p_value = stats::chi_square_sf(chi_square, degrees_of_freedom);
    let verdict = Verdict::from_p_value(p_value, alpha);

    tracing::debug!(
        reference = %reference.name,
        chi_square,
        p_value,
        ?verdict,
        "allocation audit"
    );
    if verdict == Verdict::Fail {
        tracing::warn!(
            "sample ratio mismatch against reference '{}': chi2={:.3}, p={:e}",
            reference.name,
            chi_square,
            p_value
        );
    }

    Ok(SrmResult {
        reference: reference.name.clone(),
        proportions: reference.proportions.clone(),
        observed: counts.clone(),
        expected,
        observed_shares,
        chi_square,
        degrees_of_freedom,
        p_value,
        alpha,
        verdict,
    })
}

/// Evaluates each reference independently against the same counts.
/// Results are aligned with `references`; one failing reference does not
/// affect the others.
pub fn audit_all(
    counts: &IndexMap<String, u64>,
    references: &[ReferenceSplit],
    alpha: f64,
) -> Vec<Result<SrmResult>> {
    references
        .iter()
        .map(|reference| audit(counts, reference, alpha))
        .collect()
}
