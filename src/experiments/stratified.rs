//! Stratified robustness: pool per-stratum lift estimates and compare the
//! pooled figure with the naive, unstratified one.
//!
//! Weights are normalised (`a_i = w_i / Σ w`), the pooled lift is
//! `Σ a_i · lift_i` and the pooled variance is `Σ a_i² · var_i`. Under
//! inverse-variance weights that variance reduces to `1 / Σ w_i`.
//!
//! Strata with an empty arm get weight 0 and stay in the per-stratum list
//! flagged as excluded. They still count toward the naive estimate, which
//! is always computed from the totals over every stratum.

use serde::{Deserialize, Serialize};

use super::lift::{self, LiftResult};
use crate::dataset::{GroupSummary, StratumCounts};
use crate::error::{AuditError, Result};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PoolingWeights {
    /// `w_i = 1 / var_i`
    #[default]
    InverseVariance,
    /// `w_i = n_i` (both arms)
    SampleSize,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolingOptions {
    pub weighting: PoolingWeights,
    /// Strata with fewer subjects than this in either arm are left out.
    pub min_per_arm: u64,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        Self {
            weighting: PoolingWeights::InverseVariance,
            min_per_arm: 1,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    /// One arm has no subjects in this stratum.
    ZeroCell,
    BelowMinimum,
    /// The stratum has subjects in both arms but no usable estimate.
    Degenerate,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratumEstimate {
    pub counts: StratumCounts,
    pub lift: Option<LiftResult>,
    pub exclusion: Option<ExclusionReason>,
    /// Why the estimate could not be computed, for `Degenerate` strata.
    pub detail: Option<String>,
    /// Normalised pooling weight; 0 for excluded strata.
    pub weight: f64,
}

impl StratumEstimate {
    pub fn label(&self) -> &str {
        &self.counts.label
    }

    pub fn is_pooled(&self) -> bool {
        self.exclusion.is_none()
    }

    pub fn excluded_zero_cell(&self) -> bool {
        self.exclusion == Some(ExclusionReason::ZeroCell)
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StratifiedResult {
    pub naive: LiftResult,
    pub strata: Vec<StratumEstimate>,
    pub weighting: PoolingWeights,
    pub pooled_lift: f64,
    pub pooled_variance: f64,
    pub pooled_se: f64,
    pub confidence_level: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    /// Signed `pooled_lift − naive.abs_lift`.
    pub pooled_minus_naive: f64,
    pub pooled_strata: usize,
    pub excluded_strata: usize,
}

impl StratifiedResult {
    /// `|pooled − naive|` relative to the naive lift. `None` when the naive
    /// lift is exactly 0.
    pub fn relative_divergence(&self) -> Option<f64> {
        if self.naive.abs_lift == 0.0 {
            None
        } else {
            Some((self.pooled_minus_naive / self.naive.abs_lift).abs())
        }
    }
}

fn summaries(counts: &StratumCounts, control: &str, treatment: &str) -> Result<(GroupSummary, GroupSummary)> {
    Ok((
        GroupSummary::new(control, counts.control_n, counts.control_successes)?,
        GroupSummary::new(treatment, counts.treatment_n, counts.treatment_successes)?,
    ))
}

fn estimate_stratum(
    counts: &StratumCounts,
    arms: (&str, &str),
    confidence_level: f64,
    options: &PoolingOptions,
) -> Result<StratumEstimate> {
    let mut estimate = StratumEstimate {
        counts: counts.clone(),
        lift: None,
        exclusion: None,
        detail: None,
        weight: 0.0,
    };
    let (control, treatment) = summaries(counts, arms.0, arms.1)?;
    if counts.has_zero_cell() {
        estimate.exclusion = Some(ExclusionReason::ZeroCell);
        return Ok(estimate);
    }

    match lift::estimate(&control, &treatment, confidence_level) {
        Ok(result) => {
            estimate.lift = Some(result);
            if counts.control_n < options.min_per_arm || counts.treatment_n < options.min_per_arm {
                estimate.exclusion = Some(ExclusionReason::BelowMinimum);
            }
        }
        Err(e) if !e.is_fatal() => {
            estimate.exclusion = Some(ExclusionReason::Degenerate);
            estimate.detail = Some(e.to_string());
        }
        Err(e) => return Err(e),
    }
    Ok(estimate)
}

/// Pools per-stratum lift estimates.
///
/// `arms` names the control and treatment arm carried into each
/// [`GroupSummary`]. Fails with [`AuditError::InsufficientCells`] when no
/// stratum can be pooled.
pub fn pool(
    strata: &[StratumCounts],
    arms: (&str, &str),
    confidence_level: f64,
    options: &PoolingOptions,
) -> Result<StratifiedResult> {
    lift::check_confidence_level(confidence_level)?;
    if strata.is_empty() {
        return Err(AuditError::InsufficientCells(
            "no strata to pool".to_string(),
        ));
    }

    let totals = strata.iter().fold(StratumCounts::new("all", 0, 0, 0, 0), |mut acc, s| {
        acc.control_n += s.control_n;
        acc.control_successes += s.control_successes;
        acc.treatment_n += s.treatment_n;
        acc.treatment_successes += s.treatment_successes;
        acc
    });
    let (control, treatment) = summaries(&totals, arms.0, arms.1)?;
    let naive = lift::estimate(&control, &treatment, confidence_level)?;

    let mut estimates = strata
        .iter()
        .map(|s| estimate_stratum(s, arms, confidence_level, options))
        .collect::<Result<Vec<_>>>()?;

    let raw_weights: Vec<f64> = estimates
        .iter()
        .map(|e| match (&e.lift, e.is_pooled()) {
            (Some(l), true) => match options.weighting {
                PoolingWeights::InverseVariance => 1.0 / l.variance(),
                PoolingWeights::SampleSize => e.counts.total_n() as f64,
            },
            _ => 0.0,
        })
        .collect();
    let total_weight: f64 = raw_weights.iter().sum();

    let pooled_strata = estimates.iter().filter(|e| e.is_pooled()).count();
    let excluded_strata = estimates.len() - pooled_strata;
    for e in estimates.iter().filter(|e| !e.is_pooled()) {
        tracing::warn!(
            stratum = e.label(),
            reason = ?e.exclusion,
            "stratum excluded from pooling"
        );
    }
    if pooled_strata == 0 || total_weight <= 0.0 || !total_weight.is_finite() {
        return Err(AuditError::InsufficientCells(format!(
            "none of {} strata has a poolable estimate",
            estimates.len()
        )));
    }

    let mut pooled_lift = 0.0;
    let mut pooled_variance = 0.0;
    for (e, w) in estimates.iter_mut().zip(&raw_weights) {
        let Some(l) = e.lift.as_ref().filter(|_| e.exclusion.is_none()) else {
            continue;
        };
        let a = w / total_weight;
        pooled_lift += a * l.abs_lift;
        pooled_variance += a * a * l.variance();
        e.weight = a;
    }
    let pooled_se = pooled_variance.sqrt();
    let (ci_low, ci_high) = lift::confidence_interval(pooled_lift, pooled_se, confidence_level);
    let pooled_minus_naive = pooled_lift - naive.abs_lift;

    tracing::debug!(
        pooled_lift,
        pooled_se,
        naive = naive.abs_lift,
        pooled_strata,
        excluded_strata,
        "stratified pooling"
    );

    Ok(StratifiedResult {
        naive,
        strata: estimates,
        weighting: options.weighting,
        pooled_lift,
        pooled_variance,
        pooled_se,
        confidence_level,
        ci_low,
        ci_high,
        pooled_minus_naive,
        pooled_strata,
        excluded_strata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARMS: (&str, &str) = ("psa", "ad");

    fn opts() -> PoolingOptions {
        PoolingOptions::default()
    }

    // ── Single stratum ──────────────────────────────────────────────

    #[test]
    fn single_stratum_reproduces_naive_estimate_exactly() {
        let strata = [StratumCounts::new("Monday", 23524, 420, 564577, 14423)];
        let r = pool(&strata, ARMS, 0.95, &opts()).unwrap();
        assert_eq!(r.pooled_lift, r.naive.abs_lift);
        assert_eq!(r.ci_low, r.naive.ci_low);
        assert_eq!(r.ci_high, r.naive.ci_high);
        assert_eq!(r.pooled_minus_naive, 0.0);
        assert_eq!(r.strata[0].weight, 1.0);
    }

    #[test]
    fn single_stratum_matches_under_sample_size_weights() {
        let strata = [StratumCounts::new("x", 1000, 50, 1000, 70)];
        let options = PoolingOptions {
            weighting: PoolingWeights::SampleSize,
            ..opts()
        };
        let r = pool(&strata, ARMS, 0.95, &options).unwrap();
        assert_eq!(r.pooled_lift, r.naive.abs_lift);
        assert_eq!(r.ci_low, r.naive.ci_low);
    }

    // ── Weighting ───────────────────────────────────────────────────

    #[test]
    fn inverse_variance_pooled_variance_is_reciprocal_weight_sum() {
        let strata = [
            StratumCounts::new("a", 1000, 50, 1100, 70),
            StratumCounts::new("b", 2000, 40, 1900, 60),
        ];
        let r = pool(&strata, ARMS, 0.95, &opts()).unwrap();
        let w: f64 = r
            .strata
            .iter()
            .map(|s| 1.0 / s.lift.as_ref().unwrap().variance())
            .sum();
        assert!((r.pooled_variance - 1.0 / w).abs() < 1e-15);
        let sum_a: f64 = r.strata.iter().map(|s| s.weight).sum();
        assert!((sum_a - 1.0).abs() < 1e-12);
    }

    #[test]
    fn sample_size_weights_follow_stratum_size() {
        let strata = [
            StratumCounts::new("a", 100, 5, 100, 9),
            StratumCounts::new("b", 300, 15, 300, 21),
        ];
        let options = PoolingOptions {
            weighting: PoolingWeights::SampleSize,
            ..opts()
        };
        let r = pool(&strata, ARMS, 0.95, &options).unwrap();
        assert!((r.strata[0].weight - 0.25).abs() < 1e-12);
        assert!((r.strata[1].weight - 0.75).abs() < 1e-12);
        let expected = 0.25 * 0.04 + 0.75 * 0.02;
        assert!((r.pooled_lift - expected).abs() < 1e-12);
    }

    #[test]
    fn pooled_lift_lies_between_stratum_lifts() {
        let strata = [
            StratumCounts::new("a", 1000, 50, 1000, 90),
            StratumCounts::new("b", 1000, 50, 1000, 55),
        ];
        let r = pool(&strata, ARMS, 0.95, &opts()).unwrap();
        assert!(r.pooled_lift > 0.005 && r.pooled_lift < 0.04, "pooled={}", r.pooled_lift);
    }

    // ── Exclusions ──────────────────────────────────────────────────

    #[test]
    fn zero_cell_strata_are_kept_but_not_pooled() {
        let strata = [
            StratumCounts::new("a", 1000, 50, 1000, 70),
            StratumCounts::new("b", 0, 0, 40, 3),
        ];
        let r = pool(&strata, ARMS, 0.95, &opts()).unwrap();
        assert_eq!(r.strata.len(), 2);
        assert!(r.strata[1].excluded_zero_cell());
        assert_eq!(r.strata[1].weight, 0.0);
        assert!(r.strata[1].lift.is_none());
        assert_eq!((r.pooled_strata, r.excluded_strata), (1, 1));
        // The naive estimate still counts the excluded stratum.
        assert_eq!(r.naive.treatment.n(), 1040);
        assert_eq!(r.pooled_lift, r.strata[0].lift.as_ref().unwrap().abs_lift);
    }

    #[test]
    fn malformed_zero_cell_stratum_is_rejected() {
        let strata = [
            StratumCounts::new("Monday", 1000, 50, 1000, 70),
            StratumCounts::new("Sunday", 0, 5, 200, 10),
        ];
        assert!(matches!(
            pool(&strata, ARMS, 0.95, &opts()),
            Err(AuditError::InvalidInput(_))
        ));
    }

    #[test]
    fn strata_below_minimum_are_excluded() {
        let strata = [
            StratumCounts::new("big", 1000, 50, 1000, 70),
            StratumCounts::new("small", 10, 1, 12, 2),
        ];
        let options = PoolingOptions {
            min_per_arm: 30,
            ..opts()
        };
        let r = pool(&strata, ARMS, 0.95, &options).unwrap();
        assert_eq!(r.strata[1].exclusion, Some(ExclusionReason::BelowMinimum));
        assert!(r.strata[1].lift.is_some());
        assert_eq!(r.pooled_strata, 1);
    }

    #[test]
    fn degenerate_strata_are_excluded_with_detail() {
        let strata = [
            StratumCounts::new("a", 1000, 50, 1000, 70),
            StratumCounts::new("b", 20, 0, 20, 0),
        ];
        let r = pool(&strata, ARMS, 0.95, &opts()).unwrap();
        assert_eq!(r.strata[1].exclusion, Some(ExclusionReason::Degenerate));
        assert!(r.strata[1].detail.is_some());
    }

    #[test]
    fn nothing_poolable_is_insufficient_cells() {
        let strata = [
            StratumCounts::new("a", 100, 5, 0, 0),
            StratumCounts::new("b", 0, 0, 100, 9),
        ];
        let err = pool(&strata, ARMS, 0.95, &opts()).unwrap_err();
        assert!(matches!(err, AuditError::InsufficientCells(_)));
    }

    #[test]
    fn empty_strata_list_is_insufficient_cells() {
        assert!(matches!(
            pool(&[], ARMS, 0.95, &opts()),
            Err(AuditError::InsufficientCells(_))
        ));
    }

    // ── Divergence ──────────────────────────────────────────────────

    #[test]
    fn simpsons_reversal_shows_up_as_signed_divergence() {
        // Treatment wins inside both strata but is concentrated in the
        // low-rate stratum, so the naive lift is negative.
        let strata = [
            StratumCounts::new("high", 900, 270, 100, 35),
            StratumCounts::new("low", 100, 5, 900, 54),
        ];
        let r = pool(&strata, ARMS, 0.95, &opts()).unwrap();
        assert!(r.naive.abs_lift < 0.0, "naive={}", r.naive.abs_lift);
        assert!(r.pooled_lift > 0.0, "pooled={}", r.pooled_lift);
        assert!(r.pooled_minus_naive > 0.0);
        assert!(r.relative_divergence().unwrap() > 1.0);
    }
}
