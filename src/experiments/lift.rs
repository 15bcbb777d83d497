use serde::Serialize;

use super::stats;
use crate::dataset::GroupSummary;
use crate::error::{AuditError, Result};

/// Normal approximation is considered unreliable when the smaller of the two
/// `n · rate · (1 − rate)` terms falls below this.
pub const LOW_COUNT_THRESHOLD: f64 = 5.0;

const PER_MILLION: f64 = 1_000_000.0;

// ── Result Structs ──────────────────────────────────────────────────

/// Two-proportion comparison of treatment against control.
///
/// `z_statistic` and `p_value` use the pooled standard error (valid under the
/// null of equal rates). The confidence interval uses the unpooled standard
/// error because it estimates the true difference.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiftResult {
    pub control: GroupSummary,
    pub treatment: GroupSummary,
    pub control_rate: f64,
    pub treatment_rate: f64,
    pub abs_lift: f64,
    /// `None` when the control rate is 0.
    pub rel_lift: Option<f64>,
    pub se_pooled: f64,
    pub se_unpooled: f64,
    pub z_statistic: f64,
    pub p_value: f64,
    pub confidence_level: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub low_count_warning: bool,
}

impl LiftResult {
    /// Variance of `abs_lift` under the unpooled normal approximation.
    pub fn variance(&self) -> f64 {
        self.se_unpooled * self.se_unpooled
    }

    /// Extra successes per one million treated subjects.
    pub fn incremental_per_million(&self) -> f64 {
        self.abs_lift * PER_MILLION
    }

    pub fn is_significant(&self, alpha: f64) -> bool {
        self.p_value < alpha
    }

    pub fn ci_excludes_zero(&self) -> bool {
        self.ci_low > 0.0 || self.ci_high < 0.0
    }
}

pub(crate) fn check_confidence_level(confidence_level: f64) -> Result<()> {
    if !(confidence_level > 0.0 && confidence_level < 1.0) {
        return Err(AuditError::InvalidInput(format!(
            "confidence level must be in (0, 1), got {}",
            confidence_level
        )));
    }
    Ok(())
}

/// Symmetric normal interval `center ± z · se`. Shared by every estimator so
/// that identical inputs give bit-identical intervals.
pub fn confidence_interval(center: f64, se: f64, confidence_level: f64) -> (f64, f64) {
    let margin = stats::z_critical(confidence_level) * se;
    (center - margin, center + margin)
}

/// Smallest `n · rate · (1 − rate)` across both groups.
fn min_expected_variance_mass(control_rate: f64, control_n: u64, treatment_rate: f64, treatment_n: u64) -> f64 {
    let c = control_n as f64 * control_rate * (1.0 - control_rate);
    let t = treatment_n as f64 * treatment_rate * (1.0 - treatment_rate);
    c.min(t)
}

// ── Two-Proportion Z-Test ───────────────────────────────────────────

/// Estimates lift and always returns a result when one exists. Small
/// samples set `low_count_warning` instead of failing.
pub fn estimate(
    control: &GroupSummary,
    treatment: &GroupSummary,
    confidence_level: f64,
) -> Result<LiftResult> {
    check_confidence_level(confidence_level)?;

    let control_rate = control.rate()?;
    let treatment_rate = treatment.rate()?;
    let n_c = control.n() as f64;
    let n_t = treatment.n() as f64;

    let abs_lift = treatment_rate - control_rate;

    let pooled = (control.successes() + treatment.successes()) as f64 / (n_c + n_t);
    let se_pooled = (pooled * (1.0 - pooled) * (1.0 / n_c + 1.0 / n_t)).sqrt();
    if se_pooled == 0.0 {
        return Err(AuditError::DegenerateRate(format!(
            "pooled rate is {} across '{}' and '{}', the test statistic is undefined",
            pooled,
            control.arm(),
            treatment.arm()
        )));
    }

    let se_unpooled = (control_rate * (1.0 - control_rate) / n_c
        + treatment_rate * (1.0 - treatment_rate) / n_t)
        .sqrt();
    if se_unpooled == 0.0 {
        return Err(AuditError::DegenerateRate(format!(
            "rates {} ('{}') and {} ('{}') both sit on a boundary, the interval is undefined",
            control_rate,
            control.arm(),
            treatment_rate,
            treatment.arm()
        )));
    }

    let z_statistic = abs_lift / se_pooled;
    let p_value = stats::two_sided_p_value(z_statistic);
    let (ci_low, ci_high) = confidence_interval(abs_lift, se_unpooled, confidence_level);

    let rel_lift = if control_rate > 0.0 {
        Some(abs_lift / control_rate)
    } else {
        None
    };

    let mass = min_expected_variance_mass(control_rate, control.n(), treatment_rate, treatment.n());
    let low_count_warning = mass < LOW_COUNT_THRESHOLD;
    if low_count_warning {
        tracing::warn!(
            control = control.arm(),
            treatment = treatment.arm(),
            mass,
            "normal approximation is unreliable for these counts"
        );
    }

    tracing::debug!(abs_lift, z_statistic, p_value, ci_low, ci_high, "lift estimate");

    Ok(LiftResult {
        control: control.clone(),
        treatment: treatment.clone(),
        control_rate,
        treatment_rate,
        abs_lift,
        rel_lift,
        se_pooled,
        se_unpooled,
        z_statistic,
        p_value,
        confidence_level,
        ci_low,
        ci_high,
        low_count_warning,
    })
}

/// Like [`estimate`] but refuses to return a result the normal
/// approximation cannot support.
pub fn estimate_strict(
    control: &GroupSummary,
    treatment: &GroupSummary,
    confidence_level: f64,
) -> Result<LiftResult> {
    let result = estimate(control, treatment, confidence_level)?;
    if result.low_count_warning {
        return Err(AuditError::DegenerateRate(format!(
            "min n·rate·(1−rate) across '{}' and '{}' is below {}",
            control.arm(),
            treatment.arm(),
            LOW_COUNT_THRESHOLD
        )));
    }
    Ok(result)
}
