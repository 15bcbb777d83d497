use serde::{Deserialize, Serialize};

use super::stats;
use crate::error::{AuditError, Result};

const MDE_LOWER_BOUND: f64 = 1e-9;
const MDE_MAX_ITERATIONS: usize = 200;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Sidedness {
    #[default]
    TwoSided,
    OneSided,
}

// ── Result Structs ──────────────────────────────────────────────────

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PowerPlan {
    pub baseline_rate: f64,
    pub treatment_rate: f64,
    pub target_abs_lift: f64,
    pub alpha: f64,
    pub power: f64,
    pub sidedness: Sidedness,
    pub treatment_share: f64,
    pub n_control: u64,
    pub n_treatment: u64,
    pub total_n: u64,
    pub daily_volume: Option<u64>,
    pub runtime_days: Option<f64>,
    pub implied_days: Option<u64>,
}

impl PowerPlan {
    /// Attaches the calendar runtime implied by `daily_volume` eligible
    /// subjects per day.
    pub fn with_daily_volume(mut self, daily_volume: u64) -> Result<Self> {
        self.implied_days = Some(implied_duration(self.total_n, daily_volume)?);
        self.runtime_days = Some(self.total_n as f64 / daily_volume as f64);
        self.daily_volume = Some(daily_volume);
        Ok(self)
    }
}

fn check_open_unit(name: &str, value: f64) -> Result<()> {
    if !(value > 0.0 && value < 1.0) {
        return Err(AuditError::InvalidInput(format!(
            "{} must be in (0, 1), got {}",
            name, value
        )));
    }
    Ok(())
}

/// Lifts are planned as increases over the baseline.
fn check_target_lift(lift: f64) -> Result<()> {
    if !(lift.is_finite() && lift > 0.0) {
        return Err(AuditError::InvalidInput(format!(
            "target lift must be a positive finite number, got {}",
            lift
        )));
    }
    Ok(())
}

/// Rounds an unrounded arm size up, rejecting sizes a `u64` cannot hold.
fn arm_size(n: f64) -> Result<u64> {
    // `u64::MAX as f64` rounds to 2^64; every finite value below it fits.
    if !n.is_finite() || n >= u64::MAX as f64 {
        return Err(AuditError::InvalidInput(format!(
            "required arm size {} is not representable; the target lift is too small",
            n
        )));
    }
    Ok(n.ceil() as u64)
}

// ── Sample Size Estimator ───────────────────────────────────────────

/// Normal-approximation power analysis for two independent proportions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PowerPlanner {
    sidedness: Sidedness,
}

impl PowerPlanner {
    pub fn new(sidedness: Sidedness) -> Self {
        Self { sidedness }
    }

    pub fn sidedness(&self) -> Sidedness {
        self.sidedness
    }

    fn z_alpha(&self, alpha: f64) -> f64 {
        match self.sidedness {
            Sidedness::TwoSided => stats::normal_quantile(1.0 - alpha / 2.0),
            Sidedness::OneSided => stats::normal_quantile(1.0 - alpha),
        }
    }

    /// Null and alternative standard-deviation terms of the sample-size
    /// formula, with `k_t` the treatment share and `k_c = 1 − k_t`:
    /// `√(p̄q̄(1/k_t + 1/k_c))` and `√(p₁q₁/k_c + p₂q₂/k_t)`, where
    /// `p̄ = k_c·p₁ + k_t·p₂`.
    fn sd_terms(baseline_rate: f64, delta: f64, treatment_share: f64) -> (f64, f64) {
        let p1 = baseline_rate;
        let p2 = baseline_rate + delta;
        let k_t = treatment_share;
        let k_c = 1.0 - treatment_share;

        let p_bar = k_c * p1 + k_t * p2;
        let null_sd = (p_bar * (1.0 - p_bar) * (1.0 / k_t + 1.0 / k_c)).sqrt();
        let alt_sd = (p1 * (1.0 - p1) / k_c + p2 * (1.0 - p2) / k_t).sqrt();
        (null_sd, alt_sd)
    }

    /// Unrounded total sample size across both arms:
    /// `N = (z_α·null_sd + z_β·alt_sd)² / δ²`.
    fn required_total(&self, baseline_rate: f64, delta: f64, alpha: f64, power: f64, treatment_share: f64) -> f64 {
        let (null_sd, alt_sd) = Self::sd_terms(baseline_rate, delta, treatment_share);
        let null_term = self.z_alpha(alpha) * null_sd;
        let alt_term = stats::normal_quantile(power) * alt_sd;
        (null_term + alt_term).powi(2) / (delta * delta)
    }

    /// Per-arm sample sizes needed to detect `target_abs_lift` on top of
    /// `baseline_rate`. Each arm is rounded up independently.
    pub fn required_n(
        &self,
        baseline_rate: f64,
        target_abs_lift: f64,
        alpha: f64,
        power: f64,
        treatment_share: f64,
    ) -> Result<PowerPlan> {
        check_open_unit("baseline rate", baseline_rate)?;
        check_open_unit("alpha", alpha)?;
        check_open_unit("power", power)?;
        check_open_unit("treatment share", treatment_share)?;
        check_target_lift(target_abs_lift)?;
        let treatment_rate = baseline_rate + target_abs_lift;
        check_open_unit("treatment rate", treatment_rate)?;

        let total = self.required_total(baseline_rate, target_abs_lift, alpha, power, treatment_share);
        let n_control = arm_size(total * (1.0 - treatment_share))?;
        let n_treatment = arm_size(total * treatment_share)?;
        let total_n = n_control.checked_add(n_treatment).ok_or_else(|| {
            AuditError::InvalidInput(format!(
                "required sample size for lift {} does not fit in u64",
                target_abs_lift
            ))
        })?;

        tracing::debug!(
            baseline_rate,
            target_abs_lift,
            n_control,
            n_treatment,
            "required sample size"
        );

        Ok(PowerPlan {
            baseline_rate,
            treatment_rate,
            target_abs_lift,
            alpha,
            power,
            sidedness: self.sidedness,
            treatment_share,
            n_control,
            n_treatment,
            total_n,
            daily_volume: None,
            runtime_days: None,
            implied_days: None,
        })
    }

    /// Smallest positive absolute lift detectable with the given arm sizes.
    ///
    /// Bisects the unrounded required total over the lift, so feeding the
    /// result back through [`Self::required_n`] lands on the same sizes up
    /// to the per-arm ceiling.
    pub fn mde_given_n(
        &self,
        n_control: u64,
        n_treatment: u64,
        baseline_rate: f64,
        alpha: f64,
        power: f64,
    ) -> Result<f64> {
        check_open_unit("baseline rate", baseline_rate)?;
        check_open_unit("alpha", alpha)?;
        check_open_unit("power", power)?;
        if n_control == 0 || n_treatment == 0 {
            return Err(AuditError::InvalidInput(format!(
                "both arms need subjects, got {} control and {} treatment",
                n_control, n_treatment
            )));
        }

        let target = n_control.checked_add(n_treatment).ok_or_else(|| {
            AuditError::InvalidInput(format!(
                "{} control and {} treatment subjects overflow the total",
                n_control, n_treatment
            ))
        })? as f64;
        let share = n_treatment as f64 / target;
        let needs = |delta: f64| self.required_total(baseline_rate, delta, alpha, power, share);

        let mut low = MDE_LOWER_BOUND;
        let mut high = 1.0 - baseline_rate - MDE_LOWER_BOUND;
        if high <= low || needs(high) > target {
            return Err(AuditError::InvalidInput(format!(
                "{} subjects cannot detect any lift below {} at baseline {}",
                target,
                1.0 - baseline_rate,
                baseline_rate
            )));
        }

        for _ in 0..MDE_MAX_ITERATIONS {
            let mid = 0.5 * (low + high);
            if mid <= low || mid >= high {
                break;
            }
            if needs(mid) > target {
                low = mid;
            } else {
                high = mid;
            }
        }
        Ok(high)
    }

    /// Power achieved by `n_control` and `n_treatment` subjects against a
    /// true lift of `abs_lift` on top of `baseline_rate`.
    ///
    /// Solves the sample-size formula for `z_β`:
    /// `z_β = (√N·δ − z_α·null_sd) / alt_sd`, power `= Φ(z_β)`.
    pub fn power_given_n(
        &self,
        n_control: u64,
        n_treatment: u64,
        baseline_rate: f64,
        abs_lift: f64,
        alpha: f64,
    ) -> Result<f64> {
        check_open_unit("baseline rate", baseline_rate)?;
        check_open_unit("alpha", alpha)?;
        check_target_lift(abs_lift)?;
        check_open_unit("treatment rate", baseline_rate + abs_lift)?;
        if n_control == 0 || n_treatment == 0 {
            return Err(AuditError::InvalidInput(format!(
                "both arms need subjects, got {} control and {} treatment",
                n_control, n_treatment
            )));
        }
        let total = n_control.checked_add(n_treatment).ok_or_else(|| {
            AuditError::InvalidInput(format!(
                "{} control and {} treatment subjects overflow the total",
                n_control, n_treatment
            ))
        })? as f64;
        let share = n_treatment as f64 / total;

        let (null_sd, alt_sd) = Self::sd_terms(baseline_rate, abs_lift, share);
        let z_beta = (total.sqrt() * abs_lift - self.z_alpha(alpha) * null_sd) / alt_sd;
        Ok(stats::normal_sf(-z_beta))
    }
}

/// Whole days needed to collect `total_n` subjects at `daily_volume` per day.
pub fn implied_duration(total_n: u64, daily_volume: u64) -> Result<u64> {
    if daily_volume == 0 {
        return Err(AuditError::InvalidInput(
            "daily volume must be positive".to_string(),
        ));
    }
    Ok(total_n.div_ceil(daily_volume))
}
