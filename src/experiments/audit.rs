//! End-to-end audit of one dataset snapshot.
//!
//! Quality gate first, then allocation and balance, then the naive lift and
//! its stratified counterpart, then power planning. Fatal errors stop the
//! run; slice-level errors become [`SliceOutcome::Skipped`] entries and the
//! remaining slices still run.

use serde::Serialize;

use super::allocation::{self, SrmResult};
use super::balance::{self, BalanceResult};
use super::config::AuditConfig;
use super::lift::{self, LiftResult};
use super::power::{PowerPlan, PowerPlanner};
use super::quality::{self, QualityReport};
use super::stratified::{self, StratifiedResult};
use crate::dataset::DatasetView;
use crate::error::{AuditError, Result};

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SliceOutcome<T> {
    Ok { result: T },
    Skipped { code: String, reason: String },
}

impl<T> SliceOutcome<T> {
    /// Keeps fatal errors as errors and turns slice-level ones into a skip.
    pub fn from_result(result: Result<T>) -> Result<Self> {
        match result {
            Ok(result) => Ok(SliceOutcome::Ok { result }),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok(Self::skipped(&e)),
        }
    }

    pub fn skipped(error: &AuditError) -> Self {
        tracing::warn!(code = error.code(), "skipped: {}", error);
        SliceOutcome::Skipped {
            code: error.code().to_string(),
            reason: error.to_string(),
        }
    }

    pub fn result(&self) -> Option<&T> {
        match self {
            SliceOutcome::Ok { result } => Some(result),
            SliceOutcome::Skipped { .. } => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, SliceOutcome::Skipped { .. })
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NamedSlice<T> {
    pub name: String,
    #[serde(flatten)]
    pub outcome: SliceOutcome<T>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub quality: QualityReport,
    pub allocation: Vec<NamedSlice<SrmResult>>,
    pub balance: Vec<NamedSlice<BalanceResult>>,
    pub lift: SliceOutcome<LiftResult>,
    pub stratified: Option<SliceOutcome<StratifiedResult>>,
    pub power: Option<SliceOutcome<PowerPlan>>,
}

impl AuditReport {
    /// True when at least one evaluated reference split passed.
    pub fn allocation_consistent_with_any(&self) -> bool {
        self.allocation
            .iter()
            .any(|s| s.outcome.result().is_some_and(SrmResult::passed))
    }

    pub fn skipped_slices(&self) -> usize {
        let named = self
            .allocation
            .iter()
            .map(|s| s.outcome.is_skipped())
            .chain(self.balance.iter().map(|s| s.outcome.is_skipped()))
            .filter(|&skipped| skipped)
            .count();
        named
            + usize::from(self.lift.is_skipped())
            + usize::from(self.stratified.as_ref().is_some_and(SliceOutcome::is_skipped))
            + usize::from(self.power.as_ref().is_some_and(SliceOutcome::is_skipped))
    }
}

pub fn run_audit(view: &DatasetView, config: &AuditConfig) -> Result<AuditReport> {
    config.validate()?;
    if view.arms() != &config.arms {
        return Err(AuditError::Config(format!(
            "dataset arms {:?} differ from configured arms {:?}",
            view.arms().as_array(),
            config.arms.as_array()
        )));
    }

    let quality = quality::validate(view)?;
    tracing::info!(rows = quality.rows, clean = quality.is_clean(), "quality gate passed");

    let counts = view.arm_counts();
    let references = config.reference_splits();
    let srm_alpha = config.effective_srm_alpha();
    let allocation = references
        .iter()
        .zip(allocation::audit_all(&counts, &references, srm_alpha))
        .map(|(reference, result)| -> Result<NamedSlice<SrmResult>> {
            Ok(NamedSlice {
                name: reference.name.clone(),
                outcome: SliceOutcome::from_result(result)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    tracing::info!(references = allocation.len(), "allocation audited");

    let balance = config
        .balance_covariates
        .iter()
        .map(|covariate| -> Result<NamedSlice<BalanceResult>> {
            Ok(NamedSlice {
                name: covariate.clone(),
                outcome: SliceOutcome::from_result(balance::check_covariate(
                    view,
                    covariate,
                    config.alpha,
                ))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    tracing::info!(covariates = balance.len(), "balance checked");

    let (control, treatment) = view.summaries()?;
    let lift = SliceOutcome::from_result(lift::estimate(&control, &treatment, config.confidence_level))?;
    if let Some(r) = lift.result() {
        tracing::info!(abs_lift = r.abs_lift, p_value = r.p_value, "naive lift estimated");
    }

    let stratified = if config.stratify_by.is_empty() {
        None
    } else {
        let strata = view.strata(&config.stratify_by)?;
        let arms = (config.arms.control.as_str(), config.arms.treatment.as_str());
        let outcome = SliceOutcome::from_result(stratified::pool(
            &strata,
            arms,
            config.confidence_level,
            &config.stratification,
        ))?;
        if let Some(r) = outcome.result() {
            tracing::info!(
                pooled_lift = r.pooled_lift,
                pooled_minus_naive = r.pooled_minus_naive,
                "stratified lift pooled"
            );
        }
        Some(outcome)
    };

    let power = config.power.as_ref().map(|p| {
        let baseline = match p.baseline_rate {
            Some(rate) => rate,
            None => match lift.result() {
                Some(r) => r.control_rate,
                None => {
                    return SliceOutcome::skipped(&AuditError::InvalidInput(
                        "no baseline rate configured and no observed control rate".to_string(),
                    ))
                }
            },
        };
        let plan = PowerPlanner::new(p.sidedness)
            .required_n(baseline, p.target_abs_lift, config.alpha, p.power, p.treatment_share)
            .and_then(|plan| match p.daily_volume {
                Some(volume) => plan.with_daily_volume(volume),
                None => Ok(plan),
            });
        // Power planning is independent of the dataset: any failure only
        // affects this slice.
        match plan {
            Ok(result) => SliceOutcome::Ok { result },
            Err(e) => SliceOutcome::skipped(&e),
        }
    });

    let report = AuditReport {
        quality,
        allocation,
        balance,
        lift,
        stratified,
        power,
    };
    tracing::info!(skipped = report.skipped_slices(), "audit complete");
    Ok(report)
}
