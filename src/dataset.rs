//! Typed, validated in-memory view of experiment rows.
//!
//! A [`DatasetView`] is built once by an external loader and is never mutated
//! afterwards. Engine components only read it, and most of them only read the
//! count aggregates it derives ([`GroupSummary`], [`StratumCounts`], arm
//! counts), never the rows themselves.

use std::collections::{BTreeMap, HashSet};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{AuditError, Result};

/// Subject identifier, unique per row when present.
pub type SubjectId = String;

/// Label used for the stratum of rows whose covariate value is missing.
pub const MISSING_CATEGORY: &str = "NA";

const STRATUM_SEPARATOR: &str = " | ";

/// The two arm labels of an experiment, fixed for the lifetime of a dataset.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ArmLabels {
    pub control: String,
    pub treatment: String,
}

impl Default for ArmLabels {
    fn default() -> Self {
        Self {
            control: "psa".to_string(),
            treatment: "ad".to_string(),
        }
    }
}

impl ArmLabels {
    pub fn new(control: impl Into<String>, treatment: impl Into<String>) -> Result<Self> {
        let labels = Self {
            control: control.into(),
            treatment: treatment.into(),
        };
        labels.validate()?;
        Ok(labels)
    }

    pub fn validate(&self) -> Result<()> {
        if self.control.trim().is_empty() || self.treatment.trim().is_empty() {
            return Err(AuditError::InvalidInput(
                "arm labels must be non-empty".to_string(),
            ));
        }
        if self.control == self.treatment {
            return Err(AuditError::InvalidInput(format!(
                "control and treatment labels must differ, both are '{}'",
                self.control
            )));
        }
        Ok(())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.control == label || self.treatment == label
    }

    /// Control first, then treatment.
    pub fn as_array(&self) -> [&str; 2] {
        [self.control.as_str(), self.treatment.as_str()]
    }
}

/// Binary outcome of one subject, or the raw value when it could not be read
/// as binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Invalid(String),
}

impl Outcome {
    /// Coerces a raw cell into an outcome.
    ///
    /// Accepts `0/1`, `true/false`, `yes/no` and `y/n` (case-insensitive,
    /// surrounding whitespace ignored). Anything else is kept as
    /// [`Outcome::Invalid`] so the quality report can count it.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "y" => Outcome::Success,
            "0" | "false" | "no" | "n" => Outcome::Failure,
            _ => Outcome::Invalid(raw.to_string()),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Outcome::Success => Some(true),
            Outcome::Failure => Some(false),
            Outcome::Invalid(_) => None,
        }
    }
}

impl From<bool> for Outcome {
    fn from(value: bool) -> Self {
        if value {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// One subject row. `None` means the field is missing on this row.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectRecord {
    pub subject_id: Option<SubjectId>,
    pub arm: Option<String>,
    pub outcome: Option<Outcome>,
    /// Aligned with [`DatasetView::covariate_names`].
    pub covariates: Vec<Option<String>>,
}

impl SubjectRecord {
    pub fn new(subject_id: impl Into<SubjectId>, arm: impl Into<String>, converted: bool) -> Self {
        Self {
            subject_id: Some(subject_id.into()),
            arm: Some(arm.into()),
            outcome: Some(Outcome::from(converted)),
            covariates: Vec::new(),
        }
    }

    pub fn with_covariates<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.covariates = values.into_iter().map(|v| Some(v.into())).collect();
        self
    }

    fn converted(&self) -> Option<bool> {
        self.outcome.as_ref().and_then(Outcome::as_bool)
    }
}

/// Per-arm count aggregate: `n` subjects, `successes` of which converted.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    arm: String,
    n: u64,
    successes: u64,
}

impl GroupSummary {
    pub fn new(arm: impl Into<String>, n: u64, successes: u64) -> Result<Self> {
        let arm = arm.into();
        if successes > n {
            return Err(AuditError::InvalidInput(format!(
                "arm '{}' has {} successes out of {} subjects",
                arm, successes, n
            )));
        }
        Ok(Self { arm, n, successes })
    }

    pub fn arm(&self) -> &str {
        &self.arm
    }

    pub fn n(&self) -> u64 {
        self.n
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    /// `successes / n`. Fails with [`AuditError::EmptyGroup`] when `n == 0`.
    pub fn rate(&self) -> Result<f64> {
        if self.n == 0 {
            return Err(AuditError::EmptyGroup(self.arm.clone()));
        }
        Ok(self.successes as f64 / self.n as f64)
    }
}

/// Counts for one covariate stratum, both arms.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StratumCounts {
    pub label: String,
    pub control_n: u64,
    pub control_successes: u64,
    pub treatment_n: u64,
    pub treatment_successes: u64,
}

impl StratumCounts {
    pub fn new(
        label: impl Into<String>,
        control_n: u64,
        control_successes: u64,
        treatment_n: u64,
        treatment_successes: u64,
    ) -> Self {
        Self {
            label: label.into(),
            control_n,
            control_successes,
            treatment_n,
            treatment_successes,
        }
    }

    pub fn total_n(&self) -> u64 {
        self.control_n + self.treatment_n
    }

    pub fn has_zero_cell(&self) -> bool {
        self.control_n == 0 || self.treatment_n == 0
    }
}

/// Immutable view over experiment rows.
#[derive(Debug, Clone)]
pub struct DatasetView {
    arms: ArmLabels,
    covariate_names: Vec<String>,
    records: Vec<SubjectRecord>,
}

impl DatasetView {
    pub fn new(
        arms: ArmLabels,
        covariate_names: Vec<String>,
        records: Vec<SubjectRecord>,
    ) -> Result<Self> {
        arms.validate()?;

        let mut seen = HashSet::new();
        for name in &covariate_names {
            if !seen.insert(name.as_str()) {
                return Err(AuditError::InvalidInput(format!(
                    "covariate '{}' declared twice",
                    name
                )));
            }
        }

        if let Some((row, record)) = records
            .iter()
            .enumerate()
            .find(|(_, r)| r.covariates.len() != covariate_names.len())
        {
            return Err(AuditError::InvalidInput(format!(
                "row {} has {} covariate values, expected {}",
                row,
                record.covariates.len(),
                covariate_names.len()
            )));
        }

        Ok(Self {
            arms,
            covariate_names,
            records,
        })
    }

    pub fn arms(&self) -> &ArmLabels {
        &self.arms
    }

    pub fn covariate_names(&self) -> &[String] {
        &self.covariate_names
    }

    pub fn records(&self) -> &[SubjectRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn covariate_index(&self, name: &str) -> Result<usize> {
        self.covariate_names
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| AuditError::Schema(name.to_string()))
    }

    /// Rows per declared arm, control first. Arms with no rows report 0.
    /// Rows outside the declared label pair are not counted.
    pub fn arm_counts(&self) -> IndexMap<String, u64> {
        let mut counts: IndexMap<String, u64> = self
            .arms
            .as_array()
            .iter()
            .map(|a| (a.to_string(), 0))
            .collect();
        for record in &self.records {
            if let Some(n) = record.arm.as_deref().and_then(|a| counts.get_mut(a)) {
                *n += 1;
            }
        }
        counts
    }

    /// Count summary for one arm over rows with a readable outcome.
    pub fn group_summary(&self, arm: &str) -> Result<GroupSummary> {
        if !self.arms.contains(arm) {
            return Err(AuditError::InvalidInput(format!(
                "'{}' is not one of the declared arms {:?}",
                arm,
                self.arms.as_array()
            )));
        }
        let (n, successes) = self
            .records
            .iter()
            .filter(|r| r.arm.as_deref() == Some(arm))
            .filter_map(SubjectRecord::converted)
            .fold((0u64, 0u64), |(n, s), converted| (n + 1, s + u64::from(converted)));
        GroupSummary::new(arm, n, successes)
    }

    /// `(control, treatment)` summaries.
    pub fn summaries(&self) -> Result<(GroupSummary, GroupSummary)> {
        Ok((
            self.group_summary(&self.arms.control)?,
            self.group_summary(&self.arms.treatment)?,
        ))
    }

    pub fn arm_column(&self) -> Vec<Option<&str>> {
        self.records.iter().map(|r| r.arm.as_deref()).collect()
    }

    /// Values of one covariate, row-aligned with [`Self::arm_column`].
    pub fn covariate_column(&self, name: &str) -> Result<Vec<Option<&str>>> {
        let idx = self.covariate_index(name)?;
        Ok(self
            .records
            .iter()
            .map(|r| r.covariates[idx].as_deref())
            .collect())
    }

    /// Per-stratum counts keyed by the joined labels of `covariates`.
    ///
    /// Only rows with a declared arm and a readable outcome are counted.
    /// Missing covariate values form their own [`MISSING_CATEGORY`] stratum.
    /// Strata come back sorted by label.
    pub fn strata(&self, covariates: &[String]) -> Result<Vec<StratumCounts>> {
        if covariates.is_empty() {
            return Err(AuditError::InvalidInput(
                "stratification needs at least one covariate".to_string(),
            ));
        }
        let indices = covariates
            .iter()
            .map(|c| self.covariate_index(c))
            .collect::<Result<Vec<_>>>()?;

        let mut strata: BTreeMap<String, StratumCounts> = BTreeMap::new();
        for record in &self.records {
            let Some(arm) = record.arm.as_deref() else {
                continue;
            };
            if !self.arms.contains(arm) {
                continue;
            }
            let Some(converted) = record.converted() else {
                continue;
            };

            let label = indices
                .iter()
                .map(|&i| record.covariates[i].as_deref().unwrap_or(MISSING_CATEGORY))
                .collect::<Vec<_>>()
                .join(STRATUM_SEPARATOR);

            let entry = strata
                .entry(label.clone())
                .or_insert_with(|| StratumCounts::new(label, 0, 0, 0, 0));
            if arm == self.arms.control {
                entry.control_n += 1;
                entry.control_successes += u64::from(converted);
            } else {
                entry.treatment_n += 1;
                entry.treatment_successes += u64::from(converted);
            }
        }

        Ok(strata.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arms() -> ArmLabels {
        ArmLabels::new("psa", "ad").unwrap()
    }

    fn sample_view() -> DatasetView {
        let records = vec![
            SubjectRecord::new("1", "ad", true).with_covariates(["Monday"]),
            SubjectRecord::new("2", "ad", false).with_covariates(["Monday"]),
            SubjectRecord::new("3", "psa", false).with_covariates(["Monday"]),
            SubjectRecord::new("4", "ad", false).with_covariates(["Tuesday"]),
            SubjectRecord::new("5", "psa", true).with_covariates(["Tuesday"]),
            SubjectRecord::new("6", "other", true).with_covariates(["Tuesday"]),
        ];
        DatasetView::new(arms(), vec!["most_ads_day".to_string()], records).unwrap()
    }

    // ── ArmLabels ───────────────────────────────────────────────────

    #[test]
    fn arm_labels_must_differ() {
        assert!(ArmLabels::new("a", "a").is_err());
    }

    #[test]
    fn arm_labels_must_be_non_empty() {
        assert!(ArmLabels::new("", "ad").is_err());
    }

    #[test]
    fn arm_labels_array_is_control_first() {
        assert_eq!(arms().as_array(), ["psa", "ad"]);
    }

    // ── Outcome coercion ────────────────────────────────────────────

    #[test]
    fn outcome_parses_common_binary_spellings() {
        for raw in ["1", "true", "TRUE", " yes ", "Y"] {
            assert_eq!(Outcome::parse(raw), Outcome::Success, "raw={raw}");
        }
        for raw in ["0", "False", "no", "n"] {
            assert_eq!(Outcome::parse(raw), Outcome::Failure, "raw={raw}");
        }
    }

    #[test]
    fn outcome_keeps_unreadable_values() {
        assert_eq!(Outcome::parse("2"), Outcome::Invalid("2".to_string()));
        assert_eq!(Outcome::parse("maybe").as_bool(), None);
    }

    // ── GroupSummary ────────────────────────────────────────────────

    #[test]
    fn group_summary_rejects_more_successes_than_subjects() {
        assert!(matches!(
            GroupSummary::new("ad", 5, 6),
            Err(AuditError::InvalidInput(_))
        ));
    }

    #[test]
    fn group_summary_rate_fails_on_empty_group() {
        let g = GroupSummary::new("psa", 0, 0).unwrap();
        assert_eq!(g.rate(), Err(AuditError::EmptyGroup("psa".to_string())));
    }

    #[test]
    fn group_summary_rate() {
        let g = GroupSummary::new("psa", 23524, 420).unwrap();
        assert!((g.rate().unwrap() - 0.017854).abs() < 1e-6);
    }

    // ── DatasetView ─────────────────────────────────────────────────

    #[test]
    fn view_rejects_misaligned_covariates() {
        let records = vec![SubjectRecord::new("1", "ad", true)];
        let err = DatasetView::new(arms(), vec!["day".to_string()], records).unwrap_err();
        assert!(matches!(err, AuditError::InvalidInput(_)));
    }

    #[test]
    fn view_rejects_duplicate_covariate_names() {
        let err = DatasetView::new(arms(), vec!["day".into(), "day".into()], vec![]).unwrap_err();
        assert!(matches!(err, AuditError::InvalidInput(_)));
    }

    #[test]
    fn arm_counts_ignore_labels_outside_the_declared_pair() {
        let counts = sample_view().arm_counts();
        assert_eq!(counts.get("psa"), Some(&2));
        assert_eq!(counts.get("ad"), Some(&3));
        assert_eq!(counts.len(), 2);
        assert_eq!(counts.keys().next().map(String::as_str), Some("psa"));
    }

    #[test]
    fn group_summary_counts_successes() {
        let (control, treatment) = sample_view().summaries().unwrap();
        assert_eq!((control.n(), control.successes()), (2, 1));
        assert_eq!((treatment.n(), treatment.successes()), (3, 1));
    }

    #[test]
    fn group_summary_skips_invalid_outcomes() {
        let mut record = SubjectRecord::new("9", "ad", true);
        record.outcome = Some(Outcome::Invalid("x".into()));
        let view = DatasetView::new(arms(), vec![], vec![record, SubjectRecord::new("1", "ad", true)])
            .unwrap();
        let g = view.group_summary("ad").unwrap();
        assert_eq!((g.n(), g.successes()), (1, 1));
    }

    #[test]
    fn group_summary_rejects_unknown_arm() {
        assert!(sample_view().group_summary("other").is_err());
    }

    #[test]
    fn covariate_column_unknown_name_is_schema_error() {
        assert_eq!(
            sample_view().covariate_column("hour").unwrap_err(),
            AuditError::Schema("hour".to_string())
        );
    }

    #[test]
    fn strata_are_sorted_and_exclude_undeclared_arms() {
        let strata = sample_view().strata(&["most_ads_day".to_string()]).unwrap();
        assert_eq!(strata.len(), 2);
        assert_eq!(strata[0], StratumCounts::new("Monday", 1, 0, 2, 1));
        assert_eq!(strata[1], StratumCounts::new("Tuesday", 1, 1, 1, 0));
    }

    #[test]
    fn strata_group_missing_values() {
        let mut record = SubjectRecord::new("1", "ad", true);
        record.covariates = vec![None];
        let view = DatasetView::new(arms(), vec!["day".into()], vec![record]).unwrap();
        let strata = view.strata(&["day".to_string()]).unwrap();
        assert_eq!(strata[0].label, MISSING_CATEGORY);
    }

    #[test]
    fn strata_join_multiple_covariates() {
        let records = vec![
            SubjectRecord::new("1", "ad", true).with_covariates(["Monday", "10"]),
            SubjectRecord::new("2", "psa", false).with_covariates(["Monday", "10"]),
        ];
        let view = DatasetView::new(arms(), vec!["day".into(), "hour".into()], records).unwrap();
        let strata = view.strata(&["day".to_string(), "hour".to_string()]).unwrap();
        assert_eq!(strata.len(), 1);
        assert_eq!(strata[0].label, "Monday | 10");
        assert_eq!(strata[0].total_n(), 2);
    }
}
