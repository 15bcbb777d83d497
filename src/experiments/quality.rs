use std::collections::HashSet;

use indexmap::IndexMap;
use serde::Serialize;

use crate::dataset::{DatasetView, Outcome};
use crate::error::{AuditError, Result};

/// Structural checks on a dataset. Counts are reported, never judged: the
/// caller decides which of them block an audit.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QualityReport {
    pub rows: u64,
    /// Rows repeating an earlier subject id. `None` when no row carries an id.
    pub duplicate_subject_count: Option<u64>,
    pub missing_subject_id_count: u64,
    pub missing_arm_count: u64,
    /// Rows whose arm is present but outside the declared pair.
    pub arm_domain_violation_count: u64,
    pub missing_or_invalid_outcome_count: u64,
    /// Rows per declared arm, control first.
    pub rows_per_arm: IndexMap<String, u64>,
}

impl QualityReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_subject_count.unwrap_or(0) == 0
            && self.missing_arm_count == 0
            && self.arm_domain_violation_count == 0
            && self.missing_or_invalid_outcome_count == 0
    }
}

/// Runs the structural checks. Fails with [`AuditError::Schema`] only when a
/// required field (`arm` or `outcome`) is absent from every row.
pub fn validate(view: &DatasetView) -> Result<QualityReport> {
    let records = view.records();
    if records.iter().all(|r| r.arm.is_none()) {
        return Err(AuditError::Schema("arm".to_string()));
    }
    if records.iter().all(|r| r.outcome.is_none()) {
        return Err(AuditError::Schema("outcome".to_string()));
    }

    let mut seen = HashSet::new();
    let mut duplicates = 0u64;
    let mut missing_ids = 0u64;
    let mut missing_arm = 0u64;
    let mut domain_violations = 0u64;
    let mut bad_outcomes = 0u64;

    for record in records {
        match &record.subject_id {
            Some(id) => {
                if !seen.insert(id.as_str()) {
                    duplicates += 1;
                }
            }
            None => missing_ids += 1,
        }
        match record.arm.as_deref() {
            None => missing_arm += 1,
            Some(arm) if !view.arms().contains(arm) => domain_violations += 1,
            Some(_) => {}
        }
        if matches!(record.outcome, None | Some(Outcome::Invalid(_))) {
            bad_outcomes += 1;
        }
    }

    let report = QualityReport {
        rows: records.len() as u64,
        duplicate_subject_count: (!seen.is_empty()).then_some(duplicates),
        missing_subject_id_count: missing_ids,
        missing_arm_count: missing_arm,
        arm_domain_violation_count: domain_violations,
        missing_or_invalid_outcome_count: bad_outcomes,
        rows_per_arm: view.arm_counts(),
    };

    if report.is_clean() {
        tracing::debug!(rows = report.rows, "data quality clean");
    } else {
        tracing::warn!(
            duplicates = ?report.duplicate_subject_count,
            missing_arm = report.missing_arm_count,
            arm_domain_violations = report.arm_domain_violation_count,
            bad_outcomes = report.missing_or_invalid_outcome_count,
            "data quality issues"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ArmLabels, SubjectRecord};

    fn view(records: Vec<SubjectRecord>) -> DatasetView {
        DatasetView::new(ArmLabels::default(), vec![], records).unwrap()
    }

    #[test]
    fn clean_dataset_reports_zero_counts() {
        let r = validate(&view(vec![
            SubjectRecord::new("1", "psa", false),
            SubjectRecord::new("2", "ad", true),
        ]))
        .unwrap();
        assert!(r.is_clean());
        assert_eq!(r.rows, 2);
        assert_eq!(r.duplicate_subject_count, Some(0));
        assert_eq!(r.rows_per_arm["psa"], 1);
        assert_eq!(r.rows_per_arm["ad"], 1);
    }

    #[test]
    fn duplicates_count_repeats_not_ids() {
        let r = validate(&view(vec![
            SubjectRecord::new("1", "psa", false),
            SubjectRecord::new("1", "psa", false),
            SubjectRecord::new("1", "ad", true),
            SubjectRecord::new("2", "ad", true),
        ]))
        .unwrap();
        assert_eq!(r.duplicate_subject_count, Some(2));
        assert!(!r.is_clean());
    }

    #[test]
    fn duplicates_unavailable_without_ids() {
        let mut record = SubjectRecord::new("x", "ad", true);
        record.subject_id = None;
        let r = validate(&view(vec![record])).unwrap();
        assert_eq!(r.duplicate_subject_count, None);
        assert_eq!(r.missing_subject_id_count, 1);
    }

    #[test]
    fn arm_outside_declared_pair_is_a_domain_violation() {
        let mut missing = SubjectRecord::new("3", "psa", true);
        missing.arm = None;
        let r = validate(&view(vec![
            SubjectRecord::new("1", "psa", false),
            SubjectRecord::new("2", "control", true),
            missing,
        ]))
        .unwrap();
        assert_eq!(r.arm_domain_violation_count, 1);
        assert_eq!(r.missing_arm_count, 1);
        assert_eq!(r.rows_per_arm["psa"], 1);
    }

    #[test]
    fn missing_and_invalid_outcomes_are_counted_together() {
        let mut missing = SubjectRecord::new("1", "psa", true);
        missing.outcome = None;
        let mut invalid = SubjectRecord::new("2", "ad", true);
        invalid.outcome = Some(Outcome::Invalid("maybe".into()));
        let r = validate(&view(vec![missing, invalid, SubjectRecord::new("3", "ad", false)])).unwrap();
        assert_eq!(r.missing_or_invalid_outcome_count, 2);
    }

    #[test]
    fn arm_absent_everywhere_is_schema_error() {
        let mut record = SubjectRecord::new("1", "psa", true);
        record.arm = None;
        assert_eq!(
            validate(&view(vec![record])).unwrap_err(),
            AuditError::Schema("arm".to_string())
        );
    }

    #[test]
    fn outcome_absent_everywhere_is_schema_error() {
        let mut record = SubjectRecord::new("1", "psa", true);
        record.outcome = None;
        assert_eq!(
            validate(&view(vec![record])).unwrap_err(),
            AuditError::Schema("outcome".to_string())
        );
    }

    #[test]
    fn empty_dataset_is_schema_error() {
        assert!(matches!(validate(&view(vec![])), Err(AuditError::Schema(_))));
    }
}
