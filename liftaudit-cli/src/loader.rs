//! CSV loading into a [`DatasetView`].
//!
//! Headers are trimmed, lowercased and have inner spaces replaced by
//! underscores before the alias map is applied, so `Test Group`,
//! `test group` and `test_group` all name the arm column.

use std::io::Read;
use std::path::Path;

use liftaudit::{ArmLabels, AuditError, DatasetView, Outcome, Result, SubjectRecord};

pub const ARM_COLUMN: &str = "test_group";
pub const OUTCOME_COLUMN: &str = "converted";
pub const SUBJECT_COLUMN: &str = "user_id";

const HEADER_ALIASES: &[(&str, &str)] = &[
    ("test group", ARM_COLUMN),
    ("user id", SUBJECT_COLUMN),
    ("total ads", "total_ads"),
    ("most ads day", "most_ads_day"),
    ("most ads hour", "most_ads_hour"),
];

pub fn normalize_header(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    if let Some((_, canonical)) = HEADER_ALIASES.iter().find(|(alias, _)| *alias == lowered) {
        return canonical.to_string();
    }
    lowered.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Arm labels compare case-insensitively: cells and configured labels are
/// both trimmed and lowercased.
pub fn normalize_arm(raw: &str) -> String {
    raw.trim().to_lowercase()
}

fn csv_error(e: csv::Error) -> AuditError {
    AuditError::Io(e.to_string())
}

fn cell(record: &csv::StringRecord, idx: Option<usize>) -> Option<String> {
    idx.and_then(|i| record.get(i))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn load_csv(path: impl AsRef<Path>, arms: &ArmLabels, covariates: &[String]) -> Result<DatasetView> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|e| AuditError::Io(format!("cannot open {}: {}", path.display(), e)))?;
    load_reader(file, arms, covariates)
}

/// Reads rows with `test_group` and `converted` columns plus the requested
/// covariates. Arm labels are lowercased. Outcomes that cannot be read as
/// binary are kept as [`Outcome::Invalid`] for the quality report.
pub fn load_reader<R: Read>(reader: R, arms: &ArmLabels, covariates: &[String]) -> Result<DatasetView> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(normalize_header)
        .collect();
    let position = |name: &str| headers.iter().position(|h| h == name);

    let arm_idx = position(ARM_COLUMN).ok_or_else(|| AuditError::Schema(ARM_COLUMN.to_string()))?;
    let outcome_idx =
        position(OUTCOME_COLUMN).ok_or_else(|| AuditError::Schema(OUTCOME_COLUMN.to_string()))?;
    let subject_idx = position(SUBJECT_COLUMN);

    let mut covariate_names: Vec<String> = Vec::new();
    for name in covariates {
        let name = normalize_header(name);
        if !covariate_names.contains(&name) {
            covariate_names.push(name);
        }
    }
    let covariate_idx = covariate_names
        .iter()
        .map(|name| position(name).ok_or_else(|| AuditError::Schema(name.clone())))
        .collect::<Result<Vec<_>>>()?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(csv_error)?;
        records.push(SubjectRecord {
            subject_id: cell(&row, subject_idx),
            arm: cell(&row, Some(arm_idx)).map(|a| normalize_arm(&a)),
            outcome: cell(&row, Some(outcome_idx)).map(|o| Outcome::parse(&o)),
            covariates: covariate_idx.iter().map(|&i| cell(&row, Some(i))).collect(),
        });
    }
    tracing::info!(rows = records.len(), covariates = covariate_names.len(), "dataset loaded");

    DatasetView::new(arms.clone(), covariate_names, records)
}
