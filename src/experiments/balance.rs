//! Covariate balance: chi-square independence of a categorical covariate
//! against arm, reported together with Cramér's V.

use std::collections::BTreeMap;

use serde::Serialize;

use super::allocation::check_alpha;
use super::stats;
use crate::dataset::{ArmLabels, DatasetView};
use crate::error::{AuditError, Result};

/// Magnitude label for Cramér's V.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EffectMagnitude {
    Negligible,
    Small,
    Medium,
    Large,
}

/// Lower bound of each magnitude bin. Bins are half-open `[lower, next)`.
const MAGNITUDE_CUTS: [(f64, EffectMagnitude); 4] = [
    (0.0, EffectMagnitude::Negligible),
    (0.1, EffectMagnitude::Small),
    (0.3, EffectMagnitude::Medium),
    (0.5, EffectMagnitude::Large),
];

impl EffectMagnitude {
    /// Total over V: NaN and negatives land in `Negligible`.
    pub fn from_v(v: f64) -> Self {
        MAGNITUDE_CUTS
            .iter()
            .rev()
            .find(|(lower, _)| v >= *lower)
            .map(|(_, m)| *m)
            .unwrap_or(EffectMagnitude::Negligible)
    }
}

/// Category × arm counts. Rows are covariate categories in sorted order,
/// columns are arms in declared order (control first).
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContingencyTable {
    pub categories: Vec<String>,
    pub arms: Vec<String>,
    pub counts: Vec<Vec<u64>>,
}

impl ContingencyTable {
    /// Cross-tabulates two row-aligned columns. Rows with a missing covariate
    /// or an arm outside `arms` are not counted.
    pub fn from_columns(
        covariate: &[Option<&str>],
        arm_column: &[Option<&str>],
        arms: &ArmLabels,
    ) -> Result<Self> {
        if covariate.len() != arm_column.len() {
            return Err(AuditError::InvalidInput(format!(
                "covariate column has {} rows, arm column has {}",
                covariate.len(),
                arm_column.len()
            )));
        }
        let arm_order = arms.as_array();
        let mut rows: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
        for (category, arm) in covariate.iter().zip(arm_column) {
            let (Some(category), Some(arm)) = (category, arm) else {
                continue;
            };
            let Some(col) = arm_order.iter().position(|a| a == arm) else {
                continue;
            };
            rows.entry(category).or_insert_with(|| vec![0; arm_order.len()])[col] += 1;
        }
        Ok(Self {
            categories: rows.keys().map(|c| c.to_string()).collect(),
            arms: arm_order.iter().map(|a| a.to_string()).collect(),
            counts: rows.into_values().collect(),
        })
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    pub fn row_sums(&self) -> Vec<u64> {
        self.counts.iter().map(|r| r.iter().sum()).collect()
    }

    pub fn column_sums(&self) -> Vec<u64> {
        let mut sums = vec![0u64; self.arms.len()];
        for row in &self.counts {
            for (s, c) in sums.iter_mut().zip(row) {
                *s += c;
            }
        }
        sums
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResult {
    pub covariate: String,
    pub table: ContingencyTable,
    pub chi_square: f64,
    pub degrees_of_freedom: u64,
    pub p_value: f64,
    pub cramers_v: f64,
    pub magnitude: EffectMagnitude,
    pub alpha: f64,
    pub significant: bool,
}

/// Balance check of one covariate straight from a dataset view.
pub fn check_covariate(view: &DatasetView, covariate: &str, alpha: f64) -> Result<BalanceResult> {
    let column = view.covariate_column(covariate)?;
    check(covariate, &column, &view.arm_column(), view.arms(), alpha)
}

pub fn check(
    covariate: &str,
    covariate_column: &[Option<&str>],
    arm_column: &[Option<&str>],
    arms: &ArmLabels,
    alpha: f64,
) -> Result<BalanceResult> {
    let table = ContingencyTable::from_columns(covariate_column, arm_column, arms)?;
    check_table(covariate, table, alpha)
}

/// Chi-square test of independence on a prebuilt table.
pub fn check_table(covariate: &str, table: ContingencyTable, alpha: f64) -> Result<BalanceResult> {
    check_alpha(alpha)?;

    let r = table.counts.len();
    let c = table.arms.len();
    if r < 2 || c < 2 {
        return Err(AuditError::InsufficientCells(format!(
            "covariate '{}' gives a {}x{} table, need at least 2x2",
            covariate, r, c
        )));
    }
    if table.counts.iter().any(|row| row.len() != c) {
        return Err(AuditError::InvalidInput(format!(
            "covariate '{}' table rows must all have {} columns",
            covariate, c
        )));
    }
    let row_sums = table.row_sums();
    let col_sums = table.column_sums();
    if let Some(i) = row_sums.iter().position(|&s| s == 0) {
        return Err(AuditError::InsufficientCells(format!(
            "covariate '{}' category '{}' has no observations",
            covariate, table.categories[i]
        )));
    }
    if let Some(j) = col_sums.iter().position(|&s| s == 0) {
        return Err(AuditError::InsufficientCells(format!(
            "covariate '{}' has no observations in arm '{}'",
            covariate, table.arms[j]
        )));
    }

    let n = table.total() as f64;
    let mut observed = Vec::with_capacity(r * c);
    let mut expected = Vec::with_capacity(r * c);
    for (row, &rs) in table.counts.iter().zip(&row_sums) {
        for (&o, &cs) in row.iter().zip(&col_sums) {
            observed.push(o as f64);
            expected.push(rs as f64 * cs as f64 / n);
        }
    }
    let chi_square = stats::pearson_statistic(&observed, &expected);
    let degrees_of_freedom = ((r - 1) * (c - 1)) as u64;
    let p_value = stats::chi_square_sf(chi_square, degrees_of_freedom);

    let min_dim = (r.min(c) - 1) as f64;
    let cramers_v = (chi_square / (n * min_dim)).sqrt().clamp(0.0, 1.0);
    let magnitude = EffectMagnitude::from_v(cramers_v);

    tracing::debug!(
        covariate,
        chi_square,
        p_value,
        cramers_v,
        ?magnitude,
        "balance check"
    );

    Ok(BalanceResult {
        covariate: covariate.to_string(),
        table,
        chi_square,
        degrees_of_freedom,
        p_value,
        cramers_v,
        magnitude,
        alpha,
        significant: p_value < alpha,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(counts: Vec<Vec<u64>>) -> ContingencyTable {
        ContingencyTable {
            categories: (0..counts.len()).map(|i| format!("c{i}")).collect(),
            arms: vec!["psa".into(), "ad".into()],
            counts,
        }
    }

    // ── Magnitude lookup ────────────────────────────────────────────

    #[test]
    fn magnitude_bins_are_half_open() {
        assert_eq!(EffectMagnitude::from_v(0.0), EffectMagnitude::Negligible);
        assert_eq!(EffectMagnitude::from_v(0.0999), EffectMagnitude::Negligible);
        assert_eq!(EffectMagnitude::from_v(0.1), EffectMagnitude::Small);
        assert_eq!(EffectMagnitude::from_v(0.3), EffectMagnitude::Medium);
        assert_eq!(EffectMagnitude::from_v(0.4999), EffectMagnitude::Medium);
        assert_eq!(EffectMagnitude::from_v(0.5), EffectMagnitude::Large);
        assert_eq!(EffectMagnitude::from_v(1.0), EffectMagnitude::Large);
    }

    #[test]
    fn magnitude_is_total_over_nan() {
        assert_eq!(EffectMagnitude::from_v(f64::NAN), EffectMagnitude::Negligible);
    }

    // ── Contingency table ───────────────────────────────────────────

    #[test]
    fn table_from_columns_skips_missing_and_undeclared() {
        let cov = [Some("Mon"), Some("Tue"), None, Some("Mon"), Some("Mon")];
        let arm = [Some("psa"), Some("ad"), Some("ad"), Some("other"), Some("ad")];
        let t = ContingencyTable::from_columns(&cov, &arm, &ArmLabels::default()).unwrap();
        assert_eq!(t.categories, vec!["Mon", "Tue"]);
        assert_eq!(t.arms, vec!["psa", "ad"]);
        assert_eq!(t.counts, vec![vec![1, 1], vec![0, 1]]);
        assert_eq!(t.total(), 3);
    }

    #[test]
    fn table_rejects_misaligned_columns() {
        let err = ContingencyTable::from_columns(&[Some("a")], &[], &ArmLabels::default());
        assert!(matches!(err, Err(AuditError::InvalidInput(_))));
    }

    // ── Independence test ───────────────────────────────────────────

    #[test]
    fn proportional_table_has_zero_v() {
        let r = check_table("day", table(vec![vec![10, 90], vec![20, 180], vec![5, 45]]), 0.05)
            .unwrap();
        assert!(r.chi_square.abs() < 1e-12);
        assert!(r.cramers_v.abs() < 1e-6);
        assert_eq!(r.magnitude, EffectMagnitude::Negligible);
        assert_eq!(r.degrees_of_freedom, 2);
        assert!(!r.significant);
    }

    #[test]
    fn perfectly_separated_table_has_v_one() {
        let r = check_table("day", table(vec![vec![50, 0], vec![0, 50]]), 0.05).unwrap();
        assert!((r.cramers_v - 1.0).abs() < 1e-12);
        assert_eq!(r.magnitude, EffectMagnitude::Large);
        assert!(r.significant);
    }

    #[test]
    fn two_by_two_matches_hand_computation() {
        // [[30, 10], [20, 40]]: chi2 = 16.6667, V = sqrt(16.6667 / 100)
        let r = check_table("x", table(vec![vec![30, 10], vec![20, 40]]), 0.05).unwrap();
        assert!((r.chi_square - 50.0 / 3.0).abs() < 1e-9, "chi2={}", r.chi_square);
        assert!((r.cramers_v - (1.0f64 / 6.0).sqrt()).abs() < 1e-9);
        assert_eq!(r.magnitude, EffectMagnitude::Medium);
        assert_eq!(r.degrees_of_freedom, 1);
    }

    #[test]
    fn large_n_trivial_difference_is_significant_but_negligible() {
        let r = check_table(
            "hour",
            table(vec![vec![251_000, 249_000], vec![249_000, 251_000]]),
            0.05,
        )
        .unwrap();
        assert!(r.significant, "p={}", r.p_value);
        assert_eq!(r.magnitude, EffectMagnitude::Negligible);
    }

    #[test]
    fn single_category_is_insufficient() {
        let err = check_table("day", table(vec![vec![10, 10]]), 0.05).unwrap_err();
        assert!(matches!(err, AuditError::InsufficientCells(_)));
    }

    #[test]
    fn empty_arm_column_is_insufficient() {
        let err = check_table("day", table(vec![vec![10, 0], vec![5, 0]]), 0.05).unwrap_err();
        assert!(matches!(err, AuditError::InsufficientCells(_)));
    }

    #[test]
    fn empty_category_row_is_insufficient() {
        let err = check_table("day", table(vec![vec![10, 3], vec![0, 0]]), 0.05).unwrap_err();
        assert!(matches!(err, AuditError::InsufficientCells(_)));
    }
}
