use statrs::function::erf::{erfc, erfc_inv};
use statrs::function::gamma::gamma_ur;

// ── Standard Normal ─────────────────────────────────────────────────

/// Computes P(Z > z) for the standard normal distribution.
/// Goes through `erfc`, so the far tail keeps full relative precision
/// (z = 7.37 still resolves to ~1e-13 instead of rounding to 0).
pub fn normal_sf(z: f64) -> f64 {
    0.5 * erfc(z / std::f64::consts::SQRT_2)
}

/// Two-sided p-value for a z statistic: P(|Z| > |z|).
pub fn two_sided_p_value(z: f64) -> f64 {
    erfc(z.abs() / std::f64::consts::SQRT_2).clamp(0.0, 1.0)
}

/// Inverse standard normal CDF. Returns z such that P(Z < z) = p.
pub fn normal_quantile(p: f64) -> f64 {
    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    -std::f64::consts::SQRT_2 * erfc_inv(2.0 * p)
}

/// Two-sided critical value for a confidence level, e.g. 0.95 -> 1.95996.
pub fn z_critical(confidence_level: f64) -> f64 {
    normal_quantile(1.0 - (1.0 - confidence_level) / 2.0)
}

// ── Chi-Square ──────────────────────────────────────────────────────

/// Survival function of the chi-square distribution with `df` degrees of
/// freedom: P(X > x), via the regularized upper incomplete gamma Q(df/2, x/2).
pub fn chi_square_sf(x: f64, df: u64) -> f64 {
    debug_assert!(df > 0, "chi_square_sf requires df > 0");
    if x.is_nan() {
        return f64::NAN;
    }
    if x <= 0.0 {
        return 1.0;
    }
    if x.is_infinite() {
        return 0.0;
    }
    gamma_ur(df as f64 / 2.0, x / 2.0).clamp(0.0, 1.0)
}

/// Pearson chi-square contribution `Σ (observed − expected)² / expected`.
/// Callers guarantee every expected value is strictly positive.
pub fn pearson_statistic(observed: &[f64], expected: &[f64]) -> f64 {
    debug_assert_eq!(observed.len(), expected.len());
    observed
        .iter()
        .zip(expected)
        .map(|(o, e)| (o - e).powi(2) / e)
        .sum()
}
