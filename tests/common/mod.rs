use liftaudit::{ArmLabels, DatasetView, SubjectRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[allow(dead_code)]
pub fn seeded(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Deterministic view from `(arm, day, n, successes)` cells. Subject ids are
/// unique across cells.
#[allow(dead_code)]
pub fn cells_view(cells: &[(&str, &str, usize, usize)]) -> DatasetView {
    let mut records = Vec::new();
    for (arm, day, n, successes) in cells {
        for i in 0..*n {
            let id = format!("{}-{}-{}", arm, day, i);
            records.push(SubjectRecord::new(id, *arm, i < *successes).with_covariates([*day]));
        }
    }
    DatasetView::new(ArmLabels::default(), vec!["most_ads_day".to_string()], records).unwrap()
}

/// Random view where arm, day and conversion are drawn independently:
/// treatment with probability `treatment_share`, a uniform day, and
/// conversion at `control_rate` or `treatment_rate`.
#[allow(dead_code)]
pub fn random_view(
    seed: u64,
    rows: usize,
    treatment_share: f64,
    control_rate: f64,
    treatment_rate: f64,
    days: &[&str],
) -> DatasetView {
    let mut rng = seeded(seed);
    let records = (0..rows)
        .map(|i| {
            let treated = rng.gen_bool(treatment_share);
            let (arm, rate) = if treated {
                ("ad", treatment_rate)
            } else {
                ("psa", control_rate)
            };
            let day = days[rng.gen_range(0..days.len())];
            SubjectRecord::new(i.to_string(), arm, rng.gen_bool(rate)).with_covariates([day])
        })
        .collect();
    DatasetView::new(ArmLabels::default(), vec!["most_ads_day".to_string()], records).unwrap()
}
