mod loader;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use indexmap::IndexMap;
use liftaudit::experiments::{allocation, lift};
use liftaudit::{
    run_audit, ArmLabels, AuditConfig, GroupSummary, NamedSlice, PoolingWeights, PowerPlanner,
    ReferenceSplit, Sidedness, SliceOutcome, SrmResult,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Strict default for the allocation verdict when no config sets one.
const DEFAULT_SRM_ALPHA: f64 = 0.01;

#[derive(Parser)]
#[command(name = "liftaudit", version, about = "Audit a two-arm exposure experiment")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Pretty-print JSON output
    #[arg(long, global = true)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full audit over a CSV export
    Audit(AuditArgs),
    /// Compare two arms from summary counts
    Lift(LiftArgs),
    /// Sample-ratio-mismatch check of arm counts against reference splits
    Srm(SrmArgs),
    /// Sample size and runtime for a follow-up test
    Power(PowerArgs),
    /// Minimum detectable lift for given arm sizes
    Mde(MdeArgs),
}

#[derive(Args)]
struct AuditArgs {
    /// CSV with test_group and converted columns
    #[arg(long, env = "LIFTAUDIT_DATA")]
    data: PathBuf,
    /// JSON audit configuration; flags override its values
    #[arg(long, env = "LIFTAUDIT_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "LIFTAUDIT_ALPHA")]
    alpha: Option<f64>,
    #[arg(long, env = "LIFTAUDIT_SRM_ALPHA")]
    srm_alpha: Option<f64>,
    #[arg(long, env = "LIFTAUDIT_CONFIDENCE_LEVEL")]
    confidence_level: Option<f64>,
    #[arg(long)]
    control: Option<String>,
    #[arg(long)]
    treatment: Option<String>,
    /// Reference split, e.g. `96/4:psa=0.04,ad=0.96` (repeatable)
    #[arg(long = "reference", value_parser = parse_reference)]
    references: Vec<ReferenceSplit>,
    /// Covariate to balance-check (repeatable)
    #[arg(long = "balance")]
    balance: Vec<String>,
    /// Covariate to stratify the lift by (repeatable; several combine)
    #[arg(long = "stratify-by")]
    stratify_by: Vec<String>,
    #[arg(long)]
    min_per_arm: Option<u64>,
    /// Pool strata by sample size instead of inverse variance
    #[arg(long)]
    weight_by_size: bool,
}

#[derive(Args)]
struct LiftArgs {
    #[arg(long)]
    control_n: u64,
    #[arg(long)]
    control_successes: u64,
    #[arg(long)]
    treatment_n: u64,
    #[arg(long)]
    treatment_successes: u64,
    #[arg(long, env = "LIFTAUDIT_CONFIDENCE_LEVEL", default_value_t = 0.95)]
    confidence_level: f64,
    /// Fail instead of warning when counts are too small for the normal approximation
    #[arg(long)]
    strict: bool,
}

#[derive(Args)]
struct SrmArgs {
    /// Observed count, e.g. `psa=23524` (repeatable)
    #[arg(long = "count", value_parser = parse_count, required = true)]
    counts: Vec<(String, u64)>,
    /// Reference split, e.g. `96/4:psa=0.04,ad=0.96` (repeatable; default equal split)
    #[arg(long = "reference", value_parser = parse_reference)]
    references: Vec<ReferenceSplit>,
    #[arg(long, env = "LIFTAUDIT_SRM_ALPHA", default_value_t = DEFAULT_SRM_ALPHA)]
    alpha: f64,
}

#[derive(Args)]
struct PowerArgs {
    #[arg(long)]
    baseline: f64,
    /// Absolute lift to detect, as a probability (0.0077 = 0.77 pp)
    #[arg(long)]
    lift: f64,
    #[arg(long, env = "LIFTAUDIT_ALPHA", default_value_t = 0.05)]
    alpha: f64,
    #[arg(long, default_value_t = 0.80)]
    power: f64,
    #[arg(long, default_value_t = 0.5)]
    treatment_share: f64,
    #[arg(long)]
    daily_volume: Option<u64>,
    #[arg(long)]
    one_sided: bool,
}

#[derive(Args)]
struct MdeArgs {
    #[arg(long)]
    control_n: u64,
    #[arg(long)]
    treatment_n: u64,
    #[arg(long)]
    baseline: f64,
    #[arg(long, env = "LIFTAUDIT_ALPHA", default_value_t = 0.05)]
    alpha: f64,
    #[arg(long, default_value_t = 0.80)]
    power: f64,
    #[arg(long)]
    one_sided: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MdeOutput {
    n_control: u64,
    n_treatment: u64,
    baseline_rate: f64,
    alpha: f64,
    power: f64,
    sidedness: Sidedness,
    mde: f64,
}

fn parse_count(raw: &str) -> Result<(String, u64), String> {
    let (arm, n) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected ARM=COUNT, got '{}'", raw))?;
    let n = n
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid count in '{}': {}", raw, e))?;
    Ok((arm.trim().to_string(), n))
}

/// `NAME:ARM=P,ARM=P`, or just `ARM=P,ARM=P` (the text itself becomes the name).
fn parse_reference(raw: &str) -> Result<ReferenceSplit, String> {
    let (name, body) = match raw.split_once(':') {
        Some((name, body)) => (name.trim(), body),
        None => (raw.trim(), raw),
    };
    let proportions = body
        .split(',')
        .map(|pair| {
            let (arm, p) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected ARM=PROPORTION, got '{}'", pair))?;
            let p = p
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("invalid proportion in '{}': {}", pair, e))?;
            Ok((arm.trim().to_string(), p))
        })
        .collect::<Result<Vec<_>, String>>()?;
    ReferenceSplit::new(name, proportions).map_err(|e| e.to_string())
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<(), Box<dyn std::error::Error>> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", out);
    Ok(())
}

fn sidedness(one_sided: bool) -> Sidedness {
    if one_sided {
        Sidedness::OneSided
    } else {
        Sidedness::TwoSided
    }
}

fn resolve_audit_config(args: &AuditArgs) -> Result<AuditConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => AuditConfig::from_json_file(path)?,
        None => AuditConfig::default(),
    };
    if config.srm_alpha.is_none() {
        config.srm_alpha = Some(DEFAULT_SRM_ALPHA);
    }
    if let Some(alpha) = args.alpha {
        config.alpha = alpha;
    }
    if let Some(srm_alpha) = args.srm_alpha {
        config.srm_alpha = Some(srm_alpha);
    }
    if let Some(level) = args.confidence_level {
        config.confidence_level = level;
    }
    let control = args.control.as_deref().unwrap_or(&config.arms.control);
    let treatment = args.treatment.as_deref().unwrap_or(&config.arms.treatment);
    config.arms = ArmLabels::new(loader::normalize_arm(control), loader::normalize_arm(treatment))?;
    if !args.references.is_empty() {
        config.references = args.references.clone();
    }
    config.references = config
        .references
        .iter()
        .map(|r| {
            ReferenceSplit::new(
                r.name.clone(),
                r.proportions.iter().map(|(arm, &p)| (loader::normalize_arm(arm), p)),
            )
        })
        .collect::<liftaudit::Result<Vec<_>>>()?;
    if !args.balance.is_empty() {
        config.balance_covariates = args.balance.clone();
    }
    if !args.stratify_by.is_empty() {
        config.stratify_by = args.stratify_by.clone();
    }
    if let Some(min) = args.min_per_arm {
        config.stratification.min_per_arm = min;
    }
    if args.weight_by_size {
        config.stratification.weighting = PoolingWeights::SampleSize;
    }
    config.validate()?;
    Ok(config)
}

fn run_audit_command(args: &AuditArgs, pretty: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = resolve_audit_config(args)?;
    // Covariates are addressed by their normalised column names.
    for name in config.balance_covariates.iter_mut().chain(config.stratify_by.iter_mut()) {
        *name = loader::normalize_header(name);
    }
    let mut columns = config.balance_covariates.clone();
    columns.extend(config.stratify_by.iter().cloned());
    let view = loader::load_csv(&args.data, &config.arms, &columns)?;
    let report = run_audit(&view, &config)?;
    print_json(&report, pretty)
}

fn run_lift_command(args: &LiftArgs, pretty: bool) -> Result<(), Box<dyn std::error::Error>> {
    let arms = ArmLabels::default();
    let control = GroupSummary::new(arms.control, args.control_n, args.control_successes)?;
    let treatment = GroupSummary::new(arms.treatment, args.treatment_n, args.treatment_successes)?;
    let result = if args.strict {
        lift::estimate_strict(&control, &treatment, args.confidence_level)?
    } else {
        lift::estimate(&control, &treatment, args.confidence_level)?
    };
    print_json(&result, pretty)
}

fn run_srm_command(args: &SrmArgs, pretty: bool) -> Result<(), Box<dyn std::error::Error>> {
    let counts: IndexMap<String, u64> = args.counts.iter().cloned().collect();
    let references = if args.references.is_empty() {
        let share = 1.0 / args.counts.len() as f64;
        vec![ReferenceSplit::new(
            "equal",
            args.counts.iter().map(|(arm, _)| (arm.clone(), share)),
        )?]
    } else {
        args.references.clone()
    };
    let slices = references
        .iter()
        .zip(allocation::audit_all(&counts, &references, args.alpha))
        .map(|(reference, result)| -> liftaudit::Result<NamedSlice<SrmResult>> {
            Ok(NamedSlice {
                name: reference.name.clone(),
                outcome: SliceOutcome::from_result(result)?,
            })
        })
        .collect::<liftaudit::Result<Vec<_>>>()?;
    print_json(&slices, pretty)
}

fn run_power_command(args: &PowerArgs, pretty: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut plan = PowerPlanner::new(sidedness(args.one_sided)).required_n(
        args.baseline,
        args.lift,
        args.alpha,
        args.power,
        args.treatment_share,
    )?;
    if let Some(volume) = args.daily_volume {
        plan = plan.with_daily_volume(volume)?;
    }
    print_json(&plan, pretty)
}

fn run_mde_command(args: &MdeArgs, pretty: bool) -> Result<(), Box<dyn std::error::Error>> {
    let sidedness = sidedness(args.one_sided);
    let mde = PowerPlanner::new(sidedness).mde_given_n(
        args.control_n,
        args.treatment_n,
        args.baseline,
        args.alpha,
        args.power,
    )?;
    print_json(
        &MdeOutput {
            n_control: args.control_n,
            n_treatment: args.treatment_n,
            baseline_rate: args.baseline,
            alpha: args.alpha,
            power: args.power,
            sidedness,
            mde,
        },
        pretty,
    )
}

fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "liftaudit=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let result = match &cli.command {
        Command::Audit(args) => run_audit_command(args, cli.pretty),
        Command::Lift(args) => run_lift_command(args, cli.pretty),
        Command::Srm(args) => run_srm_command(args, cli.pretty),
        Command::Power(args) => run_power_command(args, cli.pretty),
        Command::Mde(args) => run_mde_command(args, cli.pretty),
    };
    if let Err(e) = result {
        eprintln!("ERROR: {}", e);
        std::process::exit(1);
    }
}
