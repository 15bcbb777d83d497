//! Audit engine for two-arm exposure experiments.
//!
//! Takes an already-collected [`DatasetView`] and answers three questions:
//! does the allocation and covariate timing match the declared design, how
//! large is the effect and how uncertain, and does the estimate survive
//! stratification. [`PowerPlanner`] sizes a follow-up test from summary
//! rates alone.
//!
//! Every computation is a pure function of its inputs. Configuration such as
//! alpha and the confidence level is passed into each call.

pub mod dataset;
pub mod error;
pub mod experiments;

pub use dataset::{
    ArmLabels, DatasetView, GroupSummary, Outcome, StratumCounts, SubjectId, SubjectRecord,
    MISSING_CATEGORY,
};
pub use error::{AuditError, Result};
pub use experiments::allocation::{ReferenceSplit, SrmResult, Verdict};
pub use experiments::audit::{run_audit, AuditReport, NamedSlice, SliceOutcome};
pub use experiments::balance::{BalanceResult, ContingencyTable, EffectMagnitude};
pub use experiments::config::{AuditConfig, PowerConfig};
pub use experiments::lift::LiftResult;
pub use experiments::power::{implied_duration, PowerPlan, PowerPlanner, Sidedness};
pub use experiments::quality::QualityReport;
pub use experiments::stratified::{
    ExclusionReason, PoolingOptions, PoolingWeights, StratifiedResult, StratumEstimate,
};
