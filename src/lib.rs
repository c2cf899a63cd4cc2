//! Treatment-effect estimation for observational data.
//!
//! A [`Sample`] of units (outcome, binary treatment, covariates) goes through
//! covariate balance assessment, stepwise logistic propensity selection,
//! propensity trimming, propensity stratification and finally one or more
//! effect estimators (regression, blocking, nearest neighbor matching, inverse
//! propensity weighting). [`pipeline::run`] chains all of it.

pub mod balance;
pub mod blocking;
pub mod config;
mod distance;
pub mod error;
pub mod estimate;
mod linalg;
pub mod matching;
pub mod ols;
pub mod pipeline;
pub mod propensity;
pub mod sample;
pub mod stratify;
pub mod trim;
pub mod weighting;

#[cfg(test)]
mod synth;

pub use balance::{assess_balance, BalanceReport, NormalizedDiff};
pub use blocking::{estimate_blocking, BlockingEstimate};
pub use config::{
    Adjustment, EstimatorConfig, MatchingConfig, Metric, PipelineConfig, PropensityConfig,
    StratifyConfig, TrimConfig,
};
pub use error::{Error, Result};
pub use estimate::{EffectEstimate, Estimate, Method};
pub use matching::{estimate_matching, MatchingEstimate};
pub use ols::estimate_ols;
pub use pipeline::{run, PipelineReport};
pub use propensity::{estimate_propensity, select_propensity, PropensityModel, Term};
pub use sample::{import_data, Data, Sample, Unit};
pub use stratify::{stratify_auto, stratify_fixed, stratify_quantiles, Strata};
pub use trim::{trim_auto, trim_fixed, Trimmed};
pub use weighting::estimate_weighting;
