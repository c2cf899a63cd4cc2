use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::fmt;
use tracing::{info, warn};

use crate::balance::{assess_balance, BalanceReport};
use crate::blocking::{estimate_blocking, BlockingEstimate};
use crate::config::{PipelineConfig, TrimConfig};
use crate::error::{Error, Result};
use crate::estimate::{EffectEstimate, Method};
use crate::matching::{estimate_matching, MatchingEstimate};
use crate::ols::estimate_ols;
use crate::propensity::{select_propensity, PropensityModel};
use crate::sample::Sample;
use crate::stratify::{stratify_auto, stratify_fixed, Strata};
use crate::trim::{trim_auto, trim_fixed, TrimSummary};
use crate::weighting::estimate_weighting;

/// What one estimator produced.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(untagged)]
pub enum EstimatorOutput {
    Effect(EffectEstimate),
    Blocking(BlockingEstimate),
    Matching(MatchingEstimate),
}

impl EstimatorOutput {
    pub fn effect(&self) -> &EffectEstimate {
        match self {
            EstimatorOutput::Effect(e) => e,
            EstimatorOutput::Blocking(b) => &b.estimate,
            EstimatorOutput::Matching(m) => &m.estimate,
        }
    }
}

impl fmt::Display for EstimatorOutput {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EstimatorOutput::Effect(e) => write!(f, "{}", e),
            EstimatorOutput::Blocking(b) => write!(f, "{}", b),
            EstimatorOutput::Matching(m) => write!(f, "{}", m),
        }
    }
}

#[derive(Debug)]
pub struct MethodResult {
    pub method: Method,
    pub output: Result<EstimatorOutput>,
}

// Serializes as `{"method", "estimate"}` or, for a failed estimator,
// `{"method", "error"}` with the error message.
impl Serialize for MethodResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("MethodResult", 2)?;
        state.serialize_field("method", &self.method)?;
        match &self.output {
            Ok(output) => state.serialize_field("estimate", output)?,
            Err(e) => state.serialize_field("error", &e.to_string())?,
        }
        state.end()
    }
}

/// Everything the pipeline computed, stage by stage.
#[derive(Debug)]
pub struct PipelineReport {
    pub balance_before: BalanceReport,
    pub propensity: PropensityModel,
    /// `None` when trimming is switched off.
    pub trim: Option<TrimSummary>,
    pub balance_after: BalanceReport,
    pub strata: Strata,
    pub estimates: Vec<MethodResult>,
}

impl PipelineReport {
    /// The trimmed, scored and stratified sample the estimators ran on.
    pub fn sample(&self) -> &Sample {
        &self.strata.sample
    }

    pub fn estimate(&self, method: Method) -> Option<&EffectEstimate> {
        self.estimates
            .iter()
            .find(|r| r.method == method)
            .and_then(|r| r.output.as_ref().ok())
            .map(EstimatorOutput::effect)
    }
}

impl fmt::Display for PipelineReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Before trimming")?;
        writeln!(f, "{}", self.balance_before)?;
        writeln!(f, "{}", self.propensity)?;
        if let Some(trim) = &self.trim {
            writeln!(
                f,
                "TRIM ========================================= Cutoff: {:.4}\n\
                 Retained: {} ({} treated, {} control) | Dropped: {}\n",
                trim.cutoff, trim.retained, trim.retained_treated, trim.retained_control, trim.dropped
            )?;
            writeln!(f, "After trimming")?;
            writeln!(f, "{}", self.balance_after)?;
        }
        writeln!(f, "{}", self.strata)?;
        for result in &self.estimates {
            match &result.output {
                Ok(output) => writeln!(f, "{}", output)?,
                Err(e) => writeln!(f, "{} ======================================= failed: {}\n", result.method, e)?,
            }
        }
        Ok(())
    }
}

fn run_method(method: Method, sample: &Sample, strata: &Strata, cfg: &PipelineConfig) -> Result<EstimatorOutput> {
    let estimators = &cfg.estimators;
    Ok(match method {
        Method::Ols => EstimatorOutput::Effect(estimate_ols(sample, estimators.adjustment)?),
        Method::Blocking => EstimatorOutput::Blocking(estimate_blocking(strata, estimators.blocking_adjustment)?),
        Method::Matching => EstimatorOutput::Matching(estimate_matching(sample, &estimators.matching)?),
        Method::Weighting => EstimatorOutput::Effect(estimate_weighting(sample)?),
    })
}

// Run the full pipeline
//
// Balance, propensity selection, trimming, balance again, stratification and
// then every configured estimator on the trimmed sample. A failure in any of
// the preparatory stages ends the run. Estimators fail independently: each
// error is kept in the report next to the method that raised it.
pub fn run(sample: &Sample, cfg: &PipelineConfig) -> Result<PipelineReport> {
    info!(units = sample.len(), covariates = sample.n_covariates(), "pipeline started");
    let balance_before = assess_balance(sample)?;
    let propensity = select_propensity(sample, &cfg.propensity)?;
    let scored = propensity.apply(sample)?;

    let (trimmed, trim) = match cfg.trim {
        TrimConfig::Off => (scored, None),
        TrimConfig::Fixed { cutoff } => {
            let t = trim_fixed(&scored, cutoff)?;
            let summary = t.summary();
            (t.sample, Some(summary))
        }
        TrimConfig::Auto { min_retention } => {
            let t = trim_auto(&scored, min_retention)?;
            let summary = t.summary();
            (t.sample, Some(summary))
        }
    };
    let balance_after = assess_balance(&trimmed)?;

    let strata = match &cfg.stratify.boundaries {
        Some(boundaries) => stratify_fixed(&trimmed, boundaries)?,
        None => stratify_auto(&trimmed, &cfg.stratify)?,
    };

    if cfg.estimators.methods.is_empty() {
        return Err(Error::InvalidConfig("no estimators configured".to_string()));
    }
    let estimates = cfg
        .estimators
        .methods
        .iter()
        .map(|&method| {
            let output = run_method(method, &strata.sample, &strata, cfg);
            if let Err(e) = &output {
                warn!(%method, error = %e, "estimator failed");
            }
            MethodResult { method, output }
        })
        .collect();

    Ok(PipelineReport { balance_before, propensity, trim, balance_after, strata, estimates })
}
