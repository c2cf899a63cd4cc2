use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

use crate::config::Adjustment;
use crate::error::{Error, Result};
use crate::estimate::{EffectEstimate, Estimate, Method};
use crate::ols::regression_effect;
use crate::stratify::Strata;

/// Blocking estimate along with the strata left out of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockingEstimate {
    pub estimate: EffectEstimate,
    /// Per-stratum regression estimates, in stratum order, for used strata.
    pub per_stratum: Vec<(usize, EffectEstimate)>,
    /// Indices of strata skipped for lacking a treated or control unit.
    pub skipped: Vec<usize>,
}

impl fmt::Display for BlockingEstimate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.estimate)?;
        if !self.skipped.is_empty() {
            let ids: Vec<String> = self.skipped.iter().map(|i| (i + 1).to_string()).collect();
            writeln!(f, "Skipped strata (missing an arm): {}", ids.join(", "))?;
        }
        Ok(())
    }
}

// Weighted combination of independent per-stratum estimates.
fn combine(parts: &[(f64, Estimate)], what: &str) -> Result<Estimate> {
    let total: f64 = parts.iter().map(|(w, _)| w).sum();
    if total <= 0.0 {
        return Err(Error::empty_group(format!("blocking {}", what)));
    }
    let value = parts.iter().map(|(w, e)| w / total * e.value).sum();
    let var: f64 = parts
        .iter()
        .map(|(w, e)| (w / total).powi(2) * e.std_err.powi(2))
        .sum();
    Estimate::new(value, var.sqrt(), what)
}

// Estimate treatment effects by blocking
//
// Runs the regression estimator inside every stratum and averages the
// stratum estimates: the ATE by stratum size, the ATT by treated count and
// the ATC by control count. Strata are independent, so variances add with
// squared weights. Strata missing an arm are skipped with a warning; a
// singular regression inside any stratum fails the whole estimate.
pub fn estimate_blocking(strata: &Strata, adjustment: Adjustment) -> Result<BlockingEstimate> {
    let mut per_stratum = Vec::new();
    let mut skipped = Vec::new();
    for (i, stratum) in strata.strata.iter().enumerate() {
        if !stratum.usable() {
            warn!(
                stratum = i + 1,
                treated = stratum.n_treated(),
                control = stratum.n_control(),
                "skipping stratum without both arms"
            );
            skipped.push(i);
            continue;
        }
        let context = format!("stratum {} [{:.3}, {:.3}]", i + 1, stratum.lower, stratum.upper);
        per_stratum.push((i, regression_effect(&stratum.sample, adjustment, &context)?));
    }
    if per_stratum.is_empty() {
        return Err(Error::empty_group("blocking: no stratum has both arms"));
    }

    let weighted = |weight: fn(&EffectEstimate) -> usize, pick: fn(&EffectEstimate) -> Estimate| {
        per_stratum
            .iter()
            .map(|(_, e)| (weight(e) as f64, pick(e)))
            .collect::<Vec<_>>()
    };
    let ate = combine(&weighted(EffectEstimate::n, |e| e.ate), "ATE")?;
    let att = combine(&weighted(|e| e.n_treated, |e| e.att), "ATT")?;
    let atc = combine(&weighted(|e| e.n_control, |e| e.atc), "ATC")?;

    let estimate = EffectEstimate {
        method: Method::Blocking,
        ate,
        att,
        atc,
        n_treated: per_stratum.iter().map(|(_, e)| e.n_treated).sum(),
        n_control: per_stratum.iter().map(|(_, e)| e.n_control).sum(),
    };
    info!(
        ate = estimate.ate.value,
        se = estimate.ate.std_err,
        strata = per_stratum.len(),
        skipped = skipped.len(),
        "blocking estimate"
    );
    Ok(BlockingEstimate { estimate, per_stratum, skipped })
}
