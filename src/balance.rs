use serde::Serialize;
use std::fmt;

use crate::error::Result;
use crate::sample::Sample;

/// Normalized difference of one variable between arms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum NormalizedDiff {
    Defined(f64),
    /// Both arms have zero variance but different means.
    Undefined,
}

impl NormalizedDiff {
    pub fn value(&self) -> Option<f64> {
        match self {
            NormalizedDiff::Defined(v) => Some(*v),
            NormalizedDiff::Undefined => None,
        }
    }
}

impl fmt::Display for NormalizedDiff {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NormalizedDiff::Defined(v) => write!(f, "{:.3}", v),
            NormalizedDiff::Undefined => f.write_str("undef"),
        }
    }
}

/// Group summaries and differences for one variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableBalance {
    pub name: String,
    pub mean_treated: f64,
    pub mean_control: f64,
    pub sd_treated: f64,
    pub sd_control: f64,
    pub raw_diff: f64,
    pub normalized_diff: NormalizedDiff,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceReport {
    pub n_treated: usize,
    pub n_control: usize,
    pub outcome: VariableBalance,
    pub covariates: Vec<VariableBalance>,
}

// Mean and sample variance (ddof = 1). A single observation has variance 0.
fn moments(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let values: Vec<f64> = values.collect();
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    if values.len() < 2 {
        return (mean, 0.0);
    }
    let ss: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (mean, ss / (n - 1.0))
}

fn variable_balance(
    name: &str,
    treated: impl Iterator<Item = f64>,
    control: impl Iterator<Item = f64>,
) -> VariableBalance {
    let (mean_t, var_t) = moments(treated);
    let (mean_c, var_c) = moments(control);
    let raw_diff = mean_t - mean_c;
    let pooled = ((var_t + var_c) / 2.0).sqrt();
    let normalized_diff = if pooled > 0.0 {
        NormalizedDiff::Defined(raw_diff / pooled)
    } else if raw_diff == 0.0 {
        NormalizedDiff::Defined(0.0)
    } else {
        NormalizedDiff::Undefined
    };
    VariableBalance {
        name: name.to_string(),
        mean_treated: mean_t,
        mean_control: mean_c,
        sd_treated: var_t.sqrt(),
        sd_control: var_c.sqrt(),
        raw_diff,
        normalized_diff,
    }
}

// Assess covariate balance
//
// For the outcome and each covariate, compute group means, sample standard
// deviations, the raw difference (treated minus control) and the normalized
// difference (raw difference over the root mean of the two group variances).
// Requires at least one unit in each arm.
pub fn assess_balance(sample: &Sample) -> Result<BalanceReport> {
    sample.require_both_arms("balance assessment")?;
    let treated = sample.treated_positions();
    let control = sample.control_positions();
    let outcome = variable_balance(
        "outcome",
        treated.iter().map(|&p| sample.outcome(p)),
        control.iter().map(|&p| sample.outcome(p)),
    );
    let covariates = sample
        .names()
        .iter()
        .enumerate()
        .map(|(j, name)| {
            variable_balance(
                name,
                treated.iter().map(|&p| sample.covariate_row(p)[j]),
                control.iter().map(|&p| sample.covariate_row(p)[j]),
            )
        })
        .collect();
    Ok(BalanceReport {
        n_treated: treated.len(),
        n_control: control.len(),
        outcome,
        covariates,
    })
}

impl fmt::Display for BalanceReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "BALANCE ====================================== # Treat: {} | # Control: {}",
            self.n_treated, self.n_control
        )?;
        writeln!(
            f,
            "Outcome raw diff: {:.3} (treated {:.3}, control {:.3})",
            self.outcome.raw_diff, self.outcome.mean_treated, self.outcome.mean_control
        )?;
        writeln!(
            f,
            "{:<14} {:>12} {:>12} {:>12} {:>12} {:>9}",
            "Covariate", "Mean T", "S.d. T", "Mean C", "S.d. C", "Nor-diff"
        )?;
        for v in &self.covariates {
            writeln!(
                f,
                "{:<14} {:>12.3} {:>12.3} {:>12.3} {:>12.3} {:>9}",
                v.name,
                v.mean_treated,
                v.sd_treated,
                v.mean_control,
                v.sd_control,
                v.normalized_diff.to_string()
            )?;
        }
        Ok(())
    }
}
