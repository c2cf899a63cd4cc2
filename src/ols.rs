use nalgebra::{DMatrix, DVector};
use ndarray::Axis;
use tracing::info;

use crate::config::Adjustment;
use crate::error::Result;
use crate::estimate::{EffectEstimate, Estimate, Method};
use crate::linalg::{ols, to_dvector};
use crate::sample::Sample;

// Regression estimate of the treatment effect within one sample; `context`
// names the sample in errors (the whole sample, or a stratum).
pub(crate) fn regression_effect(
    sample: &Sample,
    adjustment: Adjustment,
    context: &str,
) -> Result<EffectEstimate> {
    sample.require_both_arms(context)?;
    let n = sample.len();
    let k = sample.n_covariates();
    let x = sample.covariates();
    let treatment = sample.treatment();
    let x_mean = x.mean_axis(Axis(0)).unwrap_or_else(|| ndarray::Array1::zeros(k));

    let width = match adjustment {
        Adjustment::None => 2,
        Adjustment::Linear => 2 + k,
        Adjustment::Interacted => 2 + 2 * k,
    };
    let z = DMatrix::from_fn(n, width, |i, j| {
        let d = if treatment[i] { 1.0 } else { 0.0 };
        match j {
            0 => 1.0,
            1 => d,
            j if j < 2 + k => x[[i, j - 2]],
            j => d * (x[[i, j - 2 - k]] - x_mean[j - 2 - k]),
        }
    });
    let y: DVector<f64> = to_dvector(&sample.outcomes());
    let fit = ols(&z, &y, context)?;

    let ate = Estimate::new(fit.coef[1], fit.cov[(1, 1)].sqrt(), "ATE")?;
    let (att, atc) = if adjustment == Adjustment::Interacted {
        // Effect at each group's covariate means: a' b with a = e_D plus the
        // group's mean deviation on the interaction block.
        let group_effect = |treated: bool, what: &str| {
            let rows: Vec<usize> = (0..n).filter(|&i| treatment[i] == treated).collect();
            let group_mean = x.select(Axis(0), &rows).mean_axis(Axis(0)).unwrap_or_else(|| x_mean.clone());
            let mut a = DVector::zeros(width);
            a[1] = 1.0;
            for j in 0..k {
                a[2 + k + j] = group_mean[j] - x_mean[j];
            }
            let value = a.dot(&fit.coef);
            let var = (a.transpose() * &fit.cov * &a)[(0, 0)];
            Estimate::new(value, var.max(0.0).sqrt(), what)
        };
        (group_effect(true, "ATT")?, group_effect(false, "ATC")?)
    } else {
        (ate, ate)
    };
    Ok(EffectEstimate {
        method: Method::Ols,
        ate,
        att,
        atc,
        n_treated: sample.n_treated(),
        n_control: sample.n_control(),
    })
}

// Estimate treatment effects by least squares
//
// Fits `Y ~ D`, `Y ~ D + X`, or `Y ~ D + X + D(X - mean X)` depending on
// `adjustment`. The ATE is the coefficient on D; with interactions, ATT and
// ATC evaluate the effect at the treated and control covariate means.
// Standard errors come from the heteroskedasticity-robust covariance. A
// singular design is reported, never worked around.
pub fn estimate_ols(sample: &Sample, adjustment: Adjustment) -> Result<EffectEstimate> {
    let estimate = regression_effect(sample, adjustment, "OLS design")?;
    info!(ate = estimate.ate.value, se = estimate.ate.std_err, ?adjustment, "OLS estimate");
    Ok(estimate)
}
