use nalgebra::{DMatrix, DVector};
use tracing::info;

use crate::error::Result;
use crate::estimate::{EffectEstimate, Estimate, Method};
use crate::linalg::ols;
use crate::sample::Sample;

// Estimate treatment effects by inverse propensity weighting
//
// Weighted least squares of `Y` on `(1, D, X)` with weight `1 / p` for
// treated units and `1 / (1 - p)` for controls, solved as OLS on rows scaled
// by the square root of the weight. The coefficient on D is reported as the
// ATE, ATT and ATC alike; its standard error is the robust one of the
// weighted regression.
pub fn estimate_weighting(sample: &Sample) -> Result<EffectEstimate> {
    sample.require_both_arms("weighting")?;
    let p = sample.require_propensity()?;
    let x = sample.covariates();
    let k = x.ncols();
    let root_w: Vec<f64> = (0..sample.len())
        .map(|i| {
            let w = if sample.is_treated(i) { 1.0 / p[i] } else { 1.0 / (1.0 - p[i]) };
            w.sqrt()
        })
        .collect();

    let z = DMatrix::from_fn(sample.len(), k + 2, |i, j| {
        let v = match j {
            0 => 1.0,
            1 => f64::from(u8::from(sample.is_treated(i))),
            j => x[[i, j - 2]],
        };
        v * root_w[i]
    });
    let y = DVector::from_iterator(sample.len(), (0..sample.len()).map(|i| sample.outcome(i) * root_w[i]));
    let fit = ols(&z, &y, "weighted regression")?;
    let effect = Estimate::new(fit.coef[1], fit.cov[(1, 1)].sqrt(), "weighting ATE")?;
    info!(ate = effect.value, se = effect.std_err, "weighting estimate");
    Ok(EffectEstimate {
        method: Method::Weighting,
        ate: effect,
        att: effect,
        atc: effect,
        n_treated: sample.n_treated(),
        n_control: sample.n_control(),
    })
}
