use nalgebra::{DMatrix, DVector};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

use crate::config::MatchingConfig;
use crate::distance::{nn_match, Embedding};
use crate::error::{Error, Result};
use crate::estimate::{EffectEstimate, Estimate, Method};
use crate::linalg::lstsq;
use crate::sample::Sample;

/// Matching estimate along with how many distinct units served as matches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchingEstimate {
    pub estimate: EffectEstimate,
    pub distinct_controls_used: usize,
    pub distinct_treated_used: usize,
}

impl fmt::Display for MatchingEstimate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.estimate)?;
        writeln!(
            f,
            "Distinct matches used: {} control | {} treated",
            self.distinct_controls_used, self.distinct_treated_used
        )
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    sum / count as f64
}

// Count how often each unit is used as a match
//
// Matching is done with replacement and ties are kept, so a unit matched
// inside a set of `J` ties earns `1 / J` credit for that match. The result is
// indexed by sample position.
fn scaled_counts(n: usize, matches: &[Vec<usize>]) -> Vec<f64> {
    let mut counts = vec![0.0; n];
    for set in matches {
        let credit = 1.0 / set.len() as f64;
        for &j in set {
            counts[j] += credit;
        }
    }
    counts
}

// Observation-level conditional variance
//
// Each unit is matched to its nearest neighbor within its own arm, itself
// excluded. With `J` neighbors tied at that distance, the outcome variance
// at the unit's covariates is estimated by `J / (J + 1) * (Y_i - mean Y_j)^2`,
// which for a single neighbor is the variance of the pair.
fn conditional_variance(
    sample: &Sample,
    embedding: &Embedding,
    arm: &[usize],
    out: &mut [f64],
) {
    for (&i, neighbors) in arm.iter().zip(nn_match(embedding, arm, arm, 1)) {
        let j = neighbors.len() as f64;
        let matched = mean(neighbors.iter().map(|&k| sample.outcome(k)));
        out[i] = j / (j + 1.0) * (sample.outcome(i) - matched).powi(2);
    }
}

// Bias correction
//
// Regresses the outcome on the covariates over every match used (a unit
// matched twice enters twice) and returns, for each matched unit, the
// predicted outcome gap between its matches and itself:
// `(mean X_matches - X_i)' beta`.
fn bias(sample: &Sample, units: &[usize], matches: &[Vec<usize>], context: &str) -> Result<Vec<f64>> {
    let k = sample.n_covariates();
    let used: Vec<usize> = matches.iter().flatten().copied().collect();
    let z = DMatrix::from_fn(used.len(), k + 1, |r, c| {
        if c == 0 { 1.0 } else { sample.covariate_row(used[r])[c - 1] }
    });
    let y = DVector::from_iterator(used.len(), used.iter().map(|&j| sample.outcome(j)));
    let beta = lstsq(&z, &y, context)?;
    Ok(units
        .iter()
        .zip(matches)
        .map(|(&i, set)| {
            let own = sample.covariate_row(i);
            (0..k)
                .map(|c| {
                    let matched = mean(set.iter().map(|&j| sample.covariate_row(j)[c]));
                    (matched - own[c]) * beta[c + 1]
                })
                .sum()
        })
        .collect())
}

// Estimate treatment effects by nearest neighbor matching
//
// Every treated unit is matched with replacement to its `m` nearest controls
// and every control to its `m` nearest treated units, keeping all units tied
// at the m-th distance. The missing potential outcome is imputed by the mean
// matched outcome, optionally bias corrected. The ATT averages over treated
// units, the ATC over controls, and the ATE weights the two by arm shares.
//
// Variances follow Abadie and Imbens (2006): conditional outcome variances
// estimated by same-arm matching, weighted by how often each unit stands in
// for the opposite arm.
pub fn estimate_matching(sample: &Sample, cfg: &MatchingConfig) -> Result<MatchingEstimate> {
    sample.require_both_arms("matching")?;
    let treated = sample.treated_positions();
    let control = sample.control_positions();
    let (n_t, n_c) = (treated.len() as f64, control.len() as f64);
    let n = n_t + n_c;
    if cfg.matches == 0 || cfg.matches > treated.len().min(control.len()) {
        return Err(Error::InvalidConfig(format!(
            "{} matches requested with {} treated and {} control units",
            cfg.matches,
            treated.len(),
            control.len()
        )));
    }
    if treated.len() < 2 || control.len() < 2 {
        return Err(Error::empty_group(
            "matching variance: each arm needs two units for same-arm matching",
        ));
    }

    let embedding = Embedding::new(sample, cfg.metric)?;
    let matches_t = nn_match(&embedding, &treated, &control, cfg.matches);
    let matches_c = nn_match(&embedding, &control, &treated, cfg.matches);
    debug!(metric = ?cfg.metric, m = cfg.matches, "matched both arms");

    let mut itt_t: Vec<f64> = treated
        .iter()
        .zip(&matches_t)
        .map(|(&i, set)| sample.outcome(i) - mean(set.iter().map(|&j| sample.outcome(j))))
        .collect();
    let mut itt_c: Vec<f64> = control
        .iter()
        .zip(&matches_c)
        .map(|(&i, set)| mean(set.iter().map(|&j| sample.outcome(j))) - sample.outcome(i))
        .collect();

    if cfg.bias_adjust {
        let bias_t = bias(sample, &treated, &matches_t, "matching bias correction (controls)")?;
        let bias_c = bias(sample, &control, &matches_c, "matching bias correction (treated)")?;
        itt_t.iter_mut().zip(bias_t).for_each(|(v, b)| *v += b);
        itt_c.iter_mut().zip(bias_c).for_each(|(v, b)| *v -= b);
    }

    let att = mean(itt_t.iter().copied());
    let atc = mean(itt_c.iter().copied());
    let ate = n_c / n * atc + n_t / n * att;

    let counts_c = scaled_counts(sample.len(), &matches_t);
    let counts_t = scaled_counts(sample.len(), &matches_c);
    let mut sigma = vec![0.0; sample.len()];
    conditional_variance(sample, &embedding, &treated, &mut sigma);
    conditional_variance(sample, &embedding, &control, &mut sigma);

    // sum over both arms of w_i^2 sigma_i^2 / N_arm^2
    let variance = |w_t: &dyn Fn(usize) -> f64, w_c: &dyn Fn(usize) -> f64| -> f64 {
        let arm = |units: &[usize], w: &dyn Fn(usize) -> f64, size: f64| {
            units.iter().map(|&i| w(i).powi(2) * sigma[i]).sum::<f64>() / (size * size)
        };
        arm(&treated, w_t, n_t) + arm(&control, w_c, n_c)
    };
    let var_att = variance(&|_| 1.0, &|i| n_c / n_t * counts_c[i]);
    let var_atc = variance(&|i| n_t / n_c * counts_t[i], &|_| 1.0);
    let var_ate = variance(&|i| n_t / n * (1.0 + counts_t[i]), &|i| n_c / n * (1.0 + counts_c[i]));

    let estimate = EffectEstimate {
        method: Method::Matching,
        ate: Estimate::new(ate, var_ate.sqrt(), "matching ATE")?,
        att: Estimate::new(att, var_att.sqrt(), "matching ATT")?,
        atc: Estimate::new(atc, var_atc.sqrt(), "matching ATC")?,
        n_treated: treated.len(),
        n_control: control.len(),
    };
    let distinct = |sets: &[Vec<usize>]| sets.iter().flatten().collect::<BTreeSet<_>>().len();
    let result = MatchingEstimate {
        estimate,
        distinct_controls_used: distinct(&matches_t),
        distinct_treated_used: distinct(&matches_c),
    };
    info!(
        ate = result.estimate.ate.value,
        se = result.estimate.ate.std_err,
        controls_used = result.distinct_controls_used,
        treated_used = result.distinct_treated_used,
        "matching estimate"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Metric;
    use crate::sample::{Data, Unit};
    use crate::synth::confounded;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;

    // Treated and control units in pairs with identical covariates.
    fn duplicated_pairs() -> (Sample, f64) {
        let mut units = Vec::new();
        let mut total = 0.0;
        for i in 0..12 {
            let x = vec![i as f64 * 0.7, ((i * 5) % 11) as f64];
            let y_c = 1.0 + x[0] - 0.3 * x[1] + ((i * 3) % 4) as f64;
            let y_t = y_c + 2.0 + (i % 3) as f64;
            total += y_t - y_c;
            units.push(Unit { outcome: y_t, treated: true, covariates: x.clone() });
            units.push(Unit { outcome: y_c, treated: false, covariates: x });
        }
        let sample = Data::from_units(&units, vec!["a".into(), "b".into()]).unwrap().into_sample();
        (sample, total / 12.0)
    }

    #[test]
    fn exact_duplicates_give_mean_pair_difference() {
        let (sample, expected) = duplicated_pairs();
        for bias_adjust in [false, true] {
            let cfg = MatchingConfig { bias_adjust, ..MatchingConfig::default() };
            let est = estimate_matching(&sample, &cfg).unwrap().estimate;
            assert_abs_diff_eq!(est.ate.value, expected, epsilon = 1e-12);
            assert_abs_diff_eq!(est.att.value, expected, epsilon = 1e-12);
            assert_abs_diff_eq!(est.atc.value, expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn ties_at_the_mth_distance_are_averaged() {
        // The treated unit at 0 has controls at -1 and +1.
        let rows = [(0.0, true, 10.0), (-1.0, false, 1.0), (1.0, false, 3.0), (5.0, true, 7.0), (6.0, false, 4.0)];
        let units: Vec<Unit> = rows
            .iter()
            .map(|&(x, treated, y)| Unit { outcome: y, treated, covariates: vec![x] })
            .collect();
        let sample = Data::from_units(&units, vec!["x".into()]).unwrap().into_sample();
        let cfg = MatchingConfig { bias_adjust: false, ..MatchingConfig::default() };
        let result = estimate_matching(&sample, &cfg).unwrap();
        // (10 - 2) and (7 - 4)
        assert_abs_diff_eq!(result.estimate.att.value, 5.5, epsilon = 1e-12);
        assert_eq!(result.distinct_controls_used, 3);
    }

    #[test]
    fn propensity_metric_requires_scores() {
        let sample = confounded(40, 2, 1.0, 3);
        let cfg = MatchingConfig { metric: Metric::Propensity, ..MatchingConfig::default() };
        assert!(matches!(estimate_matching(&sample, &cfg), Err(Error::MissingPropensity)));

        let scores = Array1::from_shape_fn(sample.len(), |i| 0.2 + 0.6 * i as f64 / sample.len() as f64);
        let scored = sample.with_propensity(scores).unwrap();
        assert!(estimate_matching(&scored, &cfg).is_ok());
    }

    #[test]
    fn collinear_covariates_break_mahalanobis() {
        let units: Vec<Unit> = (0..10)
            .map(|i| Unit {
                outcome: i as f64,
                treated: i % 2 == 0,
                covariates: vec![i as f64, 3.0 * i as f64 + 1.0],
            })
            .collect();
        let sample = Data::from_units(&units, vec!["a".into(), "b".into()]).unwrap().into_sample();
        assert!(matches!(
            estimate_matching(&sample, &MatchingConfig::default()),
            Err(Error::SingularMatrix { .. })
        ));
    }

    #[test]
    fn recovers_gamma_on_confounded_data() {
        let sample = confounded(800, 2, 2.0, 11);
        let est = estimate_matching(&sample, &MatchingConfig::default()).unwrap().estimate;
        assert!((est.ate.value - 2.0).abs() < 4.0 * est.ate.std_err.max(0.05));
        assert!(est.ate.std_err > 0.0);
        assert_eq!(est.n(), 800);
    }

    #[test]
    fn too_many_matches_rejected() {
        let sample = crate::sample::tests::toy_sample();
        let cfg = MatchingConfig { matches: 3, ..MatchingConfig::default() };
        assert!(matches!(estimate_matching(&sample, &cfg), Err(Error::InvalidConfig(_))));
    }
}
