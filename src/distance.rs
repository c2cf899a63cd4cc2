use ndarray::{Array2, Axis};

use crate::config::Metric;
use crate::error::{Error, Result};
use crate::linalg::{covariance, spd_inverse};
use crate::sample::Sample;

/// Units embedded so that the configured metric becomes squared Euclidean
/// distance between rows.
#[derive(Debug, Clone)]
pub(crate) struct Embedding {
    coords: Array2<f64>,
}

impl Embedding {
    // Embed the sample for a metric
    //
    // Mahalanobis: rows are `x' L` where `L L'` is the inverse covariate
    // covariance, so `|u_i - u_j|^2 = (x_i - x_j)' S^-1 (x_i - x_j)`.
    // Inverse variance: each covariate divided by its standard deviation.
    // Propensity: the single propensity score.
    pub(crate) fn new(sample: &Sample, metric: Metric) -> Result<Self> {
        let coords = match metric {
            Metric::Mahalanobis => {
                let x = sample.covariates();
                let inv = spd_inverse(&covariance(&x))
                    .ok_or_else(|| Error::singular("covariate covariance for Mahalanobis matching"))?;
                let l = inv
                    .cholesky()
                    .ok_or_else(|| Error::singular("covariate covariance for Mahalanobis matching"))?
                    .l();
                let k = x.ncols();
                Array2::from_shape_fn((x.nrows(), k), |(i, j)| {
                    (j..k).map(|r| x[[i, r]] * l[(r, j)]).sum()
                })
            }
            Metric::InverseVariance => {
                let mut x = sample.covariates();
                for (j, mut col) in x.axis_iter_mut(Axis(1)).enumerate() {
                    let sd = col.std(1.0);
                    if !(sd > 0.0) {
                        return Err(Error::singular(format!(
                            "inverse-variance weights: covariate `{}` is constant",
                            sample.names()[j]
                        )));
                    }
                    col.mapv_inplace(|v| v / sd);
                }
                x
            }
            Metric::Propensity => {
                let p = sample.require_propensity()?;
                p.clone().insert_axis(Axis(1))
            }
        };
        Ok(Self { coords })
    }

    pub(crate) fn distance(&self, a: usize, b: usize) -> f64 {
        self.coords
            .row(a)
            .iter()
            .zip(self.coords.row(b).iter())
            .map(|(u, v)| (u - v) * (u - v))
            .sum()
    }
}

// Nearest neighbor match
//
// Finds the `m` targets closest to `unit`, never matching a unit to itself.
// Targets tied with the m-th closest are all kept, so more than `m` may come
// back. Ties are listed in position order.
fn find_nn(embedding: &Embedding, unit: usize, targets: &[usize], m: usize) -> Vec<usize> {
    let mut scored: Vec<(f64, usize)> = targets
        .iter()
        .filter(|&&t| t != unit)
        .map(|&t| (embedding.distance(unit, t), t))
        .collect();
    if scored.is_empty() {
        return Vec::new();
    }
    scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    let m = m.min(scored.len());
    let threshold = scored[m - 1].0;
    scored
        .into_iter()
        .take_while(|&(d, _)| d <= threshold)
        .map(|(_, t)| t)
        .collect()
}

// Nearest neighbor matching
//
// For every unit in `main`, find its nearest neighbors in `target`. The
// return value lines up with `main`: entry `i` holds the sample positions
// matched to `main[i]`.
pub(crate) fn nn_match(
    embedding: &Embedding,
    main: &[usize],
    target: &[usize],
    m: usize,
) -> Vec<Vec<usize>> {
    main.iter()
        .map(|&unit| find_nn(embedding, unit, target, m))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Data, Unit};
    use approx::assert_abs_diff_eq;

    fn sample(rows: &[[f64; 2]]) -> Sample {
        let units: Vec<Unit> = rows
            .iter()
            .enumerate()
            .map(|(i, r)| Unit { outcome: 0.0, treated: i % 2 == 0, covariates: r.to_vec() })
            .collect();
        Data::from_units(&units, vec!["a".into(), "b".into()]).unwrap().into_sample()
    }

    #[test]
    fn mahalanobis_matches_quadratic_form() {
        let s = sample(&[[0.0, 1.0], [1.0, 0.5], [2.0, 2.5], [3.0, 1.0], [4.0, 4.0], [0.5, 3.0]]);
        let embedding = Embedding::new(&s, Metric::Mahalanobis).unwrap();
        let inv = spd_inverse(&covariance(&s.covariates())).unwrap();
        let x = s.covariates();
        let dx = nalgebra::DVector::from_vec(vec![x[[0, 0]] - x[[3, 0]], x[[0, 1]] - x[[3, 1]]]);
        let expected = (dx.transpose() * &inv * &dx)[(0, 0)];
        assert_abs_diff_eq!(embedding.distance(0, 3), expected, epsilon = 1e-10);
    }

    #[test]
    fn keeps_ties_and_skips_self() {
        let s = sample(&[[0.0, 0.0], [1.0, 0.0], [-1.0, 0.0], [3.0, 0.0], [0.0, 1.0]]);
        let embedding = Embedding::new(&s, Metric::InverseVariance).unwrap();
        let matched = find_nn(&embedding, 0, &[0, 1, 2, 3], 1);
        assert_eq!(matched, vec![1, 2]);
        let matched = find_nn(&embedding, 0, &[0, 3], 2);
        assert_eq!(matched, vec![3]);
    }

    #[test]
    fn constant_covariate_rejects_inverse_variance() {
        let s = sample(&[[0.0, 1.0], [1.0, 1.0], [2.0, 1.0]]);
        assert!(matches!(
            Embedding::new(&s, Metric::InverseVariance),
            Err(Error::SingularMatrix { .. })
        ));
        assert!(matches!(
            Embedding::new(&s, Metric::Mahalanobis),
            Err(Error::SingularMatrix { .. })
        ));
    }
}
