//! Dense least-squares helpers shared by the estimators.

use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2};

use crate::error::{Error, Result};

/// Pivots smaller than this fraction of the matching Gram diagonal are
/// treated as rank deficiency.
const RANK_TOLERANCE: f64 = 1e-10;

pub(crate) fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), a.ncols(), |i, j| a[[i, j]])
}

pub(crate) fn to_dvector(a: &Array1<f64>) -> DVector<f64> {
    DVector::from_iterator(a.len(), a.iter().copied())
}

// Inverse of a symmetric positive definite matrix, or `None` when a Cholesky
// pivot collapses relative to its diagonal.
pub(crate) fn spd_inverse(m: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let chol = m.clone().cholesky()?;
    let l = chol.l_dirty();
    for j in 0..m.nrows() {
        let pivot = l[(j, j)] * l[(j, j)];
        if !pivot.is_finite() || pivot <= RANK_TOLERANCE * m[(j, j)].abs().max(f64::MIN_POSITIVE) {
            return None;
        }
    }
    Some(chol.inverse())
}

pub(crate) fn has_full_column_rank(z: &DMatrix<f64>) -> bool {
    spd_inverse(&(z.transpose() * z)).is_some()
}

/// Least-squares fit with heteroskedasticity-robust (HC0) covariance.
#[derive(Debug, Clone)]
pub(crate) struct OlsFit {
    pub coef: DVector<f64>,
    pub cov: DMatrix<f64>,
}

// Least squares with sandwich covariance
//
// Solves `Z'Z b = Z'y` and returns `b` along with
// `(Z'Z)^-1 Z' diag(u^2) Z (Z'Z)^-1`. A design whose Gram matrix is not
// invertible is an error naming `context`; nothing is regularized away.
pub(crate) fn ols(z: &DMatrix<f64>, y: &DVector<f64>, context: &str) -> Result<OlsFit> {
    if z.nrows() < z.ncols() {
        return Err(Error::singular(format!(
            "{} ({} rows for {} columns)",
            context,
            z.nrows(),
            z.ncols()
        )));
    }
    let gram_inv = spd_inverse(&(z.transpose() * z)).ok_or_else(|| Error::singular(context))?;
    let coef = &gram_inv * (z.transpose() * y);
    let resid = y - z * &coef;
    let mut meat = DMatrix::zeros(z.ncols(), z.ncols());
    for (i, row) in z.row_iter().enumerate() {
        let scaled = row.transpose() * resid[i];
        meat += &scaled * scaled.transpose();
    }
    let cov = &gram_inv * meat * &gram_inv;
    Ok(OlsFit { coef, cov })
}

// Minimum-norm least squares through the SVD. Used where a rank-deficient
// regression still has a meaningful fitted surface.
pub(crate) fn lstsq(z: &DMatrix<f64>, y: &DVector<f64>, context: &str) -> Result<DVector<f64>> {
    z.clone()
        .svd(true, true)
        .solve(y, 1e-12)
        .map_err(|e| Error::singular(format!("{}: {}", context, e)))
}

pub(crate) fn covariance(x: &Array2<f64>) -> DMatrix<f64> {
    let n = x.nrows();
    let k = x.ncols();
    let mean = x.mean_axis(ndarray::Axis(0)).unwrap_or_else(|| Array1::zeros(k));
    let mut cov = DMatrix::zeros(k, k);
    for row in x.rows() {
        let d = DVector::from_iterator(k, row.iter().zip(mean.iter()).map(|(v, m)| v - m));
        cov += &d * d.transpose();
    }
    cov / (n.saturating_sub(1).max(1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn ols_exact_fit() {
        let z = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let y = DVector::from_vec(vec![1.0, 3.0, 5.0, 7.0]);
        let fit = ols(&z, &y, "test").unwrap();
        assert_abs_diff_eq!(fit.coef[0], 1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.coef[1], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(fit.cov[(1, 1)], 0.0, epsilon = 1e-10);
    }

    #[test]
    fn collinear_design_is_singular() {
        let z = DMatrix::from_row_slice(3, 3, &[1.0, 1.0, 2.0, 1.0, 2.0, 4.0, 1.0, 3.0, 6.0]);
        let y = DVector::from_vec(vec![1.0, 2.0, 3.0]);
        assert!(matches!(ols(&z, &y, "collinear"), Err(Error::SingularMatrix { .. })));
        assert!(!has_full_column_rank(&z));
    }

    #[test]
    fn lstsq_tolerates_rank_deficiency() {
        let z = DMatrix::from_row_slice(3, 2, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
        let y = DVector::from_vec(vec![2.0, 2.0, 2.0]);
        let b = lstsq(&z, &y, "test").unwrap();
        assert_abs_diff_eq!(b[0] + b[1], 2.0, epsilon = 1e-10);
    }
}
