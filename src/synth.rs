// Seeded synthetic samples for unit tests.

use ndarray::{Array1, Array2};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

use crate::sample::{Data, Sample};

// `k` standard normal covariates, treatment drawn from a logit in the first
// two covariates, and `Y = 1 + 2 x0 - x1 + gamma D + e`.
pub(crate) fn confounded(n: usize, k: usize, gamma: f64, seed: u64) -> Sample {
    confounded_with_intercept(n, k, gamma, seed, 0.0)
}

// As `confounded`, with `intercept` added to the treatment logit. An
// intercept of -1 leaves roughly 30% of units treated.
pub(crate) fn confounded_with_intercept(n: usize, k: usize, gamma: f64, seed: u64, intercept: f64) -> Sample {
    assert!(k >= 2);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut x = Array2::zeros((n, k));
    let mut y = Array1::zeros(n);
    let mut d = Vec::with_capacity(n);
    for i in 0..n {
        for j in 0..k {
            x[[i, j]] = rng.sample::<f64, _>(StandardNormal);
        }
        let logit = intercept + 0.8 * x[[i, 0]] - 0.5 * x[[i, 1]];
        let treated = rng.gen::<f64>() < 1.0 / (1.0 + (-logit).exp());
        let noise: f64 = rng.sample(StandardNormal);
        y[i] = 1.0 + 2.0 * x[[i, 0]] - x[[i, 1]] + if treated { gamma } else { 0.0 } + noise;
        d.push(treated);
    }
    let names = (0..k).map(|j| format!("x{}", j)).collect();
    Data::new(y, d, x, names).unwrap().into_sample()
}
