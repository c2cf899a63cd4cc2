use linfa::dataset::Dataset;
use linfa::traits::{Fit, Transformer};
use linfa_logistic::LogisticRegression;
use linfa_preprocessing::linear_scaling::LinearScaler;
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

use crate::config::PropensityConfig;
use crate::error::{Error, Result};
use crate::linalg::{has_full_column_rank, lstsq, spd_inverse, to_dmatrix};
use crate::sample::Sample;

/// One column of the propensity design.
///
/// Terms order linear before quadratic, then by covariate index. That order
/// is the tie-break during stepwise selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Term {
    Linear(usize),
    /// Product of two covariates; a square when both indices agree.
    Quadratic(usize, usize),
}

impl Term {
    pub fn label(&self, names: &[String]) -> String {
        match *self {
            Term::Linear(i) => names[i].clone(),
            Term::Quadratic(i, j) if i == j => format!("{}^2", names[i]),
            Term::Quadratic(i, j) => format!("{}*{}", names[i], names[j]),
        }
    }

    fn eval(&self, row: ArrayView1<f64>) -> f64 {
        match *self {
            Term::Linear(i) => row[i],
            Term::Quadratic(i, j) => row[i] * row[j],
        }
    }
}

fn design(x: &Array2<f64>, terms: &[Term]) -> Array2<f64> {
    Array2::from_shape_fn((x.nrows(), terms.len()), |(r, c)| terms[c].eval(x.row(r)))
}

// Center and scale each column. `None` when a column is constant.
fn standardized(z: &Array2<f64>) -> Option<Array2<f64>> {
    let mut z = z.clone();
    for mut col in z.columns_mut() {
        let mean = col.mean()?;
        let sd = col.std(0.0);
        if !(sd > 0.0) {
            return None;
        }
        col.mapv_inplace(|v| (v - mean) / sd);
    }
    Some(z)
}

/// Which way a term moved during stepwise selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepAction {
    Entered,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionStep {
    pub term: Term,
    pub label: String,
    pub action: StepAction,
    pub lr_stat: f64,
}

/// Fitted logistic propensity model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropensityModel {
    pub terms: Vec<Term>,
    pub labels: Vec<String>,
    /// Intercept first, then one coefficient per term, on the covariate scale.
    pub coefficients: Vec<f64>,
    pub log_likelihood: f64,
    pub steps: Vec<SelectionStep>,
}

impl PropensityModel {
    pub fn linear_predictor(&self, sample: &Sample) -> Array1<f64> {
        let z = design(&sample.covariates(), &self.terms);
        let beta = Array1::from(self.coefficients[1..].to_vec());
        z.dot(&beta) + self.coefficients[0]
    }

    // Attach propensity scores
    //
    // Evaluates the logistic transform of the fitted linear predictor for
    // every unit of `sample` and returns the sample carrying those scores.
    // A score that rounds to 0 or 1 is a fit failure, not a valid result.
    pub fn apply(&self, sample: &Sample) -> Result<Sample> {
        let scores = self
            .linear_predictor(sample)
            .mapv(|eta| 1.0 / (1.0 + (-eta).exp()));
        if scores.iter().any(|&p| !(p > 0.0 && p < 1.0)) {
            let blame = self.labels.last().cloned().unwrap_or_else(|| "intercept".to_string());
            return Err(Error::model_fit(blame, "fitted propensity reaches 0 or 1"));
        }
        sample.with_propensity(scores)
    }
}

impl fmt::Display for PropensityModel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "PROPENSITY ===================================")?;
        writeln!(f, "Log-likelihood          : {:.3}", self.log_likelihood)?;
        writeln!(f, "{:<24} {:>12}", "Term", "Coef.")?;
        writeln!(f, "{:<24} {:>12.4}", "Intercept", self.coefficients[0])?;
        for (label, coef) in self.labels.iter().zip(&self.coefficients[1..]) {
            writeln!(f, "{:<24} {:>12.4}", label, coef)?;
        }
        Ok(())
    }
}

// `log(1 + exp(eta))` without overflow.
fn softplus(eta: f64) -> f64 {
    eta.max(0.0) + (-eta.abs()).exp().ln_1p()
}

fn log_likelihood(z: &DMatrix<f64>, d: &DVector<f64>, beta: &DVector<f64>) -> f64 {
    let eta = z * beta;
    d.iter().zip(eta.iter()).map(|(&d, &e)| d * e - softplus(e)).sum()
}

struct NewtonFit {
    beta: DVector<f64>,
    probabilities: DVector<f64>,
    log_likelihood: f64,
}

// Newton-Raphson for the logit likelihood
//
// Each step solves the information matrix against the score and is halved
// until the likelihood does not decrease. Stops once a step moves no
// coefficient by more than 1e-9. Fitted probabilities reaching 0 or 1, or an
// information matrix that loses rank, mean the data separate on this design.
fn newton_logit(
    z: &DMatrix<f64>,
    d: &DVector<f64>,
    start: DVector<f64>,
    max_iterations: u64,
) -> std::result::Result<NewtonFit, String> {
    let mut beta = start;
    let mut ll = log_likelihood(z, d, &beta);
    if !ll.is_finite() {
        beta = DVector::zeros(z.ncols());
        ll = log_likelihood(z, d, &beta);
    }
    for _ in 0..max_iterations {
        let p = (z * &beta).map(|e| 1.0 / (1.0 + (-e).exp()));
        if p.iter().any(|&v| !(v > 0.0 && v < 1.0)) {
            return Err("perfect separation: fitted propensity reaches 0 or 1".to_string());
        }
        let score = z.transpose() * (d - &p);
        let mut weighted = z.clone();
        for (mut row, &v) in weighted.row_iter_mut().zip(p.iter()) {
            row *= v * (1.0 - v);
        }
        let information = z.transpose() * weighted;
        let step = spd_inverse(&information)
            .ok_or_else(|| "information matrix lost rank: quasi-separation".to_string())?
            * score;

        let mut t = 1.0;
        let (mut next, mut next_ll) = (&beta + &step, 0.0);
        for _ in 0..40 {
            next = &beta + &step * t;
            next_ll = log_likelihood(z, d, &next);
            if next_ll >= ll {
                break;
            }
            t *= 0.5;
        }
        if !(next_ll >= ll) {
            // No ascent direction left at machine precision.
            next = beta.clone();
            next_ll = ll;
        }
        let moved = (&next - &beta).amax();
        beta = next;
        ll = next_ll;
        if moved <= 1e-9 {
            let probabilities = (z * &beta).map(|e| 1.0 / (1.0 + (-e).exp()));
            if probabilities.iter().any(|&v| !(v > 0.0 && v < 1.0)) {
                return Err("perfect separation: fitted propensity reaches 0 or 1".to_string());
            }
            return Ok(NewtonFit { beta, probabilities, log_likelihood: ll });
        }
    }
    Err(format!("Newton refinement did not settle within {} iterations", max_iterations))
}

struct LogitFit {
    coefficients: Vec<f64>,
    log_likelihood: f64,
}

// Fits the logit for one candidate design and performs the stepwise search.
struct Selector<'a> {
    x: Array2<f64>,
    d: Array1<usize>,
    names: &'a [String],
    cfg: &'a PropensityConfig,
    enter: f64,
    keep: f64,
    steps: Vec<SelectionStep>,
}

impl<'a> Selector<'a> {
    fn new(sample: &'a Sample, cfg: &'a PropensityConfig) -> Result<Self> {
        sample.require_both_arms("propensity estimation")?;
        let (enter, keep) = cfg.thresholds()?;
        let d = sample.treatment().into_iter().map(usize::from).collect();
        Ok(Self {
            x: sample.covariates(),
            d,
            names: sample.names(),
            cfg,
            enter,
            keep,
            steps: Vec::new(),
        })
    }

    fn label(&self, term: Term) -> String {
        term.label(self.names)
    }

    // First term (in order) whose column is constant or a linear combination
    // of the intercept and the terms before it.
    fn first_dependent(&self, terms: &[Term]) -> Option<Term> {
        if terms.len() + 1 >= self.d.len() {
            return terms.last().copied();
        }
        let z = design(&self.x, terms);
        for t in 1..=terms.len() {
            let prefix = z.slice(ndarray::s![.., ..t]).to_owned();
            let full_rank = standardized(&prefix)
                .map(|s| has_full_column_rank(&to_dmatrix(&s)))
                .unwrap_or(false);
            if !full_rank {
                return Some(terms[t - 1]);
            }
        }
        None
    }

    fn admissible(&self, terms: &[Term]) -> bool {
        if terms.len() + 1 >= self.d.len() {
            return false;
        }
        standardized(&design(&self.x, terms))
            .map(|s| has_full_column_rank(&to_dmatrix(&s)))
            .unwrap_or(false)
    }

    // Maximum-likelihood logit on the given terms
    //
    // The design is standardized and handed to linfa. Its coefficients start
    // a bounded Newton-Raphson refinement, so the likelihood-ratio tests
    // compare exact maxima. linfa picks its own positive class, so its
    // coefficients are flipped when that class is the control arm.
    // Coefficients are mapped back to the covariate scale afterwards.
    fn fit(&self, terms: &[Term], blame: Option<Term>) -> Result<LogitFit> {
        let blame_label = || match blame.or_else(|| terms.last().copied()) {
            Some(t) => self.label(t),
            None => "intercept".to_string(),
        };
        let n = self.d.len() as f64;
        let n_treated = self.d.sum() as f64;
        if terms.is_empty() {
            let p = n_treated / n;
            let log_likelihood = n_treated * p.ln() + (n - n_treated) * (1.0 - p).ln();
            return Ok(LogitFit { coefficients: vec![(p / (1.0 - p)).ln()], log_likelihood });
        }
        if let Some(bad) = self.first_dependent(terms) {
            return Err(Error::model_fit(
                self.label(bad),
                "singular design: constant or collinear with earlier terms",
            ));
        }

        let z = design(&self.x, terms);
        let train = Dataset::new(z.clone(), self.d.clone())
            .with_feature_names(terms.iter().map(|&t| self.label(t)).collect());
        let scaler = LinearScaler::standard()
            .fit(&train)
            .map_err(|e| Error::model_fit(blame_label(), e.to_string()))?;
        let train = scaler.transform(train);
        let model = LogisticRegression::default()
            .with_intercept(true)
            .alpha(0.0)
            .max_iterations(self.cfg.max_iterations)
            .fit(&train)
            .map_err(|e| Error::model_fit(blame_label(), e.to_string()))?;

        let k = terms.len();
        let sign = if model.labels().pos.class == 1 { 1.0 } else { -1.0 };
        let mut start = DVector::zeros(k + 1);
        start[0] = sign * model.intercept();
        for (j, &b) in model.params().iter().enumerate() {
            start[j + 1] = sign * b;
        }
        let records = train.records();
        let zs = DMatrix::from_fn(records.nrows(), k + 1, |i, j| if j == 0 { 1.0 } else { records[[i, j - 1]] });
        let d = DVector::from_iterator(self.d.len(), self.d.iter().map(|&v| v as f64));
        let newton = newton_logit(&zs, &d, start, self.cfg.max_iterations)
            .map_err(|reason| Error::model_fit(blame_label(), reason))?;

        let resid = &d - &newton.probabilities;
        let max_score = (zs.transpose() * &resid).amax() / n;
        if !(max_score <= self.cfg.score_tolerance) {
            return Err(Error::model_fit(
                blame_label(),
                format!(
                    "no convergence within {} iterations (mean score {:.2e})",
                    self.cfg.max_iterations, max_score
                ),
            ));
        }

        // The standardized and raw designs span the same affine space, so the
        // fitted log-odds are reproduced exactly by a regression on the raw
        // columns.
        let log_odds = &zs * &newton.beta;
        let mut raw = Array2::ones((z.nrows(), z.ncols() + 1));
        raw.slice_mut(ndarray::s![.., 1..]).assign(&z);
        let coefficients = lstsq(&to_dmatrix(&raw), &log_odds, "propensity coefficients")?
            .iter()
            .copied()
            .collect();
        Ok(LogitFit { coefficients, log_likelihood: newton.log_likelihood })
    }

    // Greedy stepwise search over `candidates`, holding `fixed` in the model.
    //
    // Forward: the candidate with the largest LR statistic enters when it
    // reaches `enter`; ties go to the earliest candidate. Backward: after each
    // entry, the free term with the smallest removal statistic leaves while
    // that statistic is under `keep`. Returns the free terms in entry order.
    fn stepwise(&mut self, fixed: &[Term], candidates: Vec<Term>) -> Result<Vec<Term>> {
        let mut free: Vec<Term> = Vec::new();
        let mut pool: BTreeSet<Term> = candidates.into_iter().collect();
        for _ in 0..self.cfg.max_steps {
            let current: Vec<Term> = fixed.iter().chain(&free).copied().collect();
            let null = self.fit(&current, None)?;

            let mut best: Option<(Term, f64)> = None;
            for &cand in &pool {
                let mut trial = current.clone();
                trial.push(cand);
                if !self.admissible(&trial) {
                    debug!(term = %self.label(cand), "candidate skipped: singular design");
                    continue;
                }
                let alt = self.fit(&trial, Some(cand))?;
                let lr = 2.0 * (alt.log_likelihood - null.log_likelihood);
                debug!(term = %self.label(cand), lr, "candidate evaluated");
                if best.map_or(true, |(_, top)| lr > top) {
                    best = Some((cand, lr));
                }
            }
            let (term, lr) = match best {
                Some((term, lr)) if lr >= self.enter => (term, lr),
                _ => return Ok(free),
            };
            pool.remove(&term);
            free.push(term);
            self.record(term, StepAction::Entered, lr);

            while free.len() > 1 {
                let current: Vec<Term> = fixed.iter().chain(&free).copied().collect();
                let full = self.fit(&current, None)?;
                let mut weakest: Option<(usize, f64)> = None;
                for (i, &term) in free.iter().enumerate() {
                    let reduced: Vec<Term> = current.iter().copied().filter(|&t| t != term).collect();
                    let fit = self.fit(&reduced, Some(term))?;
                    let lr = 2.0 * (full.log_likelihood - fit.log_likelihood);
                    if weakest.map_or(true, |(_, low)| lr < low) {
                        weakest = Some((i, lr));
                    }
                }
                match weakest {
                    Some((i, lr)) if lr < self.keep => {
                        let term = free.remove(i);
                        pool.insert(term);
                        self.record(term, StepAction::Removed, lr);
                    }
                    _ => break,
                }
            }
        }
        Err(Error::model_fit(
            "stepwise selection",
            format!("did not settle within {} steps", self.cfg.max_steps),
        ))
    }

    fn record(&mut self, term: Term, action: StepAction, lr_stat: f64) {
        let label = self.label(term);
        debug!(term = %label, ?action, lr_stat, "stepwise step");
        self.steps.push(SelectionStep { term, label, action, lr_stat });
    }

    fn finish(self, terms: Vec<Term>) -> Result<PropensityModel> {
        let fit = self.fit(&terms, None)?;
        let labels: Vec<String> = terms.iter().map(|&t| self.label(t)).collect();
        info!(
            terms = %labels.join(", "),
            log_likelihood = fit.log_likelihood,
            "propensity model fitted"
        );
        Ok(PropensityModel {
            terms,
            labels,
            coefficients: fit.coefficients,
            log_likelihood: fit.log_likelihood,
            steps: self.steps,
        })
    }
}

// Estimate a propensity model with a fixed set of terms.
pub fn estimate_propensity(
    sample: &Sample,
    terms: &[Term],
    cfg: &PropensityConfig,
) -> Result<PropensityModel> {
    let k = sample.n_covariates();
    let in_range = |i: usize| i < k;
    if let Some(bad) = terms.iter().find(|t| match **t {
        Term::Linear(i) => !in_range(i),
        Term::Quadratic(i, j) => !in_range(i) || !in_range(j),
    }) {
        return Err(Error::InvalidConfig(format!(
            "term {:?} refers to a covariate outside 0..{}",
            bad, k
        )));
    }
    Selector::new(sample, cfg)?.finish(terms.to_vec())
}

// Select and estimate a propensity model
//
// Linear terms are chosen first by stepwise likelihood-ratio testing, with
// the configured basic covariates always present. Quadratic terms (pairwise
// products and squares of the selected linear covariates) are then chosen the
// same way with the linear terms held fixed. Terms whose label is listed in
// `exclude` are never candidates, which is how a term named by a `ModelFit`
// error is dropped before retrying.
pub fn select_propensity(sample: &Sample, cfg: &PropensityConfig) -> Result<PropensityModel> {
    let names = sample.names();
    let basic = cfg
        .basic
        .iter()
        .map(|name| {
            names
                .iter()
                .position(|n| n == name)
                .map(Term::Linear)
                .ok_or_else(|| Error::InvalidConfig(format!("unknown basic covariate `{}`", name)))
        })
        .collect::<Result<Vec<Term>>>()?;

    let k = sample.n_covariates();
    let every_label: BTreeSet<String> = (0..k)
        .flat_map(|i| std::iter::once(Term::Linear(i)).chain((i..k).map(move |j| Term::Quadratic(i, j))))
        .map(|t| t.label(names))
        .collect();
    if let Some(unknown) = cfg.exclude.iter().find(|l| !every_label.contains(*l)) {
        return Err(Error::InvalidConfig(format!("cannot exclude unknown term `{}`", unknown)));
    }
    let allowed = |t: &Term| !cfg.exclude.contains(&t.label(names));

    let mut selector = Selector::new(sample, cfg)?;
    let linear_candidates = (0..k)
        .map(Term::Linear)
        .filter(|t| !basic.contains(t) && allowed(t))
        .collect();
    let selected = selector.stepwise(&basic, linear_candidates)?;
    let linear: Vec<Term> = basic.into_iter().chain(selected).collect();

    let mut covariates: Vec<usize> = linear
        .iter()
        .filter_map(|t| match *t {
            Term::Linear(i) => Some(i),
            Term::Quadratic(..) => None,
        })
        .collect();
    covariates.sort_unstable();
    let mut quadratic_candidates = Vec::new();
    for (a, &i) in covariates.iter().enumerate() {
        for &j in &covariates[a..] {
            let term = Term::Quadratic(i, j);
            if allowed(&term) {
                quadratic_candidates.push(term);
            }
        }
    }
    let quadratic = selector.stepwise(&linear, quadratic_candidates)?;
    let terms = linear.into_iter().chain(quadratic).collect();
    selector.finish(terms)
}
