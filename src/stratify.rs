use serde::Serialize;
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt;
use tracing::{debug, info, warn};

use crate::config::StratifyConfig;
use crate::error::{Error, Result};
use crate::sample::Sample;

/// A propensity-score bin and the units falling in it.
#[derive(Debug, Clone)]
pub struct Stratum {
    pub lower: f64,
    pub upper: f64,
    pub sample: Sample,
}

impl Stratum {
    pub fn n_treated(&self) -> usize {
        self.sample.n_treated()
    }

    pub fn n_control(&self) -> usize {
        self.sample.n_control()
    }

    /// Estimators need both arms present.
    pub fn usable(&self) -> bool {
        self.n_treated() > 0 && self.n_control() > 0
    }
}

/// Strata partitioning a sample, plus that sample annotated with stratum ids.
#[derive(Debug, Clone)]
pub struct Strata {
    pub sample: Sample,
    pub strata: Vec<Stratum>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StratumSummary {
    pub lower: f64,
    pub upper: f64,
    pub n_treated: usize,
    pub n_control: usize,
    pub outcome_diff: Option<f64>,
}

impl Strata {
    fn from_blocks(sample: &Sample, blocks: Vec<(f64, f64, Vec<usize>)>) -> Result<Strata> {
        let mut ids = vec![0; sample.len()];
        let mut strata = Vec::with_capacity(blocks.len());
        for (id, (lower, upper, mut positions)) in blocks.into_iter().enumerate() {
            positions.sort_unstable();
            for &p in &positions {
                ids[p] = id;
            }
            let stratum = Stratum { lower, upper, sample: sample.subset(&positions) };
            if !stratum.usable() {
                warn!(
                    stratum = id,
                    treated = stratum.n_treated(),
                    control = stratum.n_control(),
                    "stratum lacks a treatment arm"
                );
            }
            strata.push(stratum);
        }
        info!(strata = strata.len(), "sample stratified");
        Ok(Strata { sample: sample.with_strata(ids)?, strata })
    }

    pub fn len(&self) -> usize {
        self.strata.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strata.is_empty()
    }

    pub fn summaries(&self) -> Vec<StratumSummary> {
        self.strata
            .iter()
            .map(|s| {
                let outcome_diff = s.usable().then(|| {
                    let mean = |positions: Vec<usize>| {
                        positions.iter().map(|&p| s.sample.outcome(p)).sum::<f64>()
                            / positions.len() as f64
                    };
                    mean(s.sample.treated_positions()) - mean(s.sample.control_positions())
                });
                StratumSummary {
                    lower: s.lower,
                    upper: s.upper,
                    n_treated: s.n_treated(),
                    n_control: s.n_control(),
                    outcome_diff,
                }
            })
            .collect()
    }
}

impl fmt::Display for Strata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "STRATA ======================================= # Strata: {}", self.len())?;
        writeln!(
            f,
            "{:<8} {:>8} {:>8} {:>9} {:>8} {:>12}",
            "Stratum", "Min p", "Max p", "Controls", "Treated", "Outcome diff"
        )?;
        for (i, s) in self.summaries().iter().enumerate() {
            let diff = s.outcome_diff.map_or_else(|| "-".to_string(), |d| format!("{:.3}", d));
            writeln!(
                f,
                "{:<8} {:>8.3} {:>8.3} {:>9} {:>8} {:>12}",
                i + 1,
                s.lower,
                s.upper,
                s.n_control,
                s.n_treated,
                diff
            )?;
        }
        Ok(())
    }
}

// Welch two-sample t-statistic, treated minus control.
fn welch_t(treated: &[f64], control: &[f64]) -> Option<f64> {
    if treated.len() < 2 || control.len() < 2 {
        return None;
    }
    let moments = |v: &[f64]| {
        let n = v.len() as f64;
        let mean = v.iter().sum::<f64>() / n;
        let var = v.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
        (mean, var / n)
    };
    let (mean_t, se2_t) = moments(treated);
    let (mean_c, se2_c) = moments(control);
    let diff = mean_t - mean_c;
    let se = (se2_t + se2_c).sqrt();
    if se > 0.0 {
        Some(diff / se)
    } else if diff == 0.0 {
        Some(0.0)
    } else {
        Some(f64::INFINITY.copysign(diff))
    }
}

struct Splitter<'a> {
    sample: &'a Sample,
    scores: &'a [f64],
    log_odds: Vec<f64>,
    critical: f64,
    min_arm: usize,
}

impl Splitter<'_> {
    fn arms(&self, block: &[usize]) -> (usize, usize) {
        let treated = block.iter().filter(|&&p| self.sample.is_treated(p)).count();
        (treated, block.len() - treated)
    }

    // Recursive bisection of a block sorted by propensity
    //
    // A block splits at its median score when the linearized propensity
    // still differs significantly between arms and both halves keep at least
    // `min_arm` units of each arm. Units tied with the median go right.
    fn split(&self, block: Vec<usize>, out: &mut Vec<Vec<usize>>) {
        let (treated, control): (Vec<f64>, Vec<f64>) = {
            let mut t = Vec::new();
            let mut c = Vec::new();
            for &p in &block {
                if self.sample.is_treated(p) {
                    t.push(self.log_odds[p]);
                } else {
                    c.push(self.log_odds[p]);
                }
            }
            (t, c)
        };
        let t = match welch_t(&treated, &control) {
            Some(t) if t.abs() > self.critical => t,
            _ => {
                out.push(block);
                return;
            }
        };
        let median = self.scores[block[block.len() / 2]];
        let cut = block.partition_point(|&p| self.scores[p] < median);
        let (left, right) = block.split_at(cut);
        let (left_t, left_c) = self.arms(left);
        let (right_t, right_c) = self.arms(right);
        if cut == 0 || left_t.min(left_c).min(right_t).min(right_c) < self.min_arm {
            out.push(block);
            return;
        }
        debug!(t, median, left = left.len(), right = right.len(), "stratum split");
        let (left, right) = (left.to_vec(), right.to_vec());
        self.split(left, out);
        self.split(right, out);
    }
}

// Stratify on the propensity score by recursive bisection
//
// Starts from one stratum spanning the whole sample and keeps splitting at
// the median while treated and control log-odds of the propensity differ
// significantly. The result partitions the sample exactly.
pub fn stratify_auto(sample: &Sample, cfg: &StratifyConfig) -> Result<Strata> {
    if !(cfg.split_alpha > 0.0 && cfg.split_alpha < 1.0) {
        return Err(Error::InvalidConfig(format!(
            "split significance {} outside (0, 1)",
            cfg.split_alpha
        )));
    }
    let scores = sample.require_propensity()?.to_vec();
    sample.require_both_arms("stratification")?;
    let critical = Normal::new(0.0, 1.0)
        .map_err(|e| Error::InvalidConfig(e.to_string()))?
        .inverse_cdf(1.0 - cfg.split_alpha / 2.0);
    let splitter = Splitter {
        sample,
        scores: &scores,
        log_odds: scores.iter().map(|&p| (p / (1.0 - p)).ln()).collect(),
        critical,
        min_arm: cfg.min_arm_size.unwrap_or(sample.n_covariates() + 1),
    };

    let mut order: Vec<usize> = (0..sample.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]).then(a.cmp(&b)));
    let mut blocks = Vec::new();
    splitter.split(order, &mut blocks);

    let blocks = blocks
        .into_iter()
        .map(|block| {
            let lower = scores[block[0]];
            let upper = scores[block[block.len() - 1]];
            (lower, upper, block)
        })
        .collect();
    Strata::from_blocks(sample, blocks)
}

// Stratify on fixed propensity boundaries
//
// The first bin is closed on both ends and later bins are `(b_i, b_i+1]`.
// Empty bins are dropped; bins missing an arm are kept but unusable.
pub fn stratify_fixed(sample: &Sample, boundaries: &[f64]) -> Result<Strata> {
    let scores = sample.require_propensity()?;
    if boundaries.len() < 2 || boundaries.windows(2).any(|w| !(w[0] < w[1])) {
        return Err(Error::InvalidConfig(
            "stratum boundaries must be at least two strictly increasing values".to_string(),
        ));
    }
    let (first, last) = (boundaries[0], boundaries[boundaries.len() - 1]);
    if scores.iter().any(|&p| p < first || p > last) {
        return Err(Error::InvalidConfig(format!(
            "boundaries [{}, {}] do not cover every propensity score",
            first, last
        )));
    }
    let mut bins: Vec<Vec<usize>> = vec![Vec::new(); boundaries.len() - 1];
    for (pos, &p) in scores.iter().enumerate() {
        let bin = boundaries[1..].partition_point(|&upper| upper < p);
        bins[bin].push(pos);
    }
    let blocks = bins
        .into_iter()
        .enumerate()
        .filter(|(_, positions)| !positions.is_empty())
        .map(|(i, positions)| (boundaries[i], boundaries[i + 1], positions))
        .collect();
    Strata::from_blocks(sample, blocks)
}

// Percentile with linear interpolation between order statistics.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}

// Stratify into `blocks` bins of roughly equal size by propensity quantile.
pub fn stratify_quantiles(sample: &Sample, blocks: usize) -> Result<Strata> {
    if blocks == 0 {
        return Err(Error::InvalidConfig("at least one stratum is required".to_string()));
    }
    let mut sorted = sample.require_propensity()?.to_vec();
    if sorted.is_empty() {
        return Err(Error::empty_group("stratification"));
    }
    sorted.sort_by(f64::total_cmp);
    let mut boundaries = vec![0.0];
    for i in 1..blocks {
        let cut = percentile(&sorted, i as f64 / blocks as f64);
        if cut > boundaries[boundaries.len() - 1] && cut < 1.0 {
            boundaries.push(cut);
        }
    }
    boundaries.push(1.0);
    stratify_fixed(sample, &boundaries)
}
