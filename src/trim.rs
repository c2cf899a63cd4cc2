use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::sample::Sample;

/// Outcome of trimming: the retained sample and the cutoff that produced it.
#[derive(Debug, Clone)]
pub struct Trimmed {
    pub cutoff: f64,
    pub sample: Sample,
    pub dropped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrimSummary {
    pub cutoff: f64,
    pub retained: usize,
    pub retained_treated: usize,
    pub retained_control: usize,
    pub dropped: usize,
}

impl Trimmed {
    pub fn summary(&self) -> TrimSummary {
        TrimSummary {
            cutoff: self.cutoff,
            retained: self.sample.len(),
            retained_treated: self.sample.n_treated(),
            retained_control: self.sample.n_control(),
            dropped: self.dropped,
        }
    }
}

fn retain(sample: &Sample, cutoff: f64, positions: Vec<usize>) -> Trimmed {
    let trimmed = sample.subset(&positions);
    let dropped = sample.len() - trimmed.len();
    info!(
        cutoff,
        retained = trimmed.len(),
        treated = trimmed.n_treated(),
        control = trimmed.n_control(),
        dropped,
        "sample trimmed"
    );
    if trimmed.n_treated() == 0 || trimmed.n_control() == 0 {
        warn!(cutoff, "trimming emptied a treatment arm");
    }
    Trimmed { cutoff, sample: trimmed, dropped }
}

// Trim with a fixed cutoff
//
// Keeps units whose propensity lies strictly inside (cutoff, 1 - cutoff).
pub fn trim_fixed(sample: &Sample, cutoff: f64) -> Result<Trimmed> {
    if !(cutoff > 0.0 && cutoff < 0.5) {
        return Err(Error::InvalidConfig(format!(
            "trim cutoff {} outside (0, 0.5)",
            cutoff
        )));
    }
    let p = sample.require_propensity()?;
    let positions = p
        .iter()
        .enumerate()
        .filter(|(_, &p)| p > cutoff && p < 1.0 - cutoff)
        .map(|(i, _)| i)
        .collect();
    Ok(retain(sample, cutoff, positions))
}

// Trim with the variance-minimizing cutoff
//
// Following Crump, Hotz, Imbens and Mitnik (2009), the asymptotic variance
// bound of the effect estimator on the subpopulation `{ g(p) <= gamma }`,
// with `g(p) = 1 / (p (1 - p))`, is proportional to the mean of `g` over that
// subpopulation divided by its size. Units are sorted by `g` and every prefix
// is a candidate; the best prefix that keeps at least `min_retention` of each
// arm wins. The reported cutoff is `0.5 - sqrt(0.25 - 1 / gamma)`.
pub fn trim_auto(sample: &Sample, min_retention: f64) -> Result<Trimmed> {
    if !(0.0..=1.0).contains(&min_retention) {
        return Err(Error::InvalidConfig(format!(
            "minimum retention {} outside [0, 1]",
            min_retention
        )));
    }
    let p = sample.require_propensity()?;
    let n_treated = sample.n_treated();
    let n_control = sample.n_control();
    let need_treated = (min_retention * n_treated as f64).ceil().max(1.0) as usize;
    let need_control = (min_retention * n_control as f64).ceil().max(1.0) as usize;

    let g: Vec<f64> = p.iter().map(|&p| 1.0 / (p * (1.0 - p))).collect();
    let mut order: Vec<usize> = (0..g.len()).collect();
    order.sort_by(|&a, &b| g[a].total_cmp(&g[b]).then(a.cmp(&b)));

    let mut best: Option<(usize, f64)> = None;
    let (mut sum, mut kept_treated, mut kept_control) = (0.0, 0, 0);
    for (i, &pos) in order.iter().enumerate() {
        sum += g[pos];
        if sample.is_treated(pos) {
            kept_treated += 1;
        } else {
            kept_control += 1;
        }
        // A prefix only counts once every unit tied at its boundary is in.
        if order.get(i + 1).map_or(false, |&next| g[next] == g[pos]) {
            continue;
        }
        if kept_treated < need_treated || kept_control < need_control {
            continue;
        }
        let count = (i + 1) as f64;
        let h = sum / (count * count);
        if best.map_or(true, |(_, top)| h < top) {
            best = Some((i, h));
        }
    }

    let (last, _) = best.ok_or(Error::InsufficientOverlap {
        min_retention,
        n_treated,
        n_control,
    })?;
    let gamma = g[order[last]];
    let cutoff = 0.5 - (0.25 - 1.0 / gamma).max(0.0).sqrt();
    let mut positions: Vec<usize> = order[..=last].to_vec();
    positions.sort_unstable();
    Ok(retain(sample, cutoff, positions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Data, Unit};
    use ndarray::Array1;

    fn scored(scores: &[f64], treated: &[bool]) -> Sample {
        let units: Vec<Unit> = scores
            .iter()
            .zip(treated)
            .map(|(&p, &d)| Unit { outcome: p, treated: d, covariates: vec![p] })
            .collect();
        Data::from_units(&units, vec!["x".into()])
            .unwrap()
            .into_sample()
            .with_propensity(Array1::from(scores.to_vec()))
            .unwrap()
    }

    fn spread(n: usize) -> Sample {
        let scores: Vec<f64> = (0..n).map(|i| (i as f64 + 0.5) / n as f64).collect();
        let treated: Vec<bool> = scores.iter().enumerate().map(|(i, &p)| (i % 10) as f64 / 10.0 < p).collect();
        scored(&scores, &treated)
    }

    #[test]
    fn fixed_cutoff_bounds_retained_scores() {
        let sample = spread(200);
        let trimmed = trim_fixed(&sample, 0.1).unwrap();
        let p = trimmed.sample.propensity().unwrap();
        assert!(p.iter().all(|&v| v > 0.1 && v < 0.9));
        assert_eq!(trimmed.sample.len() + trimmed.dropped, sample.len());
    }

    #[test]
    fn fixed_cutoff_is_monotone() {
        let sample = spread(300);
        let mut previous = usize::MAX;
        for step in 1..50 {
            let cutoff = step as f64 / 100.0;
            let kept = trim_fixed(&sample, cutoff).unwrap().sample.len();
            assert!(kept <= previous, "cutoff {} kept {} > {}", cutoff, kept, previous);
            previous = kept;
        }
    }

    #[test]
    fn fixed_cutoff_out_of_range() {
        let sample = spread(10);
        assert!(matches!(trim_fixed(&sample, 0.5), Err(Error::InvalidConfig(_))));
        assert!(matches!(trim_fixed(&sample, 0.0), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn requires_propensity() {
        let sample = crate::sample::tests::toy_sample();
        assert!(matches!(trim_fixed(&sample, 0.1), Err(Error::MissingPropensity)));
        assert!(matches!(trim_auto(&sample, 0.1), Err(Error::MissingPropensity)));
    }

    #[test]
    fn auto_keeps_everything_under_good_overlap() {
        let scores: Vec<f64> = (0..100).map(|i| 0.4 + 0.2 * i as f64 / 99.0).collect();
        let treated: Vec<bool> = (0..100).map(|i| i % 2 == 0).collect();
        let trimmed = trim_auto(&scored(&scores, &treated), 0.1).unwrap();
        assert_eq!(trimmed.dropped, 0);
    }

    #[test]
    fn auto_drops_extreme_scores() {
        let mut scores: Vec<f64> = (0..200).map(|i| 0.3 + 0.4 * i as f64 / 199.0).collect();
        scores.extend([0.001, 0.002, 0.998, 0.999]);
        let treated: Vec<bool> = (0..scores.len()).map(|i| i % 2 == 1).collect();
        let trimmed = trim_auto(&scored(&scores, &treated), 0.1).unwrap();
        assert_eq!(trimmed.dropped, 4);
        assert!(trimmed.cutoff > 0.002 && trimmed.cutoff < 0.3 + 1e-9);
        let p = trimmed.sample.propensity().unwrap();
        assert!(p.iter().all(|&v| v >= trimmed.cutoff - 1e-12 && v <= 1.0 - trimmed.cutoff + 1e-12));
    }

    #[test]
    fn auto_rejects_unsatisfiable_retention() {
        let scores = vec![0.5, 0.5, 0.5, 0.01, 0.99];
        let treated = vec![false, false, false, true, true];
        let err = trim_auto(&scored(&scores, &treated), 1.5).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let scores = vec![0.5, 0.5, 0.5, 0.01, 0.99];
        let treated = vec![true, true, true, true, true];
        let err = trim_auto(&scored(&scores, &treated), 0.5).unwrap_err();
        assert!(matches!(err, Error::InsufficientOverlap { .. }));
    }
}
