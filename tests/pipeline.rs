use approx::assert_abs_diff_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::collections::BTreeSet;
use std::path::Path;

use causeway::{
    assess_balance, import_data, run, select_propensity, stratify_auto, Data, MatchingConfig, Method,
    Metric, PipelineConfig, PropensityConfig, Sample, StratifyConfig, Unit,
};

// Three covariates; treatment depends on the first two, the effect is `tau`.
fn observational(n: usize, tau: f64, seed: u64) -> Sample {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let units: Vec<Unit> = (0..n)
        .map(|_| {
            let x: Vec<f64> = (0..3).map(|_| rng.sample(StandardNormal)).collect();
            let logit = 0.3 + 0.9 * x[0] - 0.6 * x[1];
            let treated = rng.gen::<f64>() < 1.0 / (1.0 + (-logit).exp());
            let noise: f64 = rng.sample(StandardNormal);
            let outcome = 2.0 + 1.5 * x[0] + x[1] - 0.5 * x[2] + if treated { tau } else { 0.0 } + noise;
            Unit { outcome, treated, covariates: x }
        })
        .collect();
    Data::from_units(&units, vec!["age".into(), "educ".into(), "earn".into()])
        .unwrap()
        .into_sample()
}

#[test]
fn end_to_end_recovers_the_effect() {
    let sample = observational(1500, 1.0, 7);
    let mut cfg = PipelineConfig::default();
    cfg.estimators.methods = vec![Method::Ols, Method::Blocking, Method::Matching, Method::Weighting];
    let report = run(&sample, &cfg).unwrap();

    for method in [Method::Ols, Method::Blocking, Method::Matching, Method::Weighting] {
        let est = report.estimate(method).unwrap();
        let (lo, hi) = est.ate.conf_int(0.999).unwrap();
        assert!(lo < 1.0 && 1.0 < hi, "{}: ATE {} outside ({}, {})", method, est.ate.value, lo, hi);
    }
    assert!(report.propensity.labels.contains(&"age".to_string()));
    assert!(report.propensity.labels.contains(&"educ".to_string()));
    assert!(!report.to_string().is_empty());
}

#[test]
fn strata_partition_the_trimmed_sample() {
    let sample = observational(800, 0.5, 3);
    let report = run(&sample, &PipelineConfig::default()).unwrap();
    let trimmed = report.sample();
    let mut seen = BTreeSet::new();
    let mut total = 0;
    for stratum in &report.strata.strata {
        total += stratum.sample.len();
        seen.extend(stratum.sample.indices().iter().copied());
    }
    assert_eq!(total, trimmed.len());
    assert_eq!(seen, trimmed.indices().iter().copied().collect());
}

#[test]
fn stages_do_not_mutate_their_input() {
    let sample = observational(400, 1.0, 11);
    let before = assess_balance(&sample).unwrap();
    let model = select_propensity(&sample, &PropensityConfig::default()).unwrap();
    let scored = model.apply(&sample).unwrap();
    let _ = stratify_auto(&scored, &StratifyConfig::default()).unwrap();
    assert!(sample.propensity().is_none());
    assert!(sample.stratum_ids().is_none());
    assert_eq!(assess_balance(&sample).unwrap(), before);

    let again = select_propensity(&sample, &PropensityConfig::default()).unwrap();
    assert_eq!(again.terms, model.terms);
    for (a, b) in again.coefficients.iter().zip(&model.coefficients) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-12);
    }
}

fn covariate_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

// 240 seeded job-training-style records: treated units earn less before
// adjustment, with a true effect of 1200 built into re78.
#[test]
fn csv_fixture_runs_end_to_end() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/data/jobs_small.csv");
    let frame = import_data(&path, b',').unwrap();
    let covariates = covariate_names(&["age", "educ", "married", "re74"]);
    let sample = Data::from_frame(&frame, "re78", "treat", Some(&covariates))
        .unwrap()
        .into_sample();
    assert_eq!(sample.len(), 240);
    assert_eq!(sample.n_treated(), 84);
    assert_eq!(sample.names(), covariates.as_slice());

    let before = assess_balance(&sample).unwrap();
    assert_abs_diff_eq!(before.outcome.raw_diff, -435.0356227106213, epsilon = 1e-6);

    let mut cfg = PipelineConfig::default();
    cfg.estimators.methods = vec![Method::Ols, Method::Matching];
    let report = run(&sample, &cfg).unwrap();
    assert!(report.sample().len() <= sample.len());
    let json = serde_json::to_value(&report.estimates).unwrap();
    assert_eq!(json.as_array().unwrap().len(), 2);
    for method in [Method::Ols, Method::Matching] {
        let est = report.estimate(method).unwrap();
        assert!(est.ate.value > 0.0, "{} ATE {}", method, est.ate.value);
    }
}

// Reference run on the 614-unit job training data (185 treated), which is not
// shipped. Point CAUSEWAY_LALONDE_CSV at a copy with columns treat, re78, age,
// educ, black, hispan, married, nodegree, re74, re75 to run it. See
// tests/data/README.md.
#[test]
#[ignore]
fn lalonde_reference() {
    let path = std::env::var("CAUSEWAY_LALONDE_CSV").expect("CAUSEWAY_LALONDE_CSV not set");
    let frame = import_data(Path::new(&path), b',').unwrap();
    let covariates =
        covariate_names(&["age", "educ", "black", "hispan", "married", "nodegree", "re74", "re75"]);
    let sample = Data::from_frame(&frame, "re78", "treat", Some(&covariates))
        .unwrap()
        .into_sample();
    assert_eq!(sample.len(), 614);
    assert_eq!(sample.n_treated(), 185);

    let before = assess_balance(&sample).unwrap();
    assert_abs_diff_eq!(before.outcome.raw_diff, -635.0, epsilon = 5.0);

    let mut cfg = PipelineConfig::default();
    cfg.estimators.methods = vec![Method::Matching];
    cfg.estimators.matching = MatchingConfig { matches: 1, bias_adjust: true, metric: Metric::InverseVariance };
    let report = run(&sample, &cfg).unwrap();

    let trim = report.trim.as_ref().unwrap();
    assert!((280..=315).contains(&trim.retained), "retained {}", trim.retained);
    assert!((125..=155).contains(&trim.retained_treated), "treated {}", trim.retained_treated);
    assert!((142..=172).contains(&trim.retained_control), "control {}", trim.retained_control);

    let est = report.estimate(Method::Matching).unwrap();
    assert!(est.ate.value > 0.0 && est.ate.value < 1000.0, "matching ATE {}", est.ate.value);
    assert!(est.ate.p_value() > 0.2, "p-value {}", est.ate.p_value());
}
