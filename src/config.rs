//! Pipeline configuration. Every field has a default, so an empty JSON
//! object is a complete configuration.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::path::Path;

use crate::error::{Error, Result};
use crate::estimate::Method;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropensityConfig {
    /// Covariates always entered linearly and never removed.
    pub basic: Vec<String>,
    /// Term labels (`age`, `age^2`, `age*educ`) never offered as candidates.
    pub exclude: Vec<String>,
    /// A selected term stays while its removal test p-value is below this.
    pub inclusion_p: f64,
    /// A candidate enters only when its addition test p-value is below this.
    pub exclusion_p: f64,
    pub max_iterations: u64,
    /// Largest mean score component accepted as converged.
    pub score_tolerance: f64,
    pub max_steps: usize,
}

impl Default for PropensityConfig {
    fn default() -> Self {
        Self {
            basic: Vec::new(),
            exclude: Vec::new(),
            inclusion_p: 0.1,
            exclusion_p: 0.05,
            max_iterations: 500,
            score_tolerance: 1e-3,
            max_steps: 200,
        }
    }
}

impl PropensityConfig {
    // LR statistic thresholds: (enter, keep). Entering needs at least
    // `enter`; a selected term is dropped below `keep`.
    pub(crate) fn thresholds(&self) -> Result<(f64, f64)> {
        let valid = |p: f64| p > 0.0 && p < 1.0;
        if !valid(self.inclusion_p) || !valid(self.exclusion_p) {
            return Err(Error::InvalidConfig(format!(
                "p-value thresholds must lie in (0, 1): inclusion {}, exclusion {}",
                self.inclusion_p, self.exclusion_p
            )));
        }
        if self.exclusion_p > self.inclusion_p {
            return Err(Error::InvalidConfig(format!(
                "exclusion p-value {} must not exceed inclusion p-value {}",
                self.exclusion_p, self.inclusion_p
            )));
        }
        let chi2 = ChiSquared::new(1.0).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok((
            chi2.inverse_cdf(1.0 - self.exclusion_p),
            chi2.inverse_cdf(1.0 - self.inclusion_p),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TrimConfig {
    Off,
    Fixed { cutoff: f64 },
    Auto { min_retention: f64 },
}

impl Default for TrimConfig {
    fn default() -> Self {
        TrimConfig::Auto { min_retention: 0.1 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StratifyConfig {
    pub split_alpha: f64,
    /// Minimum treated and control count in each half of a split. Defaults
    /// to the number of covariates plus one.
    pub min_arm_size: Option<usize>,
    /// Use these propensity boundaries instead of the recursive search.
    pub boundaries: Option<Vec<f64>>,
}

impl Default for StratifyConfig {
    fn default() -> Self {
        Self { split_alpha: 0.05, min_arm_size: None, boundaries: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Adjustment {
    /// `Y ~ D`
    None,
    /// `Y ~ D + X`
    Linear,
    /// `Y ~ D + X + D*(X - mean X)`
    #[default]
    Interacted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    #[default]
    Mahalanobis,
    InverseVariance,
    Propensity,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub matches: usize,
    pub bias_adjust: bool,
    pub metric: Metric,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { matches: 1, bias_adjust: true, metric: Metric::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub methods: Vec<Method>,
    pub adjustment: Adjustment,
    /// Adjustment used inside each stratum by the blocking estimator.
    pub blocking_adjustment: Adjustment,
    pub matching: MatchingConfig,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            methods: vec![Method::Ols, Method::Blocking, Method::Matching],
            adjustment: Adjustment::Interacted,
            blocking_adjustment: Adjustment::Linear,
            matching: MatchingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub propensity: PropensityConfig,
    pub trim: TrimConfig,
    pub stratify: StratifyConfig,
    pub estimators: EstimatorConfig,
}

impl PipelineConfig {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn empty_object_is_default() {
        let cfg: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, PipelineConfig::default());
    }

    #[test]
    fn tagged_trim_modes() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"trim": {"mode": "fixed", "cutoff": 0.1}}"#).unwrap();
        assert_eq!(cfg.trim, TrimConfig::Fixed { cutoff: 0.1 });
        let cfg: PipelineConfig = serde_json::from_str(r#"{"trim": {"mode": "off"}}"#).unwrap();
        assert_eq!(cfg.trim, TrimConfig::Off);
    }

    #[test]
    fn partial_estimator_config() {
        let cfg: PipelineConfig = serde_json::from_str(
            r#"{"estimators": {"methods": ["matching"], "matching": {"matches": 3}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.estimators.methods, vec![Method::Matching]);
        assert_eq!(cfg.estimators.matching.matches, 3);
        assert!(cfg.estimators.matching.bias_adjust);
        assert_eq!(cfg.estimators.matching.metric, Metric::Mahalanobis);
    }

    #[test]
    fn exclusions_from_json() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"propensity": {"exclude": ["married*nodegree"]}}"#).unwrap();
        assert_eq!(cfg.propensity.exclude, vec!["married*nodegree".to_string()]);
        assert!(cfg.propensity.basic.is_empty());
    }

    #[test]
    fn default_thresholds() {
        let (enter, keep) = PropensityConfig::default().thresholds().unwrap();
        assert_abs_diff_eq!(enter, 3.841, epsilon = 1e-3);
        assert_abs_diff_eq!(keep, 2.706, epsilon = 1e-3);
    }

    #[test]
    fn exclusion_looser_than_inclusion_is_rejected() {
        let cfg = PropensityConfig { inclusion_p: 0.05, exclusion_p: 0.1, ..Default::default() };
        assert!(matches!(cfg.thresholds(), Err(Error::InvalidConfig(_))));
    }
}
