use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::function::erf::erfc;
use std::f64::consts::SQRT_2;
use std::fmt;

use crate::error::{Error, Result};

/// Treatment-effect estimation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Ols,
    Blocking,
    Matching,
    Weighting,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Method::Ols => "OLS",
            Method::Blocking => "Blocking",
            Method::Matching => "Matching",
            Method::Weighting => "Weighting",
        };
        f.write_str(name)
    }
}

/// A point estimate with its standard error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Estimate {
    pub value: f64,
    pub std_err: f64,
}

impl Estimate {
    pub fn new(value: f64, std_err: f64, what: &str) -> Result<Self> {
        if !value.is_finite() || !std_err.is_finite() || std_err < 0.0 {
            return Err(Error::NonFinite(format!(
                "{}: estimate {} with standard error {}",
                what, value, std_err
            )));
        }
        Ok(Self { value, std_err })
    }

    pub fn z(&self) -> f64 {
        if self.std_err > 0.0 {
            self.value / self.std_err
        } else if self.value == 0.0 {
            0.0
        } else {
            f64::INFINITY.copysign(self.value)
        }
    }

    /// Two-sided p-value of the null of zero effect.
    pub fn p_value(&self) -> f64 {
        erfc(self.z().abs() / SQRT_2)
    }

    /// Two-sided normal confidence interval; `level` must lie in (0, 1).
    pub fn conf_int(&self, level: f64) -> Result<(f64, f64)> {
        if !(level > 0.0 && level < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "confidence level {} outside (0, 1)",
                level
            )));
        }
        let q = Normal::new(0.0, 1.0)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?
            .inverse_cdf(0.5 + level / 2.0);
        Ok((self.value - q * self.std_err, self.value + q * self.std_err))
    }
}

/// ATE, ATT and ATC produced by one estimator run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectEstimate {
    pub method: Method,
    pub ate: Estimate,
    pub att: Estimate,
    pub atc: Estimate,
    pub n_treated: usize,
    pub n_control: usize,
}

impl EffectEstimate {
    pub fn n(&self) -> usize {
        self.n_treated + self.n_control
    }
}

impl fmt::Display for EffectEstimate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} ======================================= # Treat: {} | # Control: {}",
            self.method, self.n_treated, self.n_control
        )?;
        writeln!(
            f,
            "{:<4} {:>12} {:>10} {:>8} {:>7}   {:>24}",
            "", "Est.", "S.e.", "z", "P>|z|", "[95% Conf. int.]"
        )?;
        for (label, est) in [("ATE", &self.ate), ("ATC", &self.atc), ("ATT", &self.att)] {
            let (lb, ub) = est.conf_int(0.95).map_err(|_| fmt::Error)?;
            writeln!(
                f,
                "{:<4} {:>12.3} {:>10.3} {:>8.3} {:>7.3}   ({:.3}, {:.3})",
                label,
                est.value,
                est.std_err,
                est.z(),
                est.p_value(),
                lb,
                ub
            )?;
        }
        Ok(())
    }
}
