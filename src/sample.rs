use ndarray::{Array1, Array2, ArrayView1, Axis};
use polars::datatypes::DataType::{Float64, Int64};
use polars::prelude::{CsvReader, DataFrame, Float64Type, SerReader};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};

/// One observational record.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub outcome: f64,
    pub treated: bool,
    pub covariates: Vec<f64>,
}

/// The loaded dataset. Never mutated once built; samples view it by index.
#[derive(Debug)]
pub struct Data {
    outcome: Array1<f64>,
    treated: Vec<bool>,
    covariates: Array2<f64>,
    names: Vec<String>,
}

impl Data {
    pub fn from_units(units: &[Unit], names: Vec<String>) -> Result<Self> {
        let k = names.len();
        let mut covariates = Array2::zeros((units.len(), k));
        for (i, unit) in units.iter().enumerate() {
            if unit.covariates.len() != k {
                return Err(Error::InvalidData(format!(
                    "unit {} has {} covariates, expected {}",
                    i,
                    unit.covariates.len(),
                    k
                )));
            }
            for (j, &v) in unit.covariates.iter().enumerate() {
                covariates[[i, j]] = v;
            }
        }
        let outcome = units.iter().map(|u| u.outcome).collect();
        let treated = units.iter().map(|u| u.treated).collect();
        Self::new(outcome, treated, covariates, names)
    }

    pub fn new(
        outcome: Array1<f64>,
        treated: Vec<bool>,
        covariates: Array2<f64>,
        names: Vec<String>,
    ) -> Result<Self> {
        let n = outcome.len();
        if treated.len() != n || covariates.nrows() != n {
            return Err(Error::InvalidData(format!(
                "column lengths disagree: outcome {}, treatment {}, covariates {}",
                n,
                treated.len(),
                covariates.nrows()
            )));
        }
        if covariates.ncols() != names.len() {
            return Err(Error::InvalidData(format!(
                "{} covariate names for {} covariate columns",
                names.len(),
                covariates.ncols()
            )));
        }
        if outcome.iter().chain(covariates.iter()).any(|v| !v.is_finite()) {
            return Err(Error::InvalidData(
                "outcome and covariates must be finite (missing values are not imputed)".to_string(),
            ));
        }
        Ok(Self { outcome, treated, covariates, names })
    }

    // Build a dataset from a DataFrame
    //
    // Given the outcome and treatment column names, and optionally the
    // covariate names, this pulls the columns out as ndarrays. When no
    // covariates are named, every remaining column is used. The treatment
    // column must hold only 0 and 1.
    pub fn from_frame(
        data: &DataFrame,
        outcome: &str,
        treatment: &str,
        covariates: Option<&[String]>,
    ) -> Result<Self> {
        let y = data
            .column(outcome)?
            .cast(&Float64)?
            .f64()?
            .to_ndarray()?
            .to_owned();
        let d = data
            .column(treatment)?
            .cast(&Int64)?
            .i64()?
            .to_ndarray()?
            .to_owned();
        let treated = d
            .iter()
            .map(|&v| match v {
                0 => Ok(false),
                1 => Ok(true),
                other => Err(Error::InvalidData(format!(
                    "treatment column `{}` must be binary, found {}",
                    treatment, other
                ))),
            })
            .collect::<Result<Vec<bool>>>()?;
        let names: Vec<String> = match covariates {
            Some(names) => names.to_vec(),
            None => data
                .get_column_names()
                .into_iter()
                .filter(|name| *name != outcome && *name != treatment)
                .map(str::to_string)
                .collect(),
        };
        let x = data.select(&names)?.to_ndarray::<Float64Type>()?;
        Self::new(y, treated, x, names)
    }

    pub fn into_sample(self) -> Sample {
        Sample::full(Arc::new(self))
    }

    pub fn len(&self) -> usize {
        self.outcome.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcome.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

// Imports a delimited file from a specified path to a Polars DataFrame
pub fn import_data(path: &Path, delimiter: u8) -> Result<DataFrame> {
    let data = CsvReader::from_path(path)?
        .has_header(true)
        .with_delimiter(delimiter)
        .finish()?;
    Ok(data)
}

/// An ordered subset of a [`Data`] plus derived per-unit annotations.
///
/// Positions (`0..len()`) address units within the sample; indices address
/// rows of the underlying dataset. Deriving a new sample never touches the
/// dataset.
#[derive(Debug, Clone)]
pub struct Sample {
    data: Arc<Data>,
    index: Vec<usize>,
    propensity: Option<Array1<f64>>,
    strata: Option<Vec<usize>>,
}

impl Sample {
    pub fn full(data: Arc<Data>) -> Self {
        let index = (0..data.len()).collect();
        Self { data, index, propensity: None, strata: None }
    }

    pub fn data(&self) -> &Arc<Data> {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Dataset row indices of the units in this sample.
    pub fn indices(&self) -> &[usize] {
        &self.index
    }

    pub fn n_covariates(&self) -> usize {
        self.data.covariates.ncols()
    }

    pub fn names(&self) -> &[String] {
        &self.data.names
    }

    pub fn outcome(&self, pos: usize) -> f64 {
        self.data.outcome[self.index[pos]]
    }

    pub fn is_treated(&self, pos: usize) -> bool {
        self.data.treated[self.index[pos]]
    }

    pub fn covariate_row(&self, pos: usize) -> ArrayView1<'_, f64> {
        self.data.covariates.row(self.index[pos])
    }

    pub fn outcomes(&self) -> Array1<f64> {
        self.data.outcome.select(Axis(0), &self.index)
    }

    pub fn treatment(&self) -> Vec<bool> {
        self.index.iter().map(|&i| self.data.treated[i]).collect()
    }

    pub fn covariates(&self) -> Array2<f64> {
        self.data.covariates.select(Axis(0), &self.index)
    }

    pub fn treated_positions(&self) -> Vec<usize> {
        (0..self.len()).filter(|&p| self.is_treated(p)).collect()
    }

    pub fn control_positions(&self) -> Vec<usize> {
        (0..self.len()).filter(|&p| !self.is_treated(p)).collect()
    }

    pub fn n_treated(&self) -> usize {
        self.index.iter().filter(|&&i| self.data.treated[i]).count()
    }

    pub fn n_control(&self) -> usize {
        self.len() - self.n_treated()
    }

    pub fn propensity(&self) -> Option<&Array1<f64>> {
        self.propensity.as_ref()
    }

    pub(crate) fn require_propensity(&self) -> Result<&Array1<f64>> {
        self.propensity.as_ref().ok_or(Error::MissingPropensity)
    }

    pub fn stratum_ids(&self) -> Option<&[usize]> {
        self.strata.as_deref()
    }

    pub(crate) fn require_both_arms(&self, context: &str) -> Result<()> {
        let n_treated = self.n_treated();
        if n_treated == 0 || n_treated == self.len() {
            return Err(Error::empty_group(context));
        }
        Ok(())
    }

    // Narrow the sample to the given positions. Propensity scores follow the
    // units; stratum ids are dropped since they describe the old partition.
    pub fn subset(&self, positions: &[usize]) -> Sample {
        let index = positions.iter().map(|&p| self.index[p]).collect();
        let propensity = self
            .propensity
            .as_ref()
            .map(|p| p.select(Axis(0), positions));
        Sample { data: Arc::clone(&self.data), index, propensity, strata: None }
    }

    pub fn with_propensity(&self, scores: Array1<f64>) -> Result<Sample> {
        if scores.len() != self.len() {
            return Err(Error::InvalidData(format!(
                "{} propensity scores for {} units",
                scores.len(),
                self.len()
            )));
        }
        if let Some(bad) = scores.iter().find(|&&p| !(p > 0.0 && p < 1.0)) {
            return Err(Error::InvalidData(format!(
                "propensity score {} outside (0, 1)",
                bad
            )));
        }
        Ok(Sample { propensity: Some(scores), ..self.clone() })
    }

    pub fn with_strata(&self, ids: Vec<usize>) -> Result<Sample> {
        if ids.len() != self.len() {
            return Err(Error::InvalidData(format!(
                "{} stratum ids for {} units",
                ids.len(),
                self.len()
            )));
        }
        Ok(Sample { strata: Some(ids), ..self.clone() })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn toy_sample() -> Sample {
        let units = vec![
            Unit { outcome: 1.0, treated: true, covariates: vec![0.0, 1.0] },
            Unit { outcome: 2.0, treated: false, covariates: vec![1.0, 3.0] },
            Unit { outcome: 3.0, treated: true, covariates: vec![2.0, 2.0] },
            Unit { outcome: 4.0, treated: false, covariates: vec![3.0, 5.0] },
        ];
        Data::from_units(&units, vec!["a".into(), "b".into()])
            .unwrap()
            .into_sample()
    }

    #[test]
    fn subset_is_a_view() {
        let sample = toy_sample();
        let sub = sample.subset(&[3, 0]);
        assert_eq!(sub.indices(), &[3, 0]);
        assert_eq!(sub.outcome(0), 4.0);
        assert!(sub.is_treated(1));
        assert_eq!(sub.covariates().row(0).to_vec(), vec![3.0, 5.0]);
        assert_eq!(sample.len(), 4);
    }

    #[test]
    fn propensity_follows_subset() {
        let sample = toy_sample()
            .with_propensity(Array1::from(vec![0.1, 0.2, 0.3, 0.4]))
            .unwrap();
        let sub = sample.subset(&[2, 1]);
        assert_eq!(sub.propensity().unwrap().to_vec(), vec![0.3, 0.2]);
        assert!(sub.stratum_ids().is_none());
    }

    #[test]
    fn rejects_boundary_propensity() {
        let err = toy_sample()
            .with_propensity(Array1::from(vec![0.1, 0.0, 0.3, 0.4]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidData(_)));
    }

    #[test]
    fn rejects_ragged_units() {
        let units = vec![
            Unit { outcome: 1.0, treated: true, covariates: vec![0.0] },
            Unit { outcome: 1.0, treated: false, covariates: vec![0.0, 1.0] },
        ];
        assert!(Data::from_units(&units, vec!["a".into()]).is_err());
    }

    #[test]
    fn counts_arms() {
        let sample = toy_sample();
        assert_eq!(sample.n_treated(), 2);
        assert_eq!(sample.n_control(), 2);
        assert_eq!(sample.treated_positions(), vec![0, 2]);
        assert!(sample.subset(&[0, 2]).require_both_arms("test").is_err());
    }
}
