use polars::prelude::PolarsError;
use thiserror::Error;

// Every failure a pipeline stage can report.
//
// All of these are recoverable by the caller through parameter adjustment:
// drop a term, relax a constraint, merge strata or pick another estimator.
// None of them is returned in place of a number; a stage either hands back a
// complete result or one of these.
#[derive(Error, Debug)]
pub enum Error {
    /// Logistic fit did not converge or hit a singular design.
    #[error("propensity model fit failed on term `{term}`: {reason}")]
    ModelFit { term: String, reason: String },

    /// No trimming cutoff keeps enough of each treatment arm.
    #[error(
        "insufficient overlap: no cutoff retains {min_retention} of each arm \
         ({n_treated} treated, {n_control} control)"
    )]
    InsufficientOverlap {
        min_retention: f64,
        n_treated: usize,
        n_control: usize,
    },

    #[error("singular matrix in {context}")]
    SingularMatrix { context: String },

    #[error("empty treatment group in {context}")]
    EmptyGroup { context: String },

    #[error("sample carries no propensity scores; run the propensity estimator first")]
    MissingPropensity,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("non-finite result: {0}")]
    NonFinite(String),

    #[error("polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn empty_group(context: impl Into<String>) -> Self {
        Error::EmptyGroup { context: context.into() }
    }

    pub(crate) fn singular(context: impl Into<String>) -> Self {
        Error::SingularMatrix { context: context.into() }
    }

    pub(crate) fn model_fit(term: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ModelFit { term: term.into(), reason: reason.into() }
    }
}
