use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CesError {
    #[error("Unsupported sampling algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("Covariance matrix is not symmetric positive definite: {0}")]
    MalformedCovariance(String),
    #[error("Dimension mismatch in {what}: expected {expected}, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Step size must be positive and finite, got {0}")]
    InvalidStepSize(f64),
    #[error("Invalid sampler settings: {0}")]
    InvalidSettings(String),
    #[error("Surrogate returned an invalid predictive variance {value} at output {index}")]
    InvalidVariance { index: usize, value: f64 },
    #[error("Chain is full after {0} iterations")]
    ChainExhausted(u64),
    #[error("Chain is not finished: next slot {iteration} of {length}")]
    ChainIncomplete { iteration: u64, length: u64 },
    #[error(
        "Could not find a suitable step size in {trials} trials \
         (last step size {step_size}, acceptance rate {acceptance})"
    )]
    StepSizeSearchFailed {
        trials: u64,
        step_size: f64,
        acceptance: f64,
    },
    #[error("Unknown parameter name: {0}")]
    UnknownParameter(String),
    #[error("Posterior has no draws left after burn-in")]
    EmptyPosterior,
    #[error("Surrogate prediction failed")]
    Surrogate(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CesError>;
