//! The cheap stand-in for the forward model that the sampler queries.

use anyhow::Result;
use faer::{Mat, MatRef};

use crate::CesError;

/// Predictions of a surrogate for a batch of `N` parameter vectors.
#[derive(Debug, Clone)]
pub struct BatchPrediction {
    /// `N x k` predicted means, one row per input.
    pub mean: Mat<f64>,
    /// One `k x k` predictive covariance per input, or empty if the
    /// surrogate does not provide an uncertainty estimate.
    pub covariances: Vec<Mat<f64>>,
}

/// The surrogate prediction at a single parameter vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub mean: Vec<f64>,
    /// Per-output predictive variance. If this is `None` the likelihood
    /// falls back to the observational noise covariance.
    pub variance: Option<Vec<f64>>,
}

impl Prediction {
    pub fn new(mean: Vec<f64>, variance: Option<Vec<f64>>) -> Self {
        Self { mean, variance }
    }
}

impl BatchPrediction {
    /// Extract the prediction for one input row.
    ///
    /// Only the diagonal of the predictive covariance is used.
    pub fn point(&self, row: usize) -> std::result::Result<Prediction, CesError> {
        if row >= self.mean.nrows() {
            return Err(CesError::DimensionMismatch {
                what: "prediction rows",
                expected: row + 1,
                got: self.mean.nrows(),
            });
        }
        let k = self.mean.ncols();
        let mean = (0..k).map(|j| self.mean[(row, j)]).collect();
        let variance = match self.covariances.get(row) {
            None if self.covariances.is_empty() => None,
            None => {
                return Err(CesError::DimensionMismatch {
                    what: "predictive covariances",
                    expected: self.mean.nrows(),
                    got: self.covariances.len(),
                })
            }
            Some(cov) => {
                if cov.nrows() != k || cov.ncols() != k {
                    return Err(CesError::DimensionMismatch {
                        what: "predictive covariance",
                        expected: k,
                        got: cov.nrows(),
                    });
                }
                Some((0..k).map(|j| cov[(j, j)]).collect())
            }
        };
        Ok(Prediction { mean, variance })
    }
}

/// A trained emulator of the forward model.
///
/// Prediction is treated as a pure, possibly expensive function. Outputs
/// must be expressed in the same (decorrelated) basis as the observation
/// the sampler was constructed with.
pub trait Surrogate {
    /// Number of outputs `k`.
    fn output_dim(&self) -> usize;

    /// Predict means and covariances for an `N x d` batch of parameters.
    fn predict(&mut self, inputs: MatRef<'_, f64>) -> Result<BatchPrediction>;
}

/// Query the surrogate at a single parameter vector.
pub fn predict_point<S: Surrogate + ?Sized>(
    surrogate: &mut S,
    position: &[f64],
) -> std::result::Result<Prediction, CesError> {
    let inputs = Mat::from_fn(1, position.len(), |_, j| position[j]);
    let batch = surrogate
        .predict(inputs.as_ref())
        .map_err(CesError::Surrogate)?;
    let prediction = batch.point(0)?;
    if prediction.mean.len() != surrogate.output_dim() {
        return Err(CesError::DimensionMismatch {
            what: "surrogate output",
            expected: surrogate.output_dim(),
            got: prediction.mean.len(),
        });
    }
    Ok(prediction)
}

/// A surrogate defined by a function of a single parameter vector.
pub struct FnSurrogate<F> {
    output_dim: usize,
    func: F,
}

impl<F> FnSurrogate<F>
where
    F: FnMut(&[f64]) -> Result<Prediction>,
{
    pub fn new(output_dim: usize, func: F) -> Self {
        Self { output_dim, func }
    }
}

impl<F> Surrogate for FnSurrogate<F>
where
    F: FnMut(&[f64]) -> Result<Prediction>,
{
    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn predict(&mut self, inputs: MatRef<'_, f64>) -> Result<BatchPrediction> {
        let n = inputs.nrows();
        let k = self.output_dim;
        let mut mean = Mat::zeros(n, k);
        let mut covariances = Vec::with_capacity(n);
        let mut row = vec![0f64; inputs.ncols()];
        for i in 0..n {
            row.iter_mut()
                .enumerate()
                .for_each(|(j, x)| *x = inputs[(i, j)]);
            let Prediction {
                mean: point_mean,
                variance,
            } = (self.func)(&row)?;
            anyhow::ensure!(
                point_mean.len() == k,
                "surrogate function returned {} outputs, expected {}",
                point_mean.len(),
                k
            );
            point_mean
                .iter()
                .enumerate()
                .for_each(|(j, &m)| mean[(i, j)] = m);
            if let Some(variance) = variance {
                anyhow::ensure!(
                    variance.len() == k,
                    "surrogate function returned {} variances, expected {}",
                    variance.len(),
                    k
                );
                covariances.push(Mat::from_fn(k, k, |a, b| if a == b { variance[a] } else { 0. }));
            }
        }
        anyhow::ensure!(
            covariances.is_empty() || covariances.len() == n,
            "surrogate function returned variances for only some inputs"
        );
        Ok(BatchPrediction { mean, covariances })
    }
}
