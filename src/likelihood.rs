use faer::MatRef;

use crate::{
    decorrelate::DecorrelatedObservation,
    linalg::CovarianceFactor,
    math::{subtract_out, weighted_sum_sq_logdet},
    prior::Prior,
    surrogate::Prediction,
    CesError, Result,
};

/// Evaluates the log posterior of a parameter from a surrogate prediction.
///
/// Two noise models are supported. If the prediction carries a
/// variance, the outputs are treated as independent with that variance
/// and a log-determinant penalty is added:
///
/// `logL = -½ diffᵗ diag(var)⁻¹ diff - ½ ln det diag(var)`
///
/// Otherwise the observational noise covariance `Σ` is used:
///
/// `logL = -½ diffᵗ Σ⁻¹ diff`
#[derive(Debug, Clone)]
pub struct LikelihoodEvaluator {
    observed: Vec<f64>,
    noise: CovarianceFactor,
}

impl LikelihoodEvaluator {
    /// Fails if the noise covariance is not symmetric positive definite.
    pub fn new(observed: Vec<f64>, noise_covariance: MatRef<'_, f64>) -> Result<Self> {
        if noise_covariance.nrows() != observed.len() {
            return Err(CesError::DimensionMismatch {
                what: "noise covariance",
                expected: observed.len(),
                got: noise_covariance.nrows(),
            });
        }
        let noise = CovarianceFactor::new(noise_covariance, "noise covariance")?;
        Ok(Self { observed, noise })
    }

    pub fn from_observation(observation: &DecorrelatedObservation) -> Result<Self> {
        Self::new(
            observation.observed.clone(),
            observation.noise_covariance.as_ref(),
        )
    }

    pub fn observed(&self) -> &[f64] {
        &self.observed
    }

    pub fn log_likelihood(&self, prediction: &Prediction) -> Result<f64> {
        let n = self.observed.len();
        if prediction.mean.len() != n {
            return Err(CesError::DimensionMismatch {
                what: "predicted mean",
                expected: n,
                got: prediction.mean.len(),
            });
        }
        let mut diff = vec![0f64; n];
        subtract_out(&prediction.mean, &self.observed, &mut diff);

        let Some(variance) = prediction.variance.as_ref() else {
            return Ok(-0.5 * self.noise.quadratic_form(&diff));
        };

        if variance.len() != n {
            return Err(CesError::DimensionMismatch {
                what: "predicted variance",
                expected: n,
                got: variance.len(),
            });
        }
        if let Some((index, &value)) = variance
            .iter()
            .enumerate()
            .find(|(_, v)| !(v.is_finite() && **v > 0.))
        {
            return Err(CesError::InvalidVariance { index, value });
        }
        let (quad, logdet) = weighted_sum_sq_logdet(&diff, variance);
        Ok(-0.5 * quad - 0.5 * logdet)
    }

    /// Log likelihood plus log prior.
    ///
    /// Returns `-inf` if the position is outside of the prior support
    /// or the prediction is not finite, so that the candidate is rejected.
    pub fn log_posterior<P: Prior + ?Sized>(
        &self,
        prior: &P,
        position: &[f64],
        prediction: &Prediction,
    ) -> Result<f64> {
        let log_prior = prior.log_density(position);
        if log_prior.is_nan() || log_prior == f64::NEG_INFINITY {
            return Ok(f64::NEG_INFINITY);
        }
        let log_posterior = self.log_likelihood(prediction)? + log_prior;
        if log_posterior.is_nan() {
            return Ok(f64::NEG_INFINITY);
        }
        Ok(log_posterior)
    }
}
