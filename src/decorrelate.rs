//! Map observations and their noise into a basis where the noise is
//! (approximately) independent per component.
//!
//! The noise covariance `Σ = U S Uᵗ` is decomposed with a symmetric
//! eigendecomposition. Observations are mapped with `S^{-1/2} Uᵗ`, which
//! turns `Σ` into the identity. Optionally only the leading directions
//! explaining a fraction of the total noise variance are kept.

use faer::{ColRef, Mat, MatRef, Scale, Side};
use itertools::Itertools;
use tracing::debug;

use crate::{linalg::check_covariance, CesError, Result};

const EIGENVALUE_RTOL: f64 = 1e-14;

#[derive(Debug, Clone, Copy)]
pub struct DecorrelationSettings {
    /// Decorrelate the observation. If false, the raw observation and the
    /// full covariance are used as they are.
    pub enabled: bool,
    /// Keep the leading eigen-directions that explain at least this
    /// fraction of the total noise variance. Must be in (0, 1].
    pub retain_variance: f64,
    /// Divide the observation by this factor (and the covariance by its
    /// square) before decorrelating.
    pub norm_factor: Option<f64>,
}

impl Default for DecorrelationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retain_variance: 1.0,
            norm_factor: None,
        }
    }
}

impl DecorrelationSettings {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.retain_variance > 0. && self.retain_variance <= 1.) {
            return Err(CesError::InvalidSettings(format!(
                "retain_variance must be in (0, 1], got {}",
                self.retain_variance
            )));
        }
        if let Some(factor) = self.norm_factor {
            if !(factor.is_finite() && factor > 0.) {
                return Err(CesError::InvalidSettings(format!(
                    "norm_factor must be positive and finite, got {}",
                    factor
                )));
            }
        }
        Ok(())
    }
}

/// A linear map from observation space into the decorrelated basis,
/// together with its (pseudo-)inverse.
#[derive(Debug, Clone)]
pub struct Decorrelation {
    /// `k x n`
    forward: Mat<f64>,
    /// `n x k`
    inverse: Mat<f64>,
    /// Retained eigenvalues in decreasing order. Empty for the identity map.
    eigenvalues: Vec<f64>,
    scale: f64,
}

impl Decorrelation {
    /// The identity map, optionally with standardization.
    pub fn identity(dim: usize, norm_factor: Option<f64>) -> Self {
        Self {
            forward: Mat::identity(dim, dim),
            inverse: Mat::identity(dim, dim),
            eigenvalues: vec![],
            scale: norm_factor.unwrap_or(1.),
        }
    }

    pub fn new(noise_cov: MatRef<'_, f64>, settings: &DecorrelationSettings) -> Result<Self> {
        settings.validate()?;
        check_covariance(noise_cov, noise_cov.nrows(), "noise covariance")?;

        let n = noise_cov.nrows();
        let scale = settings.norm_factor.unwrap_or(1.);
        let mut scaled = noise_cov.to_owned();
        scaled *= Scale((scale * scale).recip());

        let eig = scaled.self_adjoint_eigen(Side::Lower).map_err(|_| {
            CesError::MalformedCovariance("eigendecomposition did not converge".into())
        })?;
        let u = eig.U();
        let s = eig.S().column_vector().iter().copied().collect_vec();

        let order = (0..n)
            .sorted_by(|&a, &b| s[b].total_cmp(&s[a]))
            .collect_vec();

        let largest = order.first().map(|&i| s[i]).unwrap_or(0.);
        if let Some(&smallest) = order.last() {
            if !(s[smallest] > largest * EIGENVALUE_RTOL && s[smallest] > 0.) {
                return Err(CesError::MalformedCovariance(format!(
                    "noise covariance is not positive definite (smallest eigenvalue {})",
                    s[smallest]
                )));
            }
        }

        let total: f64 = order.iter().map(|&i| s[i]).sum();
        let mut kept = 0;
        let mut explained = 0f64;
        for &i in order.iter() {
            kept += 1;
            explained += s[i];
            if explained >= settings.retain_variance * total * (1. - 1e-12) {
                break;
            }
        }

        let retained = &order[..kept];
        let forward = Mat::from_fn(kept, n, |r, j| u[(j, retained[r])] / s[retained[r]].sqrt());
        let inverse = Mat::from_fn(n, kept, |j, r| u[(j, retained[r])] * s[retained[r]].sqrt());
        let eigenvalues = retained.iter().map(|&i| s[i]).collect_vec();

        debug!(
            input_dim = n,
            output_dim = kept,
            explained = explained / total,
            "decorrelated observational noise"
        );

        Ok(Self {
            forward,
            inverse,
            eigenvalues,
            scale,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.forward.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.forward.nrows()
    }

    pub fn eigenvalues(&self) -> &[f64] {
        &self.eigenvalues
    }

    /// Map a vector from observation space into the decorrelated basis.
    pub fn apply(&self, y: &[f64]) -> Result<Vec<f64>> {
        if y.len() != self.input_dim() {
            return Err(CesError::DimensionMismatch {
                what: "observation",
                expected: self.input_dim(),
                got: y.len(),
            });
        }
        let z = self.forward.as_ref() * ColRef::from_slice(y);
        Ok(z.iter().map(|val| val / self.scale).collect())
    }

    /// Map a vector from the decorrelated basis back into observation space.
    ///
    /// This is an exact inverse of `apply` unless directions were truncated.
    pub fn invert(&self, z: &[f64]) -> Result<Vec<f64>> {
        if z.len() != self.output_dim() {
            return Err(CesError::DimensionMismatch {
                what: "decorrelated vector",
                expected: self.output_dim(),
                got: z.len(),
            });
        }
        let y = self.inverse.as_ref() * ColRef::from_slice(z);
        Ok(y.iter().map(|val| val * self.scale).collect())
    }

    /// Express a covariance from observation space in the decorrelated basis.
    pub fn transform_covariance(&self, cov: MatRef<'_, f64>) -> Result<Mat<f64>> {
        check_covariance(cov, self.input_dim(), "covariance")?;
        let mut scaled = cov.to_owned();
        scaled *= Scale((self.scale * self.scale).recip());
        let out = &self.forward * &scaled * self.forward.transpose();
        // Remove rounding asymmetry
        let k = out.nrows();
        Ok(Mat::from_fn(k, k, |i, j| 0.5 * (out[(i, j)] + out[(j, i)])))
    }
}

/// An observation expressed in the basis used for likelihood evaluation.
#[derive(Debug, Clone)]
pub struct DecorrelatedObservation {
    pub observed: Vec<f64>,
    pub noise_covariance: Mat<f64>,
    pub transform: Decorrelation,
}

/// Decorrelate an observation and its noise covariance.
///
/// With `settings.enabled == false` the observation and covariance are only
/// standardized (if a norm factor is set) and otherwise passed through.
pub fn decorrelate(
    observed: &[f64],
    noise_cov: MatRef<'_, f64>,
    settings: &DecorrelationSettings,
) -> Result<DecorrelatedObservation> {
    settings.validate()?;
    check_covariance(noise_cov, observed.len(), "noise covariance")?;

    let transform = if settings.enabled {
        Decorrelation::new(noise_cov, settings)?
    } else {
        Decorrelation::identity(observed.len(), settings.norm_factor)
    };
    let observed = transform.apply(observed)?;
    let noise_covariance = transform.transform_covariance(noise_cov)?;

    Ok(DecorrelatedObservation {
        observed,
        noise_covariance,
        transform,
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use faer::Mat;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn correlated_cov() -> Mat<f64> {
        Mat::from_fn(3, 3, |i, j| match (i, j) {
            (0, 0) => 2.,
            (1, 1) => 1.5,
            (2, 2) => 1.,
            (0, 1) | (1, 0) => 0.6,
            (1, 2) | (2, 1) => -0.3,
            _ => 0.1,
        })
    }

    #[test]
    fn noise_becomes_identity() {
        let cov = correlated_cov();
        let out = decorrelate(&[1., 2., 3.], cov.as_ref(), &Default::default()).unwrap();
        assert_eq!(out.observed.len(), 3);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1. } else { 0. };
                assert_relative_eq!(out.noise_covariance[(i, j)], expected, epsilon = 1e-10);
            }
        }
        let eigs = out.transform.eigenvalues();
        assert!(eigs.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn disabled_passes_through() {
        let cov = correlated_cov();
        let settings = DecorrelationSettings {
            enabled: false,
            ..Default::default()
        };
        let out = decorrelate(&[1., 2., 3.], cov.as_ref(), &settings).unwrap();
        assert_eq!(out.observed, vec![1., 2., 3.]);
        assert_relative_eq!(out.noise_covariance[(0, 1)], 0.6, epsilon = 1e-14);
    }

    #[test]
    fn standardization_scales() {
        let cov = Mat::from_fn(2, 2, |i, j| if i == j { 4. } else { 0. });
        let settings = DecorrelationSettings {
            enabled: false,
            norm_factor: Some(2.),
            ..Default::default()
        };
        let out = decorrelate(&[2., 4.], cov.as_ref(), &settings).unwrap();
        assert_eq!(out.observed, vec![1., 2.]);
        assert_relative_eq!(out.noise_covariance[(0, 0)], 1., epsilon = 1e-14);
        assert_eq!(out.transform.invert(&out.observed).unwrap(), vec![2., 4.]);
    }

    #[test]
    fn truncation_drops_small_directions() {
        let cov = Mat::from_fn(3, 3, |i, j| match (i, j) {
            (0, 0) => 100.,
            (1, 1) => 10.,
            (2, 2) => 0.01,
            _ => 0.,
        });
        let settings = DecorrelationSettings {
            retain_variance: 0.99,
            ..Default::default()
        };
        let out = decorrelate(&[1., 1., 1.], cov.as_ref(), &settings).unwrap();
        assert_eq!(out.transform.output_dim(), 2);
        assert_eq!(out.observed.len(), 2);
        assert_eq!(out.noise_covariance.nrows(), 2);
    }

    #[test]
    fn rejects_invalid_input() {
        let cov = correlated_cov();
        assert!(matches!(
            decorrelate(&[1., 2.], cov.as_ref(), &Default::default()),
            Err(CesError::DimensionMismatch { .. })
        ));

        let singular = Mat::from_fn(2, 2, |_, _| 1.);
        assert!(matches!(
            decorrelate(&[1., 2.], singular.as_ref(), &Default::default()),
            Err(CesError::MalformedCovariance(_))
        ));

        let settings = DecorrelationSettings {
            retain_variance: 0.,
            ..Default::default()
        };
        assert!(matches!(
            decorrelate(&[1., 2., 3.], cov.as_ref(), &settings),
            Err(CesError::InvalidSettings(_))
        ));
    }

    proptest! {
        #[test]
        fn round_trip(
            y in prop::collection::vec(-100f64..100f64, 3),
            diag in prop::collection::vec(0.5f64..10f64, 3),
            offdiag in -0.05f64..0.05f64,
        ) {
            let cov = Mat::from_fn(3, 3, |i, j| if i == j { diag[i] } else { offdiag });
            let transform = Decorrelation::new(cov.as_ref(), &Default::default()).unwrap();
            let z = transform.apply(&y).unwrap();
            let back = transform.invert(&z).unwrap();
            for (a, b) in y.iter().zip(back.iter()) {
                prop_assert!((a - b).abs() <= 1e-8 * (1. + a.abs()));
            }
        }
    }
}
