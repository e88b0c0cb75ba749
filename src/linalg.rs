//! Dense covariance helpers on top of faer.

use faer::{
    linalg::triangular_solve::solve_lower_triangular_in_place, Col, ColRef, Mat, MatRef, Par,
    Side,
};
use itertools::izip;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{CesError, Result};

const SYMMETRY_TOL: f64 = 1e-8;

fn mat_all_finite(mat: &MatRef<f64>) -> bool {
    let mut ok = true;
    faer::zip!(mat).for_each(|faer::unzip!(val)| ok &= val.is_finite());
    ok
}

fn mat_is_symmetric(mat: &MatRef<f64>) -> bool {
    let transposed = mat.transpose();
    let mut ok = true;
    faer::zip!(mat, &transposed).for_each(|faer::unzip!(a, b)| {
        ok &= (a - b).abs() <= SYMMETRY_TOL * a.abs().max(b.abs()).max(1.)
    });
    ok
}

/// Check that `cov` is a finite, square and symmetric matrix of size `dim`.
pub(crate) fn check_covariance(cov: MatRef<'_, f64>, dim: usize, what: &'static str) -> Result<()> {
    if cov.nrows() != cov.ncols() {
        return Err(CesError::MalformedCovariance(format!(
            "{} is not square ({}x{})",
            what,
            cov.nrows(),
            cov.ncols()
        )));
    }
    if cov.nrows() != dim {
        return Err(CesError::DimensionMismatch {
            what,
            expected: dim,
            got: cov.nrows(),
        });
    }
    if !mat_all_finite(&cov) {
        return Err(CesError::MalformedCovariance(format!(
            "{} contains non-finite values",
            what
        )));
    }
    if !mat_is_symmetric(&cov) {
        return Err(CesError::MalformedCovariance(format!(
            "{} is not symmetric",
            what
        )));
    }
    Ok(())
}

/// Cholesky factor `L` of a covariance matrix `Σ = L Lᵗ`.
///
/// Used both for the full-covariance likelihood and for drawing
/// correlated Gaussian proposals.
#[derive(Debug, Clone)]
pub struct CovarianceFactor {
    lower: Mat<f64>,
    log_det: f64,
}

impl CovarianceFactor {
    pub fn new(cov: MatRef<'_, f64>, what: &'static str) -> Result<Self> {
        check_covariance(cov, cov.nrows(), what)?;
        let llt = cov.llt(Side::Lower).map_err(|_| {
            CesError::MalformedCovariance(format!("{} is not positive definite", what))
        })?;
        let lower = llt.L().to_owned();
        let log_det = 2. * (0..lower.nrows()).map(|i| lower[(i, i)].ln()).sum::<f64>();
        if !log_det.is_finite() {
            return Err(CesError::MalformedCovariance(format!(
                "{} is numerically singular",
                what
            )));
        }
        Ok(Self { lower, log_det })
    }

    pub fn dim(&self) -> usize {
        self.lower.nrows()
    }

    /// `ln det Σ`
    pub fn log_det(&self) -> f64 {
        self.log_det
    }

    pub fn lower(&self) -> MatRef<'_, f64> {
        self.lower.as_ref()
    }

    /// Compute `xᵗ Σ⁻¹ x` by solving `L z = x` and returning `zᵗ z`.
    pub fn quadratic_form(&self, x: &[f64]) -> f64 {
        assert!(x.len() == self.dim());

        let mut z = ColRef::from_slice(x).to_owned();
        solve_lower_triangular_in_place(self.lower.as_ref(), z.as_mat_mut(), Par::Seq);
        z.squared_norm_l2()
    }

    /// Write `mean + scale · L z` with `z ~ N(0, I)` into `out`.
    ///
    /// This is a draw from `N(mean, scale² Σ)`.
    pub fn sample_into<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        mean: &[f64],
        scale: f64,
        out: &mut [f64],
    ) {
        let n = self.dim();
        assert!(mean.len() == n);
        assert!(out.len() == n);

        let z: Col<f64> = Col::from_fn(n, |_| rng.sample(StandardNormal));
        let lz = self.lower.as_ref() * &z;
        izip!(out.iter_mut(), mean, lz.iter()).for_each(|(out, &mean, &lz)| {
            *out = lz.mul_add(scale, mean);
        });
    }
}
