//! Parameter distributions.
//!
//! The sampler works in unconstrained space. A prior describes the
//! distribution there, the proposal shape (its covariance) and how
//! to map parameters back into their physical, constrained ranges.

use std::f64::consts::PI;

use faer::{Mat, MatRef};
use itertools::{izip, Itertools};

use crate::{linalg::CovarianceFactor, CesError, Result};

/// Support of a single physical parameter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Constraint {
    #[default]
    Unbounded,
    BoundedBelow(f64),
    BoundedAbove(f64),
    Bounded(f64, f64),
}

impl Constraint {
    pub fn to_constrained(&self, u: f64) -> f64 {
        match *self {
            Constraint::Unbounded => u,
            Constraint::BoundedBelow(lower) => u.exp() + lower,
            Constraint::BoundedAbove(upper) => upper - u.exp(),
            Constraint::Bounded(lower, upper) => {
                // logistic, written to avoid overflow for large |u|
                if u >= 0. {
                    let e = (-u).exp();
                    (upper + lower * e) / (1. + e)
                } else {
                    let e = u.exp();
                    (upper * e + lower) / (e + 1.)
                }
            }
        }
    }

    pub fn to_unconstrained(&self, x: f64) -> f64 {
        match *self {
            Constraint::Unbounded => x,
            Constraint::BoundedBelow(lower) => (x - lower).ln(),
            Constraint::BoundedAbove(upper) => (upper - x).ln(),
            Constraint::Bounded(lower, upper) => ((x - lower) / (upper - x)).ln(),
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            Constraint::Bounded(lower, upper) if !(lower < upper) => Err(
                CesError::InvalidSettings(format!("empty interval [{}, {}]", lower, upper)),
            ),
            _ => Ok(()),
        }
    }
}

/// The prior distribution of the parameters.
pub trait Prior: Send + Sync {
    fn dim(&self) -> usize;

    fn names(&self) -> &[String];

    fn constraints(&self) -> &[Constraint];

    /// Covariance in unconstrained space. Used as the proposal shape.
    fn covariance(&self) -> MatRef<'_, f64>;

    /// Log density at a point in unconstrained space.
    ///
    /// Points outside of the support return `-inf`.
    fn log_density(&self, position: &[f64]) -> f64;

    fn to_constrained(&self, position: &[f64]) -> Vec<f64> {
        izip!(self.constraints(), position)
            .map(|(c, &u)| c.to_constrained(u))
            .collect()
    }

    fn to_unconstrained(&self, position: &[f64]) -> Vec<f64> {
        izip!(self.constraints(), position)
            .map(|(c, &x)| c.to_unconstrained(x))
            .collect()
    }
}

impl<P: Prior + ?Sized> Prior for &P {
    fn dim(&self) -> usize {
        (**self).dim()
    }

    fn names(&self) -> &[String] {
        (**self).names()
    }

    fn constraints(&self) -> &[Constraint] {
        (**self).constraints()
    }

    fn covariance(&self) -> MatRef<'_, f64> {
        (**self).covariance()
    }

    fn log_density(&self, position: &[f64]) -> f64 {
        (**self).log_density(position)
    }
}

/// Prior for one named parameter: a normal distribution in unconstrained space.
#[derive(Debug, Clone)]
pub struct ParameterPrior {
    pub name: String,
    pub mean: f64,
    pub std: f64,
    pub constraint: Constraint,
}

impl ParameterPrior {
    pub fn new(name: impl Into<String>, mean: f64, std: f64, constraint: Constraint) -> Self {
        Self {
            name: name.into(),
            mean,
            std,
            constraint,
        }
    }
}

/// A multivariate normal prior in unconstrained space, optionally
/// truncated to a box.
#[derive(Debug, Clone)]
pub struct GaussianPrior {
    names: Vec<String>,
    constraints: Vec<Constraint>,
    mean: Vec<f64>,
    covariance: Mat<f64>,
    factor: CovarianceFactor,
    bounds: Option<Vec<(f64, f64)>>,
}

impl GaussianPrior {
    /// Independent normal priors, one per parameter.
    pub fn from_parameters(params: impl IntoIterator<Item = ParameterPrior>) -> Result<Self> {
        let params = params.into_iter().collect_vec();
        for param in params.iter() {
            if !(param.std.is_finite() && param.std > 0.) {
                return Err(CesError::InvalidSettings(format!(
                    "prior std of {} must be positive, got {}",
                    param.name, param.std
                )));
            }
        }
        let n = params.len();
        let covariance = Mat::from_fn(n, n, |i, j| {
            if i == j {
                params[i].std * params[i].std
            } else {
                0.
            }
        });
        Self::new(
            params.iter().map(|p| p.name.clone()).collect(),
            params.iter().map(|p| p.constraint).collect(),
            params.iter().map(|p| p.mean).collect(),
            covariance,
        )
    }

    /// A correlated normal prior.
    pub fn new(
        names: Vec<String>,
        constraints: Vec<Constraint>,
        mean: Vec<f64>,
        covariance: Mat<f64>,
    ) -> Result<Self> {
        let dim = mean.len();
        for (what, len) in [("parameter names", names.len()), ("constraints", constraints.len())] {
            if len != dim {
                return Err(CesError::DimensionMismatch {
                    what,
                    expected: dim,
                    got: len,
                });
            }
        }
        if names.iter().duplicates().next().is_some() {
            return Err(CesError::InvalidSettings(
                "parameter names must be unique".into(),
            ));
        }
        constraints.iter().try_for_each(Constraint::validate)?;
        if covariance.nrows() != dim {
            return Err(CesError::DimensionMismatch {
                what: "prior covariance",
                expected: dim,
                got: covariance.nrows(),
            });
        }
        let factor = CovarianceFactor::new(covariance.as_ref(), "prior covariance")?;
        Ok(Self {
            names,
            constraints,
            mean,
            covariance,
            factor,
            bounds: None,
        })
    }

    /// Restrict the support to a box in unconstrained space.
    pub fn with_bounds(mut self, bounds: Vec<(f64, f64)>) -> Result<Self> {
        if bounds.len() != self.dim() {
            return Err(CesError::DimensionMismatch {
                what: "prior bounds",
                expected: self.dim(),
                got: bounds.len(),
            });
        }
        self.bounds = Some(bounds);
        Ok(self)
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    fn in_support(&self, position: &[f64]) -> bool {
        match self.bounds.as_ref() {
            None => true,
            Some(bounds) => izip!(bounds, position).all(|(&(lo, hi), &x)| lo <= x && x <= hi),
        }
    }
}

impl Prior for GaussianPrior {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn names(&self) -> &[String] {
        &self.names
    }

    fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    fn covariance(&self) -> MatRef<'_, f64> {
        self.covariance.as_ref()
    }

    fn log_density(&self, position: &[f64]) -> f64 {
        if position.len() != self.dim() || !position.iter().all(|x| x.is_finite()) {
            return f64::NEG_INFINITY;
        }
        if !self.in_support(position) {
            return f64::NEG_INFINITY;
        }
        let diff = izip!(position, &self.mean).map(|(x, m)| x - m).collect_vec();
        let n = self.dim() as f64;
        -0.5 * self.factor.quadratic_form(&diff) - 0.5 * self.factor.log_det() - 0.5 * n * (2. * PI).ln()
    }
}
