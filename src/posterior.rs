use std::sync::Arc;

use arrow::{
    array::{ArrayRef, Float64Array, StructArray},
    datatypes::{DataType, Field},
};
use faer::{Mat, Scale};
use itertools::{izip, Itertools};
use rand::Rng;

use crate::{
    chain::ChainState,
    prior::{Constraint, Prior},
    CesError, Result,
};

/// Samples from the posterior in unconstrained space, together with
/// the parameter names and constraints of the prior.
#[derive(Debug, Clone)]
pub struct Posterior {
    names: Vec<String>,
    constraints: Vec<Constraint>,
    draws: Vec<Box<[f64]>>,
}

/// Summary statistics of one marginal.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParameterSummary {
    pub mean: f64,
    pub std: f64,
    pub q05: f64,
    pub q50: f64,
    pub q95: f64,
}

impl Posterior {
    pub fn new(
        names: Vec<String>,
        constraints: Vec<Constraint>,
        draws: Vec<Box<[f64]>>,
    ) -> Result<Self> {
        if draws.is_empty() {
            return Err(CesError::EmptyPosterior);
        }
        let dim = names.len();
        if constraints.len() != dim {
            return Err(CesError::DimensionMismatch {
                what: "constraints",
                expected: dim,
                got: constraints.len(),
            });
        }
        if let Some(draw) = draws.iter().find(|draw| draw.len() != dim) {
            return Err(CesError::DimensionMismatch {
                what: "posterior draw",
                expected: dim,
                got: draw.len(),
            });
        }
        Ok(Self {
            names,
            constraints,
            draws,
        })
    }

    /// Drop the burn-in of a chain and keep the remaining draws.
    ///
    /// The chain must have been sampled to the end.
    pub fn from_chain<P: Prior, R: Rng>(chain: &ChainState<P, R>) -> Result<Self> {
        if !chain.is_finished() {
            return Err(CesError::ChainIncomplete {
                iteration: chain.iteration(),
                length: chain.chain().len() as u64,
            });
        }
        let draws = chain
            .chain()
            .iter()
            .skip(chain.burn_in() as usize)
            .cloned()
            .collect_vec();
        let prior = chain.prior();
        Self::new(prior.names().to_vec(), prior.constraints().to_vec(), draws)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn draws(&self) -> &[Box<[f64]>] {
        &self.draws
    }

    pub fn num_draws(&self) -> usize {
        self.draws.len()
    }

    pub fn dim(&self) -> usize {
        self.names.len()
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| CesError::UnknownParameter(name.to_string()))
    }

    /// All draws of one parameter, in unconstrained space.
    pub fn marginal(&self, name: &str) -> Result<Vec<f64>> {
        let idx = self.index_of(name)?;
        Ok(self.draws.iter().map(|draw| draw[idx]).collect())
    }

    /// All draws of one parameter, mapped into its constrained range.
    pub fn constrained_marginal(&self, name: &str) -> Result<Vec<f64>> {
        let idx = self.index_of(name)?;
        let constraint = self.constraints[idx];
        Ok(self
            .draws
            .iter()
            .map(|draw| constraint.to_constrained(draw[idx]))
            .collect())
    }

    /// The draws mapped into the constrained parameter space.
    pub fn constrained_draws(&self) -> Vec<Box<[f64]>> {
        self.draws
            .iter()
            .map(|draw| {
                izip!(&self.constraints, draw.iter())
                    .map(|(c, &u)| c.to_constrained(u))
                    .collect()
            })
            .collect()
    }

    pub fn mean(&self) -> Vec<f64> {
        let n = self.num_draws() as f64;
        let mut mean = vec![0f64; self.dim()];
        for draw in self.draws.iter() {
            mean.iter_mut().zip(draw.iter()).for_each(|(m, x)| *m += x);
        }
        mean.iter_mut().for_each(|m| *m /= n);
        mean
    }

    /// Sample covariance with `n - 1` normalization.
    ///
    /// All zero if there is only a single draw.
    pub fn covariance(&self) -> Mat<f64> {
        let dim = self.dim();
        let n = self.num_draws();
        if n < 2 {
            return Mat::zeros(dim, dim);
        }
        let mean = self.mean();
        let centered = Mat::from_fn(n, dim, |i, j| self.draws[i][j] - mean[j]);
        let mut cov = centered.transpose() * &centered;
        cov *= Scale(((n - 1) as f64).recip());
        cov
    }

    pub fn summary(&self) -> Vec<ParameterSummary> {
        let cov = self.covariance();
        let mean = self.mean();
        (0..self.dim())
            .map(|i| {
                let sorted = self
                    .draws
                    .iter()
                    .map(|draw| draw[i])
                    .sorted_by(f64::total_cmp)
                    .collect_vec();
                ParameterSummary {
                    mean: mean[i],
                    std: cov[(i, i)].sqrt(),
                    q05: quantile(&sorted, 0.05),
                    q50: quantile(&sorted, 0.5),
                    q95: quantile(&sorted, 0.95),
                }
            })
            .collect()
    }

    /// Export the draws as an Arrow struct array with one `Float64`
    /// column per parameter.
    pub fn to_arrow(&self) -> StructArray {
        let fields = self
            .names
            .iter()
            .map(|name| Field::new(name.as_str(), DataType::Float64, false))
            .collect_vec();
        let arrays = (0..self.dim())
            .map(|i| {
                let values = self.draws.iter().map(|draw| draw[i]).collect_vec();
                Arc::new(Float64Array::from(values)) as ArrayRef
            })
            .collect_vec();
        StructArray::new(fields.into(), arrays, None)
    }
}

/// Linear interpolation between order statistics.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let pos = q * (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f64;
            sorted[lo] + frac * (sorted[hi] - sorted[lo])
        }
    }
}
