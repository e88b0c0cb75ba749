//! Surrogate-driven posterior sampling for calibrate-emulate-sample workflows.
//!
//! Expensive forward models are replaced by a cheap surrogate (for example
//! a Gaussian process emulator). This crate samples the posterior of the
//! model parameters with a random-walk Metropolis chain that queries the
//! surrogate instead of the forward model, and tunes the random walk step
//! size until the acceptance rate is in a target band.
//!
//! ```no_run
//! use ces_rs::{
//!     Constraint, FnSurrogate, GaussianPrior, ParameterPrior, Prediction, Sampler,
//!     SamplerSettings,
//! };
//! use faer::Mat;
//!
//! # fn main() -> anyhow::Result<()> {
//! let prior = GaussianPrior::from_parameters([
//!     ParameterPrior::new("a", 0., 1., Constraint::Unbounded),
//!     ParameterPrior::new("b", 0., 1., Constraint::BoundedBelow(0.)),
//! ])?;
//! let noise = Mat::<f64>::identity(2, 2);
//! let sampler = Sampler::new(
//!     SamplerSettings::default(),
//!     &[0.5, 1.2],
//!     noise.as_ref(),
//!     prior,
//!     &[0., 0.],
//! )?;
//! let mut surrogate = FnSurrogate::new(2, |x: &[f64]| {
//!     Ok(Prediction::new(x.to_vec(), Some(vec![0.1, 0.1])))
//! });
//! let posterior = sampler.sample(&mut surrogate)?;
//! println!("{:?}", posterior.mean());
//! # Ok(())
//! # }
//! ```

pub(crate) mod chain;
pub(crate) mod decorrelate;
pub(crate) mod error;
pub(crate) mod likelihood;
pub(crate) mod linalg;
pub(crate) mod math;
pub(crate) mod posterior;
pub(crate) mod prior;
pub(crate) mod sampler;
pub(crate) mod stepsize;
pub(crate) mod surrogate;

pub use chain::{Algorithm, ChainSettings, ChainState, Progress, Transition};
pub use decorrelate::{
    decorrelate, DecorrelatedObservation, Decorrelation, DecorrelationSettings,
};
pub use error::{CesError, Result};
pub use likelihood::LikelihoodEvaluator;
pub use linalg::CovarianceFactor;
pub use posterior::{ParameterSummary, Posterior};
pub use prior::{Constraint, GaussianPrior, ParameterPrior, Prior};
pub use sampler::{sample_parallel, ChainResult, Sampler, SamplerSettings};
pub use stepsize::{
    find_step_size, CalibratedStep, StepDecision, StepSizeSearch, StepSizeSearchSettings,
};
pub use surrogate::{predict_point, BatchPrediction, FnSurrogate, Prediction, Surrogate};
