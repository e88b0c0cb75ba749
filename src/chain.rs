use std::{fmt, str::FromStr};

use rand::Rng;
use tracing::debug;

use crate::{
    likelihood::LikelihoodEvaluator,
    linalg::CovarianceFactor,
    prior::Prior,
    surrogate::{predict_point, Prediction, Surrogate},
    CesError, Result,
};

/// The transition rule of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum Algorithm {
    /// Gaussian random walk proposals shaped by the prior covariance.
    #[default]
    RandomWalkMetropolis,
}

impl FromStr for Algorithm {
    type Err = CesError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rwm" | "random-walk-metropolis" => Ok(Algorithm::RandomWalkMetropolis),
            other => Err(CesError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Algorithm::RandomWalkMetropolis => write!(f, "rwm"),
        }
    }
}

/// Settings of a single chain
#[derive(Debug, Clone, Copy)]
pub struct ChainSettings {
    pub algorithm: Algorithm,
    /// Scale of the random walk relative to the prior covariance.
    pub step_size: f64,
    /// Number of transitions. The stored chain has one more entry,
    /// the initial position.
    pub max_iterations: u64,
    /// Number of leading draws that are dropped from the posterior.
    pub burn_in: u64,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RandomWalkMetropolis,
            step_size: 1.,
            max_iterations: 10_000,
            burn_in: 1_000,
        }
    }
}

impl ChainSettings {
    pub(crate) fn validate(&self) -> Result<()> {
        check_step_size(self.step_size)?;
        if self.max_iterations == 0 {
            return Err(CesError::InvalidSettings(
                "max_iterations must be at least 1".into(),
            ));
        }
        if self.burn_in > self.max_iterations {
            return Err(CesError::InvalidSettings(format!(
                "burn_in ({}) must not exceed max_iterations ({})",
                self.burn_in, self.max_iterations
            )));
        }
        Ok(())
    }
}

fn check_step_size(step_size: f64) -> Result<()> {
    if step_size.is_finite() && step_size > 0. {
        Ok(())
    } else {
        Err(CesError::InvalidStepSize(step_size))
    }
}

/// The outcome of a single transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub accepted: bool,
    /// Log posterior of the evaluated candidate.
    pub log_posterior: f64,
    /// Metropolis acceptance probability (not clamped to 1).
    pub accept_prob: f64,
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Progress {
    pub iteration: u64,
    pub accepted: u64,
    pub step_size: f64,
    pub acceptance_ratio: f64,
}

/// The state of one Markov chain.
///
/// Every call to [`ChainState::step`] evaluates the parameter that was
/// proposed by the previous call (initially the starting position),
/// records the accepted or repeated state, and proposes the next
/// candidate. The surrogate prediction passed to `step` must therefore
/// belong to [`ChainState::current`].
pub struct ChainState<P: Prior, R: Rng> {
    evaluator: LikelihoodEvaluator,
    prior: P,
    proposal: CovarianceFactor,
    algorithm: Algorithm,
    step_size: f64,
    burn_in: u64,
    current: Box<[f64]>,
    chain: Vec<Box<[f64]>>,
    reference_log_posterior: Option<f64>,
    /// Next slot in `chain` to write to.
    iteration: u64,
    accepted: u64,
    rng: R,
}

impl<P: Prior, R: Rng> ChainState<P, R> {
    pub fn new(
        evaluator: LikelihoodEvaluator,
        prior: P,
        settings: &ChainSettings,
        initial: &[f64],
        rng: R,
    ) -> Result<Self> {
        settings.validate()?;
        if initial.len() != prior.dim() {
            return Err(CesError::DimensionMismatch {
                what: "initial parameter",
                expected: prior.dim(),
                got: initial.len(),
            });
        }
        if !initial.iter().all(|x| x.is_finite()) {
            return Err(CesError::InvalidSettings(
                "initial parameter must be finite".into(),
            ));
        }
        let len = usize::try_from(settings.max_iterations)
            .ok()
            .and_then(|n| n.checked_add(1))
            .ok_or_else(|| {
                CesError::InvalidSettings(format!(
                    "max_iterations ({}) is too large",
                    settings.max_iterations
                ))
            })?;
        let proposal = CovarianceFactor::new(prior.covariance(), "prior covariance")?;

        let mut chain = vec![vec![0f64; initial.len()].into_boxed_slice(); len];
        chain[0].copy_from_slice(initial);

        debug!(
            algorithm = %settings.algorithm,
            step_size = settings.step_size,
            max_iterations = settings.max_iterations,
            dim = initial.len(),
            "created chain"
        );

        Ok(Self {
            evaluator,
            prior,
            proposal,
            algorithm: settings.algorithm,
            step_size: settings.step_size,
            burn_in: settings.burn_in,
            current: initial.into(),
            chain,
            reference_log_posterior: None,
            iteration: 1,
            accepted: 0,
            rng,
        })
    }

    /// Perform one transition, given the surrogate prediction at `self.current()`.
    pub fn step(&mut self, prediction: &Prediction) -> Result<Transition> {
        if self.is_finished() {
            return Err(CesError::ChainExhausted(self.max_iterations()));
        }
        match self.algorithm {
            Algorithm::RandomWalkMetropolis => self.random_walk_step(prediction),
        }
    }

    fn random_walk_step(&mut self, prediction: &Prediction) -> Result<Transition> {
        let log_posterior =
            self.evaluator
                .log_posterior(&self.prior, &self.current, prediction)?;

        let accept_prob = match self.reference_log_posterior {
            Some(reference) => (log_posterior - reference).exp(),
            // Anchor the first acceptance probability at exactly one half.
            None if log_posterior.is_finite() => {
                let reference = log_posterior - 0.5f64.ln();
                self.reference_log_posterior = Some(reference);
                (log_posterior - reference).exp()
            }
            None => 0.,
        };

        let draw: f64 = self.rng.random();
        let accepted = draw < accept_prob;

        let idx = self.iteration as usize;
        if accepted {
            self.chain[idx].copy_from_slice(&self.current);
            self.reference_log_posterior = Some(log_posterior);
            self.accepted += 1;
        } else {
            let (head, tail) = self.chain.split_at_mut(idx);
            tail[0].copy_from_slice(&head[idx - 1]);
        }

        self.proposal.sample_into(
            &mut self.rng,
            &self.chain[idx],
            self.step_size,
            &mut self.current,
        );
        self.iteration += 1;

        Ok(Transition {
            accepted,
            log_posterior,
            accept_prob,
        })
    }

    /// Run `iterations` transitions, querying the surrogate at every candidate.
    pub fn sample<S: Surrogate + ?Sized>(
        &mut self,
        surrogate: &mut S,
        iterations: u64,
    ) -> Result<()> {
        for _ in 0..iterations {
            let prediction = predict_point(surrogate, &self.current)?;
            self.step(&prediction)?;
        }
        Ok(())
    }

    /// Run transitions until the chain is full.
    pub fn sample_to_end<S: Surrogate + ?Sized>(&mut self, surrogate: &mut S) -> Result<()> {
        let remaining = self.chain.len() as u64 - self.iteration;
        self.sample(surrogate, remaining)
    }

    /// Rewind the chain to its initial position with a new step size and
    /// random source.
    pub fn reset(&mut self, step_size: f64, rng: R) -> Result<()> {
        check_step_size(step_size)?;
        self.step_size = step_size;
        self.rng = rng;
        self.iteration = 1;
        self.accepted = 0;
        self.reference_log_posterior = None;
        self.chain
            .iter_mut()
            .skip(1)
            .for_each(|draw| draw.fill(0.));
        self.current.copy_from_slice(&self.chain[0]);

        debug!(step_size, "reset chain");
        Ok(())
    }

    /// Fraction of accepted proposals, `accepted / iteration`.
    pub fn acceptance_ratio(&self) -> f64 {
        self.accepted as f64 / self.iteration as f64
    }

    pub fn is_finished(&self) -> bool {
        self.iteration as usize >= self.chain.len()
    }

    pub fn progress(&self) -> Progress {
        Progress {
            iteration: self.iteration,
            accepted: self.accepted,
            step_size: self.step_size,
            acceptance_ratio: self.acceptance_ratio(),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn burn_in(&self) -> u64 {
        self.burn_in
    }

    pub fn max_iterations(&self) -> u64 {
        self.chain.len() as u64 - 1
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn current(&self) -> &[f64] {
        &self.current
    }

    pub fn chain(&self) -> &[Box<[f64]>] {
        &self.chain
    }

    pub fn reference_log_posterior(&self) -> Option<f64> {
        self.reference_log_posterior
    }

    pub fn observed(&self) -> &[f64] {
        self.evaluator.observed()
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    pub fn dim(&self) -> usize {
        self.current.len()
    }
}
