//! Step size calibration for random walk proposals.
//!
//! Short probe chains are run with a candidate step size and the step is
//! halved or doubled until the acceptance rate of a probe falls into the
//! target band. When the search has both halved and doubled it is
//! oscillating around the target, and the step is instead damped by a
//! constant factor.

use rand::Rng;
use tracing::{info, warn};

use crate::{chain::ChainState, prior::Prior, surrogate::Surrogate, CesError, Result};

/// Settings for the step size search
#[derive(Debug, Clone, Copy)]
pub struct StepSizeSearchSettings {
    /// Number of transitions per probe.
    pub probe_length: u64,
    /// Give up after this many probes.
    pub max_trials: u64,
    /// Factor applied after the search has both shrunk and grown the step.
    pub damping: f64,
    /// Factor applied if the acceptance rate is too low.
    pub shrink: f64,
    /// Factor applied if the acceptance rate is too high.
    pub grow: f64,
    pub lower_accept: f64,
    pub upper_accept: f64,
}

impl Default for StepSizeSearchSettings {
    fn default() -> Self {
        Self {
            probe_length: 2000,
            max_trials: 20,
            damping: 0.75,
            shrink: 0.5,
            grow: 2.0,
            lower_accept: 0.15,
            upper_accept: 0.35,
        }
    }
}

impl StepSizeSearchSettings {
    pub(crate) fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(CesError::InvalidSettings(msg));
        if self.probe_length == 0 || self.max_trials == 0 {
            return invalid("probe_length and max_trials must be positive".into());
        }
        if !(self.damping > 0. && self.damping < 1.) {
            return invalid(format!("damping must be in (0, 1), got {}", self.damping));
        }
        if !(self.shrink > 0. && self.shrink < 1.) {
            return invalid(format!("shrink must be in (0, 1), got {}", self.shrink));
        }
        if !(self.grow > 1. && self.grow.is_finite()) {
            return invalid(format!("grow must be larger than 1, got {}", self.grow));
        }
        if !(0. <= self.lower_accept && self.lower_accept < self.upper_accept && self.upper_accept <= 1.)
        {
            return invalid(format!(
                "invalid acceptance band ({}, {})",
                self.lower_accept, self.upper_accept
            ));
        }
        Ok(())
    }
}

/// What the search does after a probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepDecision {
    /// The acceptance rate is in the target band.
    Accept,
    /// Rate too low, retry with the smaller step.
    Shrink(f64),
    /// Rate too high, retry with the larger step.
    Grow(f64),
    /// The search oscillated, retry with the damped step.
    Damp(f64),
}

/// The control loop state of the step size search.
#[derive(Debug, Clone)]
pub struct StepSizeSearch {
    settings: StepSizeSearchSettings,
    step_size: f64,
    has_grown: bool,
    has_shrunk: bool,
    trials: u64,
}

impl StepSizeSearch {
    pub fn new(settings: StepSizeSearchSettings, initial_step: f64) -> Result<Self> {
        settings.validate()?;
        if !(initial_step.is_finite() && initial_step > 0.) {
            return Err(CesError::InvalidStepSize(initial_step));
        }
        Ok(Self {
            settings,
            step_size: initial_step,
            has_grown: false,
            has_shrunk: false,
            trials: 0,
        })
    }

    pub fn step_size(&self) -> f64 {
        self.step_size
    }

    pub fn trials(&self) -> u64 {
        self.trials
    }

    /// Update the search with the acceptance rate of a finished probe.
    ///
    /// Fails if the probe did not converge and the trial budget is used up.
    pub fn observe(&mut self, acceptance: f64) -> Result<StepDecision> {
        self.trials += 1;
        let previous = self.step_size;

        let decision = if self.has_grown && self.has_shrunk {
            self.step_size *= self.settings.damping;
            self.has_grown = false;
            self.has_shrunk = false;
            StepDecision::Damp(self.step_size)
        } else if acceptance < self.settings.lower_accept {
            self.step_size *= self.settings.shrink;
            self.has_shrunk = true;
            StepDecision::Shrink(self.step_size)
        } else if acceptance > self.settings.upper_accept {
            self.step_size *= self.settings.grow;
            self.has_grown = true;
            StepDecision::Grow(self.step_size)
        } else {
            StepDecision::Accept
        };

        info!(
            trial = self.trials,
            acceptance,
            step_size = previous,
            ?decision,
            "finished step size probe"
        );

        if decision != StepDecision::Accept && self.trials >= self.settings.max_trials {
            warn!(
                trials = self.trials,
                step_size = previous,
                acceptance,
                "step size search did not converge"
            );
            return Err(CesError::StepSizeSearchFailed {
                trials: self.trials,
                step_size: previous,
                acceptance,
            });
        }
        Ok(decision)
    }
}

/// The result of a successful step size search.
#[derive(Debug, Clone, Copy)]
pub struct CalibratedStep {
    pub step_size: f64,
    pub acceptance_ratio: f64,
    pub trials: u64,
}

/// Search for a step size whose probe acceptance rate is in the target band.
///
/// The chain is reset with a fresh random source from `make_rng` before
/// each probe. On success the chain holds the accepted probe.
pub fn find_step_size<P, R, S, F>(
    chain: &mut ChainState<P, R>,
    surrogate: &mut S,
    settings: &StepSizeSearchSettings,
    mut make_rng: F,
) -> Result<CalibratedStep>
where
    P: Prior,
    R: Rng,
    S: Surrogate + ?Sized,
    F: FnMut() -> R,
{
    let mut search = StepSizeSearch::new(*settings, chain.step_size())?;
    if settings.probe_length > chain.max_iterations() {
        return Err(CesError::InvalidSettings(format!(
            "probe_length ({}) exceeds the chain length ({})",
            settings.probe_length,
            chain.max_iterations()
        )));
    }

    loop {
        chain.reset(search.step_size(), make_rng())?;
        chain.sample(surrogate, settings.probe_length)?;
        let acceptance = chain.acceptance_ratio();
        if search.observe(acceptance)? == StepDecision::Accept {
            return Ok(CalibratedStep {
                step_size: search.step_size(),
                acceptance_ratio: acceptance,
                trials: search.trials(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use faer::Mat;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{
        chain::ChainSettings,
        likelihood::LikelihoodEvaluator,
        prior::{Constraint, GaussianPrior, ParameterPrior},
        surrogate::{FnSurrogate, Prediction},
    };

    fn new_search() -> StepSizeSearch {
        StepSizeSearch::new(Default::default(), 1.).unwrap()
    }

    #[test]
    fn halves_and_doubles() {
        let mut search = new_search();
        assert_eq!(search.observe(0.01).unwrap(), StepDecision::Shrink(0.5));
        assert_eq!(search.observe(0.01).unwrap(), StepDecision::Shrink(0.25));
        assert_eq!(search.observe(0.2).unwrap(), StepDecision::Accept);
        assert_eq!(search.step_size(), 0.25);

        let mut search = new_search();
        assert_eq!(search.observe(0.9).unwrap(), StepDecision::Grow(2.));
        assert_eq!(search.observe(0.3).unwrap(), StepDecision::Accept);
        assert_eq!(search.trials(), 2);
    }

    #[test]
    fn damps_once_after_oscillation() {
        let mut search = new_search();
        assert_eq!(search.observe(0.05).unwrap(), StepDecision::Shrink(0.5));
        assert_eq!(search.observe(0.6).unwrap(), StepDecision::Grow(1.));
        // The damped correction applies even if this probe is in the band
        assert_eq!(search.observe(0.25).unwrap(), StepDecision::Damp(0.75));
        assert_eq!(search.observe(0.25).unwrap(), StepDecision::Accept);

        let mut search = new_search();
        let decisions: Vec<_> = [0.05, 0.6, 0.6, 0.6, 0.05, 0.05, 0.2]
            .iter()
            .map(|&a| search.observe(a).unwrap())
            .collect();
        let damps = decisions
            .iter()
            .filter(|d| matches!(d, StepDecision::Damp(_)))
            .count();
        assert_eq!(damps, 2);
        assert_eq!(decisions.last(), Some(&StepDecision::Accept));
    }

    #[test]
    fn fails_after_max_trials() {
        let settings = StepSizeSearchSettings {
            max_trials: 3,
            ..Default::default()
        };
        let mut search = StepSizeSearch::new(settings, 1.).unwrap();
        search.observe(0.01).unwrap();
        search.observe(0.01).unwrap();
        let err = search.observe(0.01).unwrap_err();
        assert!(matches!(
            err,
            CesError::StepSizeSearchFailed { trials: 3, .. }
        ));

        // Converging on the last allowed probe is fine
        let mut search = StepSizeSearch::new(settings, 1.).unwrap();
        search.observe(0.01).unwrap();
        search.observe(0.01).unwrap();
        assert_eq!(search.observe(0.2).unwrap(), StepDecision::Accept);
    }

    #[test]
    fn invalid_settings() {
        for settings in [
            StepSizeSearchSettings {
                probe_length: 0,
                ..Default::default()
            },
            StepSizeSearchSettings {
                damping: 1.5,
                ..Default::default()
            },
            StepSizeSearchSettings {
                lower_accept: 0.5,
                upper_accept: 0.4,
                ..Default::default()
            },
        ] {
            assert!(StepSizeSearch::new(settings, 1.).is_err());
        }
        assert!(StepSizeSearch::new(Default::default(), 0.).is_err());
    }

    #[test]
    fn finds_step_on_identity_surrogate() {
        let prior = GaussianPrior::from_parameters(
            (0..2).map(|i| ParameterPrior::new(format!("p{}", i), 0., 1., Constraint::Unbounded)),
        )
        .unwrap();
        let evaluator =
            LikelihoodEvaluator::new(vec![0.3, -0.2], Mat::<f64>::identity(2, 2).as_ref())
                .unwrap();
        let chain_settings = ChainSettings {
            step_size: 8.,
            max_iterations: 500,
            burn_in: 0,
            ..Default::default()
        };
        let settings = StepSizeSearchSettings {
            probe_length: 500,
            ..Default::default()
        };
        let mut chain = ChainState::new(
            evaluator,
            prior,
            &chain_settings,
            &[0., 0.],
            StdRng::seed_from_u64(1),
        )
        .unwrap();
        let mut surrogate = FnSurrogate::new(2, |x: &[f64]| {
            Ok(Prediction::new(x.to_vec(), Some(vec![0.01, 0.01])))
        });
        let found =
            find_step_size(&mut chain, &mut surrogate, &settings, || StdRng::seed_from_u64(7))
                .unwrap();
        assert!(found.acceptance_ratio > 0.15 && found.acceptance_ratio < 0.35);
        assert_eq!(chain.step_size(), found.step_size);
        assert!(found.trials <= settings.max_trials);
    }

    #[test]
    fn search_damps_oscillating_probes() {
        // Flat likelihood, so the chain targets the standard normal prior.
        // Its acceptance rate is about 0.30 at step 4, 0.50 at step 2 and
        // 0.37 at step 3.
        let prior = GaussianPrior::from_parameters([ParameterPrior::new(
            "a",
            0.,
            1.,
            Constraint::Unbounded,
        )])
        .unwrap();
        let evaluator =
            LikelihoodEvaluator::new(vec![1.], Mat::<f64>::identity(1, 1).as_ref()).unwrap();
        let chain_settings = ChainSettings {
            step_size: 4.,
            max_iterations: 20_000,
            burn_in: 0,
            ..Default::default()
        };
        let settings = StepSizeSearchSettings {
            probe_length: 20_000,
            lower_accept: 0.33,
            upper_accept: 0.43,
            ..Default::default()
        };
        let mut chain = ChainState::new(
            evaluator,
            prior,
            &chain_settings,
            &[0.],
            StdRng::seed_from_u64(1),
        )
        .unwrap();
        let mut surrogate =
            FnSurrogate::new(1, |_: &[f64]| Ok(Prediction::new(vec![1.], None)));

        let found =
            find_step_size(&mut chain, &mut surrogate, &settings, || StdRng::seed_from_u64(3))
                .unwrap();
        // shrink to 2, grow back to 4, damp to 3, accept
        assert_eq!(found.trials, 4);
        assert_eq!(found.step_size, 3.);
        assert!(found.acceptance_ratio > 0.33 && found.acceptance_ratio < 0.43);
    }

    #[test]
    fn probe_must_fit_in_chain() {
        let prior = GaussianPrior::from_parameters([ParameterPrior::new(
            "a",
            0.,
            1.,
            Constraint::Unbounded,
        )])
        .unwrap();
        let evaluator =
            LikelihoodEvaluator::new(vec![0.], Mat::<f64>::identity(1, 1).as_ref()).unwrap();
        let chain_settings = ChainSettings {
            max_iterations: 10,
            burn_in: 0,
            ..Default::default()
        };
        let mut chain =
            ChainState::new(evaluator, prior, &chain_settings, &[0.], StdRng::seed_from_u64(1))
                .unwrap();
        let mut surrogate = FnSurrogate::new(1, |x: &[f64]| Ok(Prediction::new(x.to_vec(), None)));
        let res = find_step_size(&mut chain, &mut surrogate, &Default::default(), || {
            StdRng::seed_from_u64(0)
        });
        assert!(matches!(res, Err(CesError::InvalidSettings(_))));
    }
}
