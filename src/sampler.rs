use anyhow::Context;
use faer::MatRef;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::info;

use crate::{
    chain::{Algorithm, ChainSettings, ChainState},
    decorrelate::{decorrelate, DecorrelatedObservation, DecorrelationSettings},
    likelihood::LikelihoodEvaluator,
    posterior::Posterior,
    prior::Prior,
    stepsize::{find_step_size, CalibratedStep, StepSizeSearchSettings},
    surrogate::Surrogate,
    CesError, Result,
};

/// Settings for surrogate-driven posterior sampling
#[derive(Debug, Clone, Copy)]
pub struct SamplerSettings {
    pub algorithm: Algorithm,
    /// Initial step size. If `calibrate_step` is set this is only the
    /// starting point of the step size search.
    pub step_size: f64,
    /// The number of transitions of the production chain.
    pub max_iterations: u64,
    /// The number of leading draws that are dropped.
    pub burn_in: u64,
    /// Search for a step size before sampling.
    pub calibrate_step: bool,
    pub step_search: StepSizeSearchSettings,
    pub decorrelation: DecorrelationSettings,
    pub num_chains: usize,
    pub seed: u64,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RandomWalkMetropolis,
            step_size: 0.5,
            max_iterations: 100_000,
            burn_in: 2_000,
            calibrate_step: true,
            step_search: StepSizeSearchSettings::default(),
            decorrelation: DecorrelationSettings::default(),
            num_chains: 1,
            seed: 0,
        }
    }
}

impl SamplerSettings {
    fn chain_settings(&self, step_size: f64, max_iterations: u64, burn_in: u64) -> ChainSettings {
        ChainSettings {
            algorithm: self.algorithm,
            step_size,
            max_iterations,
            burn_in,
        }
    }

    fn validate(&self) -> Result<()> {
        self.chain_settings(self.step_size, self.max_iterations, self.burn_in)
            .validate()?;
        self.decorrelation.validate()?;
        if self.calibrate_step {
            self.step_search.validate()?;
        }
        if self.num_chains == 0 {
            return Err(CesError::InvalidSettings(
                "num_chains must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// The outcome of sampling one chain.
#[derive(Debug, Clone)]
pub struct ChainResult {
    pub chain_id: u64,
    pub step_size: f64,
    /// `None` if the step size search was disabled.
    pub calibration: Option<CalibratedStep>,
    pub acceptance_ratio: f64,
    pub posterior: Posterior,
}

/// Drives step size calibration, the production run and posterior
/// extraction for one calibration target.
pub struct Sampler<P: Prior> {
    settings: SamplerSettings,
    observation: DecorrelatedObservation,
    evaluator: LikelihoodEvaluator,
    prior: P,
    initial: Box<[f64]>,
}

impl<P: Prior> Sampler<P> {
    /// Decorrelate the observation and validate all settings.
    ///
    /// The surrogate passed to the sampling methods must predict in the
    /// decorrelated basis, see [`Sampler::observation`].
    pub fn new(
        settings: SamplerSettings,
        observed: &[f64],
        noise_covariance: MatRef<'_, f64>,
        prior: P,
        initial: &[f64],
    ) -> Result<Self> {
        settings.validate()?;
        if initial.len() != prior.dim() {
            return Err(CesError::DimensionMismatch {
                what: "initial parameter",
                expected: prior.dim(),
                got: initial.len(),
            });
        }
        let observation = decorrelate(observed, noise_covariance, &settings.decorrelation)?;
        let evaluator = LikelihoodEvaluator::from_observation(&observation)?;
        Ok(Self {
            settings,
            observation,
            evaluator,
            prior,
            initial: initial.into(),
        })
    }

    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }

    pub fn observation(&self) -> &DecorrelatedObservation {
        &self.observation
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    fn rng(&self, stream: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.settings.seed);
        rng.set_stream(stream);
        rng
    }

    /// Random source of the step size probes of a chain.
    fn probe_rng(&self, chain_id: u64) -> ChaCha8Rng {
        self.rng(2 * chain_id)
    }

    /// Random source of the production run of a chain.
    fn chain_rng(&self, chain_id: u64) -> ChaCha8Rng {
        self.rng(2 * chain_id + 1)
    }

    /// A fresh chain starting at the initial parameter.
    pub fn new_chain(
        &self,
        chain_id: u64,
        step_size: f64,
        max_iterations: u64,
        burn_in: u64,
    ) -> Result<ChainState<&P, ChaCha8Rng>> {
        ChainState::new(
            self.evaluator.clone(),
            &self.prior,
            &self
                .settings
                .chain_settings(step_size, max_iterations, burn_in),
            &self.initial,
            self.chain_rng(chain_id),
        )
    }

    /// Run the step size search on a probe chain.
    pub fn find_step_size<S: Surrogate + ?Sized>(
        &self,
        surrogate: &mut S,
        chain_id: u64,
    ) -> Result<CalibratedStep> {
        let search = &self.settings.step_search;
        let mut chain = self.new_chain(chain_id, self.settings.step_size, search.probe_length, 0)?;
        find_step_size(&mut chain, surrogate, search, || self.probe_rng(chain_id))
    }

    /// Calibrate the step size (if enabled), run the production chain
    /// and extract its posterior.
    pub fn sample_chain<S: Surrogate + ?Sized>(
        &self,
        surrogate: &mut S,
        chain_id: u64,
    ) -> Result<ChainResult> {
        let calibration = if self.settings.calibrate_step {
            Some(self.find_step_size(surrogate, chain_id)?)
        } else {
            None
        };
        let step_size = calibration.map_or(self.settings.step_size, |c| c.step_size);

        let mut chain = self.new_chain(
            chain_id,
            step_size,
            self.settings.max_iterations,
            self.settings.burn_in,
        )?;
        chain.sample_to_end(surrogate)?;

        let acceptance_ratio = chain.acceptance_ratio();
        info!(
            chain = chain_id,
            step_size,
            acceptance_ratio,
            iterations = self.settings.max_iterations,
            "finished sampling"
        );

        Ok(ChainResult {
            chain_id,
            step_size,
            calibration,
            acceptance_ratio,
            posterior: Posterior::from_chain(&chain)?,
        })
    }

    /// Sample a single chain and return its posterior.
    pub fn sample<S: Surrogate + ?Sized>(&self, surrogate: &mut S) -> Result<Posterior> {
        Ok(self.sample_chain(surrogate, 0)?.posterior)
    }
}

/// Run `settings.num_chains` independent chains on a thread pool.
///
/// Each chain gets its own surrogate from `make_surrogate` and its own
/// random stream, so the results do not depend on the scheduling.
pub fn sample_parallel<P, S, F>(
    sampler: &Sampler<P>,
    make_surrogate: F,
    num_cores: usize,
) -> anyhow::Result<Vec<ChainResult>>
where
    P: Prior,
    S: Surrogate,
    F: Fn(u64) -> S + Sync,
{
    let pool = ThreadPoolBuilder::new()
        .num_threads(num_cores)
        .thread_name(|i| format!("ces-worker-{}", i))
        .build()
        .context("Could not start thread pool")?;

    let num_chains = sampler.settings().num_chains as u64;
    let results = pool.install(|| {
        (0..num_chains)
            .into_par_iter()
            .map(|chain_id| {
                let mut surrogate = make_surrogate(chain_id);
                sampler
                    .sample_chain(&mut surrogate, chain_id)
                    .with_context(|| format!("Chain {} failed", chain_id))
            })
            .collect::<anyhow::Result<Vec<_>>>()
    })?;
    Ok(results)
}
