/*!
The whole fitting pipeline in one call.

1. calibrate the Gibbs step sizes on all walkers,
2. run the trial mode with Gibbs moves only,
3. run the full mode with Gibbs and differential-evolution moves, buffered
   from the trial run,
4. summarize the full run's merged chain.

A mode that exhausts its loops without converging does not stop the pipeline;
its status is kept in the returned [`FitOutcome`].
*/

use log::{info, warn};

use crate::calibrate::{calibrate_walkers, Calibration};
use crate::config::{RunConfig, SamplingMode};
use crate::error::Result;
use crate::likelihood::LogPosterior;
use crate::results::ResultsTable;
use crate::sampler::{draw_seeds, initial_seed, Sampler};
use crate::state::FitState;

#[derive(Debug, Clone)]
pub struct FitOutcome {
    pub calibration: Calibration,
    pub trial: Sampler,
    pub full: Sampler,
    pub results: ResultsTable,
}

impl FitOutcome {
    /// True when the full run converged.
    pub fn converged(&self) -> bool {
        self.full.converged()
    }
}

pub fn run_fit<L>(mut state: FitState, likelihood: &L, config: &RunConfig) -> Result<FitOutcome>
where
    L: LogPosterior + ?Sized,
{
    config.validate()?;
    // one seed per stage
    let mut master = initial_seed(config.seed);
    let stage_seeds = draw_seeds(&mut master, 3);
    let staged = |seed: u64| RunConfig {
        seed: Some(seed),
        ..config.clone()
    };

    info!("calibrating step sizes for {} free values", state.n_free());
    let calibration = calibrate_walkers(&mut state, likelihood, &staged(stage_seeds[0]))?;

    let mut trial = Sampler::new(state.clone(), staged(stage_seeds[1]), SamplingMode::Trial)?;
    let trial_status = trial.run(likelihood)?;
    info!("trial run finished: {trial_status:?}");

    let mut full = Sampler::new(state, staged(stage_seeds[2]), SamplingMode::Full)?;
    let full_status = full.run_buffered(likelihood, &trial)?;
    info!("full run finished: {full_status:?}");
    if !full.converged() {
        warn!("reporting results of an unconverged run");
    }

    let results = ResultsTable::from_sampler(&full, 0)?;
    results.log_summary(config.result_mode, None)?;
    Ok(FitOutcome {
        calibration,
        trial,
        full,
        results,
    })
}
