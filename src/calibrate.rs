/*!
Step-size calibration.

Gibbs step sizes are tuned until every free entry's acceptance rate lies in
the configured window. Each calibration loop runs fresh chains from the
current starting state, measures per-entry acceptance, and multiplies every
step size by

```text
((0.75 * (rate + delta)) / (0.25 * (1 - rate + delta))) ^ exponent
```

which is above one for rates above 0.25 and below one otherwise. The next loop
restarts from the highest-posterior row seen so far. Calibration that reaches
the loop cap stops with the last step sizes and a warning; it is not an error.
*/

use log::{info, warn};
use ndarray::{Array1, Zip};

use crate::chain::{merge_all, run_chain, Chain, ChainSettings, Progress};
use crate::config::{CalibrationConfig, RunConfig};
use crate::error::{Error, Result};
use crate::likelihood::LogPosterior;
use crate::proposal::Mover;
use crate::sampler::{draw_seeds, initial_seed, run_batch, worker_pool, BatchReport};
use crate::stats::{acceptance_rates, AcceptanceRates};
use crate::state::FitState;

/// Outcome of a calibration.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub step_size: Array1<f64>,
    /// Rates measured with the final step sizes.
    pub rates: AcceptanceRates,
    pub loops: usize,
    pub converged: bool,
}

/// Multiplier applied to a step size whose acceptance rate is `rate`.
pub fn correction_factor(rate: f64, delta: f64, exponent: f64) -> f64 {
    ((0.75 * (rate + delta)) / (0.25 * (1.0 - rate + delta))).powf(exponent)
}

/// Rescales every step size from its measured rate. Entries that were never
/// proposed keep their step size, as do entries whose factor is zero or not
/// finite.
pub fn rescale(step_size: &mut Array1<f64>, rates: &AcceptanceRates, cfg: &CalibrationConfig) {
    Zip::from(step_size)
        .and(&rates.per_param)
        .for_each(|beta, &rate| {
            if !rate.is_finite() {
                return;
            }
            let factor = correction_factor(rate, cfg.delta, cfg.exponent);
            if factor.is_finite() && factor > 0.0 {
                *beta *= factor;
            }
        });
}

/// Calibrates with a single walker, seeded from `seed`.
///
/// On return `state` carries the calibrated step sizes and sits at the
/// best state visited.
pub fn calibrate<L>(
    state: &mut FitState,
    likelihood: &L,
    cfg: &CalibrationConfig,
    seed: u64,
) -> Result<Calibration>
where
    L: LogPosterior + ?Sized,
{
    check(state, cfg)?;
    let mut master = seed;
    calibration_loop(state, cfg, |start| {
        let seed = draw_seeds(&mut master, 1)[0];
        let settings = ChainSettings {
            n_iterations: cfg.n_iterations,
            mover: Mover::Gibbs,
            seed,
            ..ChainSettings::default()
        };
        let mut walker = start.clone();
        let chain = run_chain(&mut walker, likelihood, &settings, Progress::Silent)?;
        Ok(chain.tail(cfg.burnin))
    })
}

/// Calibrates on the merged chains of `run.walkers` walkers per loop, run on
/// a pool of `run.worker_threads()` threads.
pub fn calibrate_walkers<L>(state: &mut FitState, likelihood: &L, run: &RunConfig) -> Result<Calibration>
where
    L: LogPosterior + ?Sized,
{
    let cfg = &run.calibration;
    check(state, cfg)?;
    let pool = worker_pool(run.worker_threads())?;
    let mut master = initial_seed(run.seed);
    let report = BatchReport {
        mode: run.progress,
        group: "calibration",
        every: run.report_every(cfg.n_iterations),
    };
    calibration_loop(state, cfg, |start| {
        let seeds = draw_seeds(&mut master, run.walkers);
        let settings = ChainSettings {
            n_iterations: cfg.n_iterations,
            mover: Mover::Gibbs,
            ..ChainSettings::default()
        };
        let starts = vec![start.clone(); run.walkers];
        let results = run_batch(&pool, starts, &seeds, likelihood, &settings, report)?;
        let tails: Vec<Chain> = results.iter().map(|(_, c)| c.tail(cfg.burnin)).collect();
        merge_all(&tails)
    })
}

fn check(state: &FitState, cfg: &CalibrationConfig) -> Result<()> {
    if state.n_free() == 0 {
        return Err(Error::Config("no parameter is fitted".into()));
    }
    cfg.validate()
}

fn calibration_loop<F>(state: &mut FitState, cfg: &CalibrationConfig, mut sample: F) -> Result<Calibration>
where
    F: FnMut(&FitState) -> Result<Chain>,
{
    let mut best: Option<(f64, Array1<f64>)> = None;
    let mut loops = 0;
    loop {
        loops += 1;
        let chain = sample(state)?;
        let rates = acceptance_rates(&chain.moves, state.n_free());
        if let Some(row) = chain.best_row() {
            let ll = chain.log_likelihoods.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if best.as_ref().map_or(true, |(b, _)| ll > *b) {
                best = Some((ll, row.to_owned()));
            }
        }
        info!(
            "calibration loop {loops}/{}: acceptance {}",
            cfg.max_loops,
            format_rates(&rates)
        );

        let converged = rates.all_within(cfg.acceptance_low, cfg.acceptance_high);
        if converged || loops >= cfg.max_loops {
            if !converged {
                warn!(
                    "step sizes not calibrated after {loops} loops; continuing with the last scale"
                );
            }
            if let Some((_, row)) = &best {
                state.set_free_from_row(row.view())?;
            }
            return Ok(Calibration {
                step_size: state.step_size().to_owned(),
                rates,
                loops,
                converged,
            });
        }

        let mut step = state.step_size().to_owned();
        rescale(&mut step, &rates, cfg);
        state.set_step_size(step)?;
        if let Some((_, row)) = &best {
            state.set_free_from_row(row.view())?;
        }
    }
}

fn format_rates(rates: &AcceptanceRates) -> String {
    rates
        .per_param
        .iter()
        .map(|r| format!("{r:.3}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParamConfig, ProgressMode};
    use crate::data::InputData;
    use crate::priors::{PriorRegistry, PriorSpec};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, Array2};
    use std::sync::Arc;

    fn wide_state() -> FitState {
        let data = InputData::from_flux(
            arr1(&[0.0]).view(),
            arr1(&[1.0]).view(),
            Array2::zeros((1, 1)),
            Array2::ones((1, 1)),
        )
        .unwrap();
        // default step is a third of the prior range, far too wide
        let params = vec![ParamConfig::fitted("x", 0.0, PriorSpec::uniform(-100.0, 100.0))];
        FitState::new(&params, Arc::new(data), &PriorRegistry::default()).unwrap()
    }

    fn unit_gaussian(state: &FitState) -> f64 {
        let x = state.free_vector()[0];
        crate::likelihood::log_prior(state) - 0.5 * x * x
    }

    fn cfg() -> CalibrationConfig {
        CalibrationConfig {
            n_iterations: 1000,
            ..CalibrationConfig::default()
        }
    }

    #[test]
    fn factor_is_one_near_quarter_acceptance() {
        assert_abs_diff_eq!(correction_factor(0.25, 0.0, 0.5), 1.0, epsilon = 1e-12);
        assert!(correction_factor(0.05, 0.01, 0.5) < 1.0);
        assert!(correction_factor(0.9, 0.01, 0.5) > 1.0);
        // finite at both ends
        assert!(correction_factor(0.0, 0.01, 0.5).is_finite());
        assert!(correction_factor(1.0, 0.01, 0.5).is_finite());
        // a smaller exponent corrects more gently
        assert!(correction_factor(0.05, 0.01, 0.25) > correction_factor(0.05, 0.01, 0.5));
    }

    #[test]
    fn rescale_skips_unproposed_entries() {
        let rates = AcceptanceRates {
            per_param: arr1(&[0.05, f64::NAN]),
            proposed: arr1(&[10, 0]),
            global: 0.05,
            vector_jump: None,
        };
        let mut step = arr1(&[1.0, 1.0]);
        rescale(&mut step, &rates, &cfg());
        assert!(step[0] < 1.0);
        assert_eq!(step[1], 1.0);
    }

    #[test]
    fn rescale_keeps_steps_finite_at_extreme_rates() {
        let rates = |r: f64| AcceptanceRates {
            per_param: arr1(&[r]),
            proposed: arr1(&[10]),
            global: r,
            vector_jump: None,
        };
        let zero_delta = CalibrationConfig {
            delta: 0.0,
            ..cfg()
        };
        let mut step = arr1(&[1.0]);
        rescale(&mut step, &rates(0.0), &zero_delta);
        rescale(&mut step, &rates(1.0), &zero_delta);
        assert_eq!(step[0], 1.0);

        rescale(&mut step, &rates(0.0), &cfg());
        rescale(&mut step, &rates(1.0), &cfg());
        assert!(step[0].is_finite() && step[0] > 0.0);
    }

    #[test]
    fn zero_delta_is_refused() {
        let mut s = wide_state();
        let cfg = CalibrationConfig {
            delta: 0.0,
            ..cfg()
        };
        assert!(matches!(
            calibrate(&mut s, &unit_gaussian, &cfg, 3),
            Err(Error::Config(_))
        ));
        assert!(s.step_size().iter().all(|b| b.is_finite()));
    }

    #[test]
    fn single_walker_reaches_window_in_most_trials() {
        let trials = 40;
        let hits = (0..trials)
            .filter(|&t| {
                let mut s = wide_state();
                let c = calibrate(&mut s, &unit_gaussian, &cfg(), 1000 + t).unwrap();
                c.converged && c.rates.all_within(0.2, 0.4)
            })
            .count();
        assert!(hits * 100 >= trials as usize * 95, "{hits}/{trials} trials calibrated");
    }

    #[test]
    fn walkers_calibrate_and_restart_from_best() {
        let mut s = wide_state();
        s.set_free_value(0, 40.0);
        let run = RunConfig {
            walkers: 3,
            seed: Some(5),
            calibration: cfg(),
            progress: ProgressMode::Silent,
            ..RunConfig::default()
        };
        let c = calibrate_walkers(&mut s, &unit_gaussian, &run).unwrap();
        assert!(c.converged);
        assert_eq!(s.step_size(), c.step_size);
        assert!(c.step_size[0] < 200.0 / 3.0);
        assert!(s.free_vector()[0].abs() < 5.0);
    }

    #[test]
    fn loop_cap_is_not_an_error() {
        let mut s = wide_state();
        let cfg = CalibrationConfig {
            max_loops: 1,
            ..cfg()
        };
        let c = calibrate(&mut s, &unit_gaussian, &cfg, 9).unwrap();
        assert!(!c.converged);
        assert_eq!(c.loops, 1);
    }
}
