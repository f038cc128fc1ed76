//! Saving and restoring states and samplers through files.

use std::sync::Arc;

use ndarray::{arr1, Array1, Array2};
use tempfile::{tempdir, NamedTempFile};

use tfit_mcmc::config::{ModeConfig, ParamConfig, ProgressMode, RunConfig, SamplingMode};
use tfit_mcmc::data::InputData;
use tfit_mcmc::error::Error;
use tfit_mcmc::likelihood::log_prior;
use tfit_mcmc::priors::{PriorRegistry, PriorSpec};
use tfit_mcmc::sampler::{RunStatus, Sampler};
use tfit_mcmc::state::FitState;

fn template() -> FitState {
    let n = 100;
    let data = InputData::from_flux(
        Array1::linspace(0.0, 1.0, n).view(),
        arr1(&[0.9, 1.4]).view(),
        Array2::zeros((2, n)),
        Array2::ones((2, n)),
    )
    .unwrap();
    let params = vec![
        ParamConfig::fitted("A", 0.5, PriorSpec::uniform(-5.0, 5.0))
            .chromatic()
            .with_beta(1.0),
        ParamConfig::fitted("B", -0.5, PriorSpec::gaussian(0.0, 2.0)).with_beta(1.0),
        ParamConfig::fixed("DSC", 1.0),
    ];
    FitState::new(&params, Arc::new(data), &PriorRegistry::default()).unwrap()
}

fn gaussian(state: &FitState) -> f64 {
    log_prior(state) - 0.5 * state.free_vector().mapv(|v| v * v).sum()
}

fn config() -> RunConfig {
    let schedule = ModeConfig {
        burnin_fraction: 0.25,
        n_steps: 400,
        n_steps_increment: 200,
        max_loops: 2,
        correction_scale: 0.3,
    };
    RunConfig {
        walkers: 3,
        trial: schedule.clone(),
        full: schedule,
        seed: Some(99),
        progress: ProgressMode::Silent,
        ..RunConfig::default()
    }
}

#[test]
fn state_file_round_trip() {
    let mut state = template();
    state.set_free_value(1, 0.25);
    state.log_likelihood = gaussian(&state);

    let file = NamedTempFile::new().expect("Could not create temp file");
    state.save(file.path()).unwrap();
    let loaded = FitState::load(file.path()).unwrap();

    assert_eq!(loaded.full_grid(), state.full_grid());
    assert_eq!(loaded.free_vector(), state.free_vector());
    assert_eq!(loaded.step_size(), state.step_size());
    assert_eq!(loaded.free_names(), state.free_names());
    assert_eq!(loaded.log_likelihood.to_bits(), state.log_likelihood.to_bits());
    assert_eq!(loaded.data(), state.data());
}

#[test]
fn finished_sampler_round_trips_bit_for_bit() {
    let mut sampler = Sampler::new(template(), config(), SamplingMode::Trial).unwrap();
    sampler.run(&gaussian).unwrap();

    let dir = tempdir().unwrap();
    let path = dir.path().join("trial.bin");
    sampler.save(&path).unwrap();
    let loaded = Sampler::load(&path).unwrap();

    assert_eq!(loaded.to_bytes().unwrap(), sampler.to_bytes().unwrap());
    assert_eq!(loaded.chain(), sampler.chain());
    assert_eq!(loaded.status(), sampler.status());
    assert_eq!(loaded.grtest(), sampler.grtest());
}

#[test]
fn restored_trial_feeds_a_full_run() {
    let mut trial = Sampler::new(template(), config(), SamplingMode::Trial).unwrap();
    trial.run(&gaussian).unwrap();
    let bytes = trial.to_bytes().unwrap();
    let restored = Sampler::from_bytes(&bytes).unwrap();

    let mut a = Sampler::new(template(), config(), SamplingMode::Full).unwrap();
    let mut b = Sampler::new(template(), config(), SamplingMode::Full).unwrap();
    a.run_buffered(&gaussian, &trial).unwrap();
    b.run_buffered(&gaussian, &restored).unwrap();
    assert_eq!(a.chain(), b.chain());
    assert!(matches!(
        a.status(),
        RunStatus::Converged | RunStatus::LoopExhausted
    ));
}

#[test]
fn missing_or_corrupt_files_are_persistence_errors() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nothing.bin");
    assert!(matches!(FitState::load(&missing), Err(Error::Persistence(_))));

    let file = NamedTempFile::new().expect("Could not create temp file");
    std::fs::write(file.path(), b"not a sampler").unwrap();
    assert!(matches!(Sampler::load(file.path()), Err(Error::Persistence(_))));
}
