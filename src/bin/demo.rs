//! Fits a box-shaped transit to synthetic light curves in three channels, then prints the
//! posterior summaries.

use std::error::Error;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use tfit_mcmc::config::{ParamConfig, ProgressMode, ResultMode, RunConfig};
use tfit_mcmc::data::InputData;
use tfit_mcmc::fit::run_fit;
use tfit_mcmc::likelihood::GaussianLikelihood;
use tfit_mcmc::priors::{PriorRegistry, PriorSpec};
use tfit_mcmc::state::FitState;

/// Parameter rows: `RP`, `T0`, `WIDTH`, `DSC`.
fn box_transit(params: ArrayView1<f64>, channel: usize, data: &InputData) -> Array1<f64> {
    let (rp, t0, width) = (params[0], params[1], params[2]);
    data.time
        .row(channel)
        .mapv(|t| if (t - t0).abs() < 0.5 * width { 1.0 - rp * rp } else { 1.0 })
}

fn main() -> Result<(), Box<dyn Error>> {
    const N_INT: usize = 400;
    const NOISE: f64 = 5e-4;
    const SEED: u64 = 42;
    let radii = [0.10, 0.11, 0.12];
    let wavelengths = Array1::from(vec![1.0, 1.5, 2.0]);

    // Synthetic light curves
    let time: Array1<f64> = Array1::linspace(-0.2, 0.2, N_INT);
    let mut rng = SmallRng::seed_from_u64(SEED);
    let normal = Normal::new(0.0, NOISE)?;
    let mut flux = Array2::zeros((radii.len(), N_INT));
    for (c, &rp) in radii.iter().enumerate() {
        for (i, &t) in time.iter().enumerate() {
            let depth = if t.abs() < 0.05 { rp * rp } else { 0.0 };
            flux[(c, i)] = 1.0 - depth + normal.sample(&mut rng);
        }
    }
    let flux_err = Array2::from_elem(flux.dim(), NOISE);
    let data = InputData::from_flux(time.view(), wavelengths.view(), flux, flux_err)?;

    let params = vec![
        ParamConfig::fitted("RP", 0.1, PriorSpec::uniform(0.0, 0.3))
            .chromatic()
            .with_full_name("planet-star radius ratio")
            .with_beta(0.005),
        ParamConfig::fitted("T0", 0.0, PriorSpec::uniform(-0.05, 0.05))
            .with_full_name("mid-transit time")
            .with_beta(0.005),
        ParamConfig::fixed("WIDTH", 0.1).with_full_name("transit duration"),
        ParamConfig::fixed("DSC", 1.0).with_full_name("noise scale"),
    ];
    let state = FitState::new(&params, Arc::new(data), &PriorRegistry::default())?;
    let mut config = RunConfig {
        walkers: 4,
        seed: Some(SEED),
        progress: ProgressMode::Bar,
        result_mode: ResultMode::All,
        ..RunConfig::default()
    };
    config.calibration.n_iterations = 1000;
    let likelihood = GaussianLikelihood::new(box_transit, &state, &config.noise_param)?;

    let outcome = run_fit(state, &likelihood, &config)?;

    println!(
        "Calibrated step sizes after {} loops: {}",
        outcome.calibration.loops, outcome.calibration.step_size
    );
    println!(
        "Trial: {:?} after {} loops, full: {:?} after {} loops",
        outcome.trial.status(),
        outcome.trial.loops(),
        outcome.full.status(),
        outcome.full.loops()
    );
    if let Some(rc) = outcome.full.grtest() {
        println!("Gelman-Rubin: {rc:.4}");
    }
    for kind in [ResultMode::Mode, ResultMode::Percentile] {
        println!("{kind:?}:");
        for row in &outcome.results.rows {
            if let Some(line) = row.format(kind) {
                println!("\t{line}");
            }
        }
    }
    for (&rp, row) in radii.iter().zip(outcome.results.find("RP")) {
        println!("\tRP true value {rp:.4}, median {:.4}", row.p50.unwrap_or(f64::NAN));
    }

    #[cfg(feature = "csv")]
    {
        use tfit_mcmc::io::csv::{save_chain, save_results};
        save_chain(
            outcome.full.chain(),
            outcome.full.template().free_names(),
            "/tmp/tfit_chain.csv",
        )?;
        save_results(&outcome.results, "/tmp/tfit_results.csv")?;
        println!("Saved /tmp/tfit_chain.csv and /tmp/tfit_results.csv");
    }

    Ok(())
}
