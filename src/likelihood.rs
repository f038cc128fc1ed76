/*!
Log-posterior of a [`FitState`].

The posterior is the sum of the free parameters' prior contributions and a
Gaussian log-likelihood of the measured flux given the forward model's
prediction for each channel. The forward model is external; it is seen only
through the [`ForwardModel`] trait.

Any closure `Fn(ArrayView1<f64>, usize, &InputData) -> Array1<f64>` is a
forward model, and any closure `Fn(&FitState) -> f64` is a [`LogPosterior`].
*/

use ndarray::{Array1, ArrayView1, Zip};

use crate::data::InputData;
use crate::error::{Error, Result};
use crate::priors::REJECT;
use crate::state::FitState;

/// Constant offset the prior sum starts from.
pub const PRIOR_OFFSET: f64 = 1.0;

/// Predicts one channel's observations from that channel's parameter column.
///
/// Implementations must be pure: they are called from many walker threads
/// at once and many millions of times per fit.
pub trait ForwardModel: Send + Sync {
    fn predict(&self, params: ArrayView1<f64>, channel: usize, data: &InputData) -> Array1<f64>;
}

impl<F> ForwardModel for F
where
    F: Fn(ArrayView1<f64>, usize, &InputData) -> Array1<f64> + Send + Sync,
{
    fn predict(&self, params: ArrayView1<f64>, channel: usize, data: &InputData) -> Array1<f64> {
        self(params, channel, data)
    }
}

/// Unnormalised log-posterior used by the accept/reject test.
///
/// Returns [`REJECT`] for states outside the prior support or with a
/// non-finite likelihood; never NaN.
pub trait LogPosterior: Send + Sync {
    fn log_posterior(&self, state: &FitState) -> f64;
}

impl<F> LogPosterior for F
where
    F: Fn(&FitState) -> f64 + Send + Sync,
{
    fn log_posterior(&self, state: &FitState) -> f64 {
        self(state)
    }
}

/// Sum of every free parameter's prior contribution.
///
/// Stops at the first rejecting prior.
pub fn log_prior(state: &FitState) -> f64 {
    let mut total = 0.0;
    for (prior, &value) in state.free_priors().iter().zip(state.free_vector()) {
        total += prior.log_prob(value);
        if total == REJECT || total.is_nan() {
            return REJECT;
        }
    }
    total
}

/// Gaussian log-likelihood of one channel, `-0.5 * Σ(ln σ² + (f - m)² / σ²)`
/// with `σ = flux_err * noise_scale`. NaN points are skipped.
///
/// # Panics
///
/// If `model` does not have one value per point of the channel.
pub fn channel_log_likelihood(
    flux: ArrayView1<f64>,
    flux_err: ArrayView1<f64>,
    model: ArrayView1<f64>,
    noise_scale: f64,
) -> f64 {
    let mut sum = 0.0;
    Zip::from(&flux)
        .and(&flux_err)
        .and(&model)
        .for_each(|&f, &err, &m| {
            let var = (err * noise_scale).powi(2);
            let term = var.ln() + (f - m).powi(2) / var;
            if !term.is_nan() {
                sum += term;
            }
        });
    -0.5 * sum
}

/// Prior plus per-channel Gaussian noise likelihood around a forward model.
///
/// The noise scale of each channel is read from a parameter row of the state
/// (conventionally `DSC`), so it can be fitted like any other parameter.
#[derive(Debug, Clone)]
pub struct GaussianLikelihood<M> {
    model: M,
    noise_row: Option<usize>,
}

impl<M: ForwardModel> GaussianLikelihood<M> {
    /// Uses the parameter called `noise_param` as the per-channel noise scale.
    pub fn new(model: M, state: &FitState, noise_param: &str) -> Result<Self> {
        let noise_row = state.param_row(noise_param).ok_or_else(|| {
            Error::Config(format!(
                "noise scale parameter {noise_param} is not defined"
            ))
        })?;
        Ok(Self {
            model,
            noise_row: Some(noise_row),
        })
    }

    /// Uses the flux uncertainties as given.
    pub fn without_noise_scale(model: M) -> Self {
        Self {
            model,
            noise_row: None,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M: ForwardModel> LogPosterior for GaussianLikelihood<M> {
    fn log_posterior(&self, state: &FitState) -> f64 {
        let prior = log_prior(state);
        if prior == REJECT {
            return REJECT;
        }
        let data = state.data();
        let mut total = PRIOR_OFFSET + prior;
        for channel in 0..state.n_channel() {
            let predicted = self.model.predict(state.channel_column(channel), channel, data);
            let scale = self
                .noise_row
                .map_or(1.0, |row| state.full_grid()[(row, channel)]);
            if !(scale.is_finite() && scale > 0.0) {
                return REJECT;
            }
            let term = channel_log_likelihood(
                data.flux.row(channel),
                data.flux_err.row(channel),
                predicted.view(),
                scale,
            );
            if !term.is_finite() {
                return REJECT;
            }
            total += term;
        }
        total
    }
}
