/*!
# Chain generation

[`run_chain`] drives one walker through a fixed number of proposals and
returns a [`Chain`]: the free vector, the move record and the log-posterior of
every recorded iteration.

Progress is reported in one of three ways with identical numerics:

- [`Progress::Silent`];
- [`Progress::Bar`], an `indicatif` bar the caller owns, typically one line of
  a `MultiProgress`;
- [`Progress::Labeled`], periodic `log` lines tagged with a group name and the
  walker index, for many walkers sharing one log.

## Example

```rust
use std::sync::Arc;
use ndarray::{arr1, Array2};
use tfit_mcmc::chain::{run_chain, ChainSettings, Progress};
use tfit_mcmc::config::ParamConfig;
use tfit_mcmc::data::InputData;
use tfit_mcmc::likelihood::log_prior;
use tfit_mcmc::priors::{PriorRegistry, PriorSpec};
use tfit_mcmc::state::FitState;

let data = InputData::from_flux(
    arr1(&[0.0]).view(),
    arr1(&[1.0]).view(),
    Array2::zeros((1, 1)),
    Array2::ones((1, 1)),
).unwrap();
let params = vec![ParamConfig::fitted("x", 0.5, PriorSpec::uniform(0.0, 1.0))];
let mut state = FitState::new(&params, Arc::new(data), &PriorRegistry::default()).unwrap();

let settings = ChainSettings { n_iterations: 100, thinning: 10, ..ChainSettings::default() };
let chain = run_chain(&mut state, &log_prior, &settings, Progress::Silent).unwrap();
assert_eq!(chain.len(), 10);
```
*/

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use ndarray::{concatenate, s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_stats::QuantileExt;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::likelihood::LogPosterior;
use crate::proposal::{MoveRecord, Mover};
use crate::state::FitState;

/// Recorded iterations of one walker, or several merged walkers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    /// `[n_rows, n_free]` free vector after each recorded iteration.
    pub states: Array2<f64>,
    pub moves: Vec<MoveRecord>,
    pub log_likelihoods: Array1<f64>,
    /// Set when generation stopped at a deadline before finishing.
    pub truncated: bool,
}

impl Default for Chain {
    fn default() -> Self {
        Self::empty(0)
    }
}

impl Chain {
    pub fn empty(n_free: usize) -> Self {
        Self {
            states: Array2::zeros((0, n_free)),
            moves: Vec::new(),
            log_likelihoods: Array1::zeros(0),
            truncated: false,
        }
    }

    pub fn len(&self) -> usize {
        self.states.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_free(&self) -> usize {
        self.states.ncols()
    }

    pub fn last_state(&self) -> Option<ArrayView1<'_, f64>> {
        self.len().checked_sub(1).map(|i| self.states.row(i))
    }

    /// Row with the highest log-posterior.
    pub fn best_row(&self) -> Option<ArrayView1<'_, f64>> {
        let i = self.log_likelihoods.argmax_skipnan().ok()?;
        Some(self.states.row(i))
    }

    /// Rows from `start` on.
    pub fn tail(&self, start: usize) -> Chain {
        let start = start.min(self.len());
        Chain {
            states: self.states.slice(s![start.., ..]).to_owned(),
            moves: self.moves[start..].to_vec(),
            log_likelihoods: self.log_likelihoods.slice(s![start..]).to_owned(),
            truncated: self.truncated,
        }
    }

    /// Keeps the first `len` rows.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.len() {
            return;
        }
        self.states = self.states.slice(s![..len, ..]).to_owned();
        self.moves.truncate(len);
        self.log_likelihoods = self.log_likelihoods.slice(s![..len]).to_owned();
    }

    /// Appends `other` after the last row of `self`.
    pub fn append(&mut self, other: &Chain) -> Result<()> {
        *self = merge_chains(self, other)?;
        Ok(())
    }

    pub fn states_view(&self) -> ArrayView2<'_, f64> {
        self.states.view()
    }
}

/// Concatenates two chains row-wise, `a` first.
///
/// An empty chain is the identity regardless of its width.
pub fn merge_chains(a: &Chain, b: &Chain) -> Result<Chain> {
    if a.is_empty() {
        return Ok(b.clone());
    }
    if b.is_empty() {
        return Ok(a.clone());
    }
    if a.n_free() != b.n_free() {
        return Err(Error::Shape(format!(
            "cannot merge chains of {} and {} free values",
            a.n_free(),
            b.n_free()
        )));
    }
    let states = concatenate(Axis(0), &[a.states.view(), b.states.view()])
        .map_err(|e| Error::Shape(e.to_string()))?;
    let log_likelihoods = concatenate(Axis(0), &[a.log_likelihoods.view(), b.log_likelihoods.view()])
        .map_err(|e| Error::Shape(e.to_string()))?;
    let mut moves = a.moves.clone();
    moves.extend_from_slice(&b.moves);
    Ok(Chain {
        states,
        moves,
        log_likelihoods,
        truncated: a.truncated || b.truncated,
    })
}

/// Concatenates any number of chains in order.
///
/// The result keeps the first chain's width even when every chain is empty.
pub fn merge_all<'a, I>(chains: I) -> Result<Chain>
where
    I: IntoIterator<Item = &'a Chain>,
{
    let mut chains = chains.into_iter();
    let Some(first) = chains.next() else {
        return Ok(Chain::default());
    };
    chains.try_fold(first.clone(), |acc, c| merge_chains(&acc, c))
}

/// Everything but the state and the likelihood that a chain run needs.
#[derive(Debug, Clone)]
pub struct ChainSettings<'a> {
    pub n_iterations: usize,
    pub mover: Mover,
    /// Earlier states for differential-evolution jumps, `[n_rows, n_free]`.
    pub buffer: Option<ArrayView2<'a, f64>>,
    pub correction_scale: f64,
    /// Record every `thinning`-th iteration, starting with the first.
    pub thinning: usize,
    pub seed: u64,
    /// Stop early, flagging the chain as truncated, once this instant passes.
    pub deadline: Option<Instant>,
}

impl Default for ChainSettings<'_> {
    fn default() -> Self {
        Self {
            n_iterations: 1000,
            mover: Mover::Gibbs,
            buffer: None,
            correction_scale: 0.3,
            thinning: 1,
            seed: 42,
            deadline: None,
        }
    }
}

/// How a chain run reports progress.
#[derive(Clone, Copy)]
pub enum Progress<'a> {
    Silent,
    Bar(&'a ProgressBar),
    /// An `info` line every `every` iterations.
    Labeled {
        group: &'a str,
        walker: usize,
        every: usize,
    },
}

/// Bar style shared by every walker bar.
pub fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-")
}

/// Runs `settings.n_iterations` proposals on `state`.
///
/// The initial log-posterior is evaluated first and stored on the state.
/// The random source is seeded from `settings.seed` only, so two calls with
/// the same inputs produce the same chain. `state` is left at the last
/// iteration, which makes consecutive calls continue one walk.
///
/// Fails with [`Error::Config`] when nothing is fitted and with
/// [`Error::Shape`] when `settings.buffer` is not `n_free` wide.
pub fn run_chain<L>(
    state: &mut FitState,
    likelihood: &L,
    settings: &ChainSettings<'_>,
    progress: Progress<'_>,
) -> Result<Chain>
where
    L: LogPosterior + ?Sized,
{
    if state.n_free() == 0 {
        return Err(Error::Config("no parameter is fitted".into()));
    }
    if let Some(buffer) = settings.buffer {
        if buffer.ncols() != state.n_free() {
            return Err(Error::Shape(format!(
                "buffer has {} columns, state has {} free values",
                buffer.ncols(),
                state.n_free()
            )));
        }
    }
    let n = settings.n_iterations;
    let thinning = settings.thinning.max(1);
    let n_rows = n.div_ceil(thinning);
    let mut rng = SmallRng::seed_from_u64(settings.seed);

    let mut states = Array2::zeros((n_rows, state.n_free()));
    let mut moves = Vec::with_capacity(n_rows);
    let mut log_likelihoods = Array1::zeros(n_rows);

    state.log_likelihood = likelihood.log_posterior(state);

    if let Progress::Bar(pb) = progress {
        pb.set_length(n as u64);
    }
    let start = Instant::now();
    let mut recorded = 0;
    let mut truncated = false;

    for it in 0..n {
        if settings.deadline.is_some_and(|d| Instant::now() >= d) {
            truncated = true;
            break;
        }
        let record = settings.mover.step(
            state,
            likelihood,
            settings.buffer,
            settings.correction_scale,
            &mut rng,
        );
        if it % thinning == 0 {
            states.row_mut(recorded).assign(&state.free_vector());
            moves.push(record);
            log_likelihoods[recorded] = state.log_likelihood;
            recorded += 1;
        }
        match progress {
            Progress::Silent => {}
            Progress::Bar(pb) => pb.inc(1),
            Progress::Labeled {
                group,
                walker,
                every,
            } => {
                let done = it + 1;
                if every > 0 && done % every == 0 {
                    let per_it = start.elapsed().as_secs_f64() / done as f64;
                    info!("group={group} walker={walker} iteration={done}/{n} ({per_it:.3e} s/it)");
                }
            }
        }
    }

    let mut chain = Chain {
        states,
        moves,
        log_likelihoods,
        truncated,
    };
    if truncated {
        chain.states = chain.states.slice(s![..recorded, ..]).to_owned();
        chain.log_likelihoods = chain.log_likelihoods.slice(s![..recorded]).to_owned();
    }
    Ok(chain)
}
