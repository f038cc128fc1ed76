/*!
# Multi-walker orchestration

A [`Sampler`] runs one sampling mode (trial or full) of a fit. Every loop it
dispatches one batch of walkers to a fixed-size thread pool, waits for all of
them, appends each walker's new rows to that walker's accumulated chain and
then:

1. discards the leading `burnin_fraction` of every walker chain,
2. merges the remaining rows into one chain,
3. computes acceptance rates on the merged chain and the Gelman-Rubin factor
   across the un-merged walker chains.

The run is converged when every free entry's factor is below the threshold.
Otherwise the next loop runs longer chains, each walker continuing from its
last state, until the loop budget runs out.

Walkers share nothing mutable: each gets its own copy of the state and a seed
drawn from the sampler's master sequence.

A full-mode sampler is normally started from a finished trial sampler with
[`Sampler::run_buffered`]: its first loop starts every walker where the trial
walker stopped and uses the trial's merged chain as the differential-evolution
buffer.
*/

use std::path::Path;
use std::time::Instant;

use indicatif::{MultiProgress, ProgressBar};
use log::{debug, info, warn};
use ndarray::{Array1, ArrayView2};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};

use crate::chain::{bar_style, merge_all, run_chain, Chain, ChainSettings, Progress};
use crate::config::{ProgressMode, RunConfig, SamplingMode};
use crate::error::{Error, Result};
use crate::likelihood::LogPosterior;
use crate::persist;
use crate::proposal::Mover;
use crate::stats::{acceptance_rates, gelman_rubin, AcceptanceRates};
use crate::state::FitState;

/// Where a sampler is in its loop schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Init,
    /// Loop `k` (from 1) is running or has just finished unconverged.
    Running(usize),
    Converged,
    /// The loop budget ran out before convergence. The merged chain is still
    /// available but should be treated with care.
    LoopExhausted,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, RunStatus::Converged | RunStatus::LoopExhausted)
    }
}

/// Builds the worker pool for walker batches.
pub(crate) fn worker_pool(threads: usize) -> Result<ThreadPool> {
    Ok(ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("tfit-walker-{i}"))
        .build()?)
}

/// Draws `n` walker seeds and advances the master seed.
pub(crate) fn draw_seeds(master: &mut u64, n: usize) -> Vec<u64> {
    let mut rng = SmallRng::seed_from_u64(*master);
    let seeds = (0..n).map(|_| rng.gen()).collect();
    *master = rng.gen();
    seeds
}

pub(crate) fn initial_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(rand::random)
}

/// How a batch labels and reports its walkers.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchReport<'a> {
    pub mode: ProgressMode,
    pub group: &'a str,
    /// Iterations between labeled lines.
    pub every: usize,
}

/// Runs one chain per start state on `pool` and returns each walker's final
/// state with its chain, in walker order.
pub(crate) fn run_batch<L>(
    pool: &ThreadPool,
    starts: Vec<FitState>,
    seeds: &[u64],
    likelihood: &L,
    settings: &ChainSettings<'_>,
    report: BatchReport<'_>,
) -> Result<Vec<(FitState, Chain)>>
where
    L: LogPosterior + ?Sized,
{
    let multi = MultiProgress::new();
    let style = bar_style();
    let jobs: Vec<(usize, FitState, u64)> = starts
        .into_iter()
        .zip(seeds)
        .enumerate()
        .map(|(w, (state, &seed))| (w, state, seed))
        .collect();

    pool.install(|| {
        jobs.into_par_iter()
            .map(|(walker, mut state, seed)| -> Result<(FitState, Chain)> {
                let settings = ChainSettings {
                    seed,
                    ..settings.clone()
                };
                let BatchReport { mode, group, every } = report;
                let chain = match mode {
                    ProgressMode::Silent => {
                        run_chain(&mut state, likelihood, &settings, Progress::Silent)
                    }
                    ProgressMode::Labeled => run_chain(
                        &mut state,
                        likelihood,
                        &settings,
                        Progress::Labeled {
                            group,
                            walker,
                            every,
                        },
                    ),
                    ProgressMode::Bar => {
                        let pb = multi.add(ProgressBar::new(settings.n_iterations as u64));
                        pb.set_prefix(format!("{group} walker {walker}"));
                        pb.set_style(style.clone());
                        let chain = run_chain(&mut state, likelihood, &settings, Progress::Bar(&pb));
                        pb.finish_with_message("Done!");
                        chain
                    }
                }?;
                Ok((state, chain))
            })
            .collect()
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sampler {
    mode: SamplingMode,
    config: RunConfig,
    template: FitState,
    /// Last state of each walker, where the next loop continues from.
    walker_states: Vec<FitState>,
    /// Every row each walker produced, across loops.
    walker_chains: Vec<Chain>,
    /// Post-burn-in rows of all walkers.
    chain: Chain,
    acceptance: Option<AcceptanceRates>,
    grtest: Option<Array1<f64>>,
    n_steps: usize,
    loops: usize,
    status: RunStatus,
    next_seed: u64,
}

impl Sampler {
    /// Creates a sampler for `mode`, copying `template` into every walker.
    pub fn new(template: FitState, config: RunConfig, mode: SamplingMode) -> Result<Self> {
        config.validate()?;
        if template.n_free() == 0 {
            return Err(Error::Config("no parameter is fitted".into()));
        }
        let n_free = template.n_free();
        Ok(Self {
            mode,
            n_steps: config.mode(mode).n_steps,
            next_seed: initial_seed(config.seed),
            walker_states: Vec::new(),
            walker_chains: vec![Chain::empty(n_free); config.walkers],
            chain: Chain::empty(n_free),
            acceptance: None,
            grtest: None,
            loops: 0,
            status: RunStatus::Init,
            template,
            config,
        })
    }

    /// Loops until convergence or the loop budget is spent.
    ///
    /// A finished sampler returns its status without running.
    pub fn run<L>(&mut self, likelihood: &L) -> Result<RunStatus>
    where
        L: LogPosterior + ?Sized,
    {
        self.run_inner(likelihood, None)
    }

    /// Like [`Sampler::run`], with the first loop seeded from `trial`: walkers
    /// start at the trial walkers' last states and the trial's merged chain is
    /// the differential-evolution buffer.
    pub fn run_buffered<L>(&mut self, likelihood: &L, trial: &Sampler) -> Result<RunStatus>
    where
        L: LogPosterior + ?Sized,
    {
        if trial.chain.n_free() != self.template.n_free() {
            return Err(Error::Shape(format!(
                "trial run has {} free values, this run has {}",
                trial.chain.n_free(),
                self.template.n_free()
            )));
        }
        if trial.walker_chains.iter().all(Chain::is_empty) {
            return Err(Error::Config("the trial run has no chain to start from".into()));
        }
        self.run_inner(likelihood, Some(trial))
    }

    fn run_inner<L>(&mut self, likelihood: &L, trial: Option<&Sampler>) -> Result<RunStatus>
    where
        L: LogPosterior + ?Sized,
    {
        if self.status.is_finished() {
            return Ok(self.status);
        }
        let pool = worker_pool(self.config.worker_threads())?;
        let mode_cfg = self.config.mode(self.mode).clone();
        let mover = match self.mode {
            SamplingMode::Trial => Mover::Gibbs,
            SamplingMode::Full => Mover::DeGibbs,
        };
        let group = self.mode.to_string();

        while self.loops < mode_cfg.max_loops {
            self.loops += 1;
            self.status = RunStatus::Running(self.loops);
            info!(
                "{group} run: loop {}/{} with {} steps per walker",
                self.loops, mode_cfg.max_loops, self.n_steps
            );

            let first = self.walker_states.is_empty();
            let previous = std::mem::take(&mut self.chain);
            let (starts, buffer) = match trial {
                Some(trial) if first => (self.starts_from(trial)?, Some(trial.chain.states.view())),
                _ => (
                    self.own_starts(),
                    (!previous.is_empty()).then(|| previous.states.view()),
                ),
            };
            let buffer = buffer.filter(|_| mover == Mover::DeGibbs);
            self.run_loop(likelihood, &pool, starts, buffer, mover, &group)?;

            if self.check_convergence()? {
                self.status = RunStatus::Converged;
                info!("{group} run converged after {} loops", self.loops);
                return Ok(self.status);
            }
            self.n_steps += mode_cfg.n_steps_increment;
        }
        self.status = RunStatus::LoopExhausted;
        warn!(
            "{group} run did not converge in {} loops; results are not converged",
            self.loops
        );
        Ok(self.status)
    }

    fn starts_from(&self, trial: &Sampler) -> Result<Vec<FitState>> {
        let available: Vec<&Chain> = trial.walker_chains.iter().filter(|c| !c.is_empty()).collect();
        (0..self.config.walkers)
            .map(|w| {
                let mut state = self.template.clone();
                if let Some(row) = available[w % available.len()].last_state() {
                    state.set_free_from_row(row)?;
                }
                Ok(state)
            })
            .collect()
    }

    fn own_starts(&self) -> Vec<FitState> {
        if self.walker_states.is_empty() {
            vec![self.template.clone(); self.config.walkers]
        } else {
            self.walker_states.clone()
        }
    }

    fn run_loop<L>(
        &mut self,
        likelihood: &L,
        pool: &ThreadPool,
        starts: Vec<FitState>,
        buffer: Option<ArrayView2<f64>>,
        mover: Mover,
        group: &str,
    ) -> Result<()>
    where
        L: LogPosterior + ?Sized,
    {
        let seeds = draw_seeds(&mut self.next_seed, starts.len());
        let settings = ChainSettings {
            n_iterations: self.n_steps,
            mover,
            buffer,
            correction_scale: self.config.mode(self.mode).correction_scale,
            thinning: self.config.thinning,
            seed: 0,
            deadline: self.config.batch_timeout().map(|t| Instant::now() + t),
        };
        let report = BatchReport {
            mode: self.config.progress,
            group,
            every: self.config.report_every(self.n_steps),
        };
        let results = run_batch(pool, starts, &seeds, likelihood, &settings, report)?;

        self.walker_states.clear();
        for (w, (state, chain)) in results.into_iter().enumerate() {
            self.walker_chains[w].append(&chain)?;
            self.walker_states.push(state);
        }
        self.align_truncated_walkers()?;

        let burnin = self.burnin();
        let post: Vec<Chain> = self.walker_chains.iter().map(|c| c.tail(burnin)).collect();
        self.chain = merge_all(&post)?;
        self.acceptance = Some(acceptance_rates(&self.chain.moves, self.template.n_free()));
        debug!(
            "{group} run: {} merged rows after discarding {burnin} per walker",
            self.chain.len()
        );
        Ok(())
    }

    /// Cuts every walker chain to the shortest one after a deadline stop.
    fn align_truncated_walkers(&mut self) -> Result<()> {
        if !self.walker_chains.iter().any(|c| c.truncated) {
            return Ok(());
        }
        let common = self.walker_chains.iter().map(Chain::len).min().unwrap_or(0);
        warn!(
            "batch deadline reached; truncating {} walker chains to {common} rows",
            self.walker_chains.len()
        );
        for (chain, state) in self.walker_chains.iter_mut().zip(&mut self.walker_states) {
            chain.truncate(common);
            chain.truncated = false;
            if let Some(row) = chain.last_state() {
                state.set_free_from_row(row)?;
            }
        }
        Ok(())
    }

    fn burnin(&self) -> usize {
        let len = self.walker_chains.first().map_or(0, Chain::len);
        (len as f64 * self.config.mode(self.mode).burnin_fraction) as usize
    }

    fn check_convergence(&mut self) -> Result<bool> {
        let burnin = self.burnin();
        let post: Vec<ArrayView2<f64>> = self
            .walker_chains
            .iter()
            .map(|c| c.states.slice(ndarray::s![burnin.., ..]))
            .collect();
        if post.iter().any(|c| c.nrows() < 2) {
            warn!("too few rows after burn-in to test convergence");
            self.grtest = None;
            return Ok(false);
        }
        let rc = gelman_rubin(&post, self.template.data().npt())?;
        self.log_loop_summary(&rc);
        let threshold = self.config.convergence_threshold;
        let converged = rc.iter().all(|&r| r < threshold);
        self.grtest = Some(rc);
        Ok(converged)
    }

    fn log_loop_summary(&self, rc: &Array1<f64>) {
        let names = self.template.free_names();
        let rates = self.acceptance.as_ref();
        for (i, r) in rc.iter().enumerate() {
            let channel = self
                .template
                .free_channel(i)
                .map_or_else(String::new, |c| format!("[{c}]"));
            let rate = rates.map_or(f64::NAN, |a| a.per_param[i]);
            info!(
                "\t{:>8}{channel:<6} acceptance={rate:.3} gelman-rubin={r:.4}",
                names[i]
            );
        }
        if let Some(a) = rates {
            info!("\tglobal acceptance={:.3}", a.global);
            if let Some(de) = a.vector_jump {
                info!("\tvector-jump acceptance={de:.3}");
            }
        }
    }

    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn converged(&self) -> bool {
        self.status == RunStatus::Converged
    }

    pub fn loops(&self) -> usize {
        self.loops
    }

    /// Chain length per walker of the next (or last unconverged) loop.
    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    pub fn template(&self) -> &FitState {
        &self.template
    }

    /// Merged post-burn-in chain of every walker.
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn walker_chains(&self) -> &[Chain] {
        &self.walker_chains
    }

    pub fn walker_states(&self) -> &[FitState] {
        &self.walker_states
    }

    pub fn acceptance(&self) -> Option<&AcceptanceRates> {
        self.acceptance.as_ref()
    }

    /// Gelman-Rubin factor per free entry from the last loop.
    pub fn grtest(&self) -> Option<&Array1<f64>> {
        self.grtest.as_ref()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        persist::save(self, path)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        persist::load(path)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        persist::to_bytes(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        persist::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModeConfig, ParamConfig};
    use crate::data::InputData;
    use crate::priors::{PriorRegistry, PriorSpec};
    use crate::state::MoveIndex;
    use ndarray::{arr1, Array2};
    use std::sync::Arc;

    fn template_with_step(beta: f64) -> FitState {
        let n = 200;
        let data = InputData::from_flux(
            Array1::linspace(0.0, 1.0, n).view(),
            arr1(&[1.0]).view(),
            Array2::zeros((1, n)),
            Array2::ones((1, n)),
        )
        .unwrap();
        let params = vec![
            ParamConfig::fitted("x", 0.0, PriorSpec::uniform(-10.0, 10.0)).with_beta(beta),
            ParamConfig::fitted("y", 0.0, PriorSpec::uniform(-10.0, 10.0)).with_beta(beta),
        ];
        FitState::new(&params, Arc::new(data), &PriorRegistry::default()).unwrap()
    }

    fn template() -> FitState {
        template_with_step(1.0)
    }

    fn gaussian(state: &FitState) -> f64 {
        let prior = crate::likelihood::log_prior(state);
        prior - 0.5 * state.free_vector().mapv(|v| v * v).sum()
    }

    fn config(n_steps: usize, max_loops: usize) -> RunConfig {
        let schedule = ModeConfig {
            burnin_fraction: 0.5,
            n_steps,
            n_steps_increment: n_steps,
            max_loops,
            correction_scale: 0.3,
        };
        RunConfig {
            walkers: 3,
            trial: schedule.clone(),
            full: schedule,
            seed: Some(17),
            progress: ProgressMode::Silent,
            convergence_threshold: 1.1,
            ..RunConfig::default()
        }
    }

    #[test]
    fn seeds_are_distinct_and_reproducible() {
        let (mut a, mut b) = (5, 5);
        let first = draw_seeds(&mut a, 4);
        assert_eq!(first, draw_seeds(&mut b, 4));
        let second = draw_seeds(&mut a, 4);
        assert_ne!(first, second);
        let mut unique = first.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 4);
    }

    #[test]
    fn trial_run_converges_on_gaussian() {
        let mut s = Sampler::new(template(), config(2000, 4), SamplingMode::Trial).unwrap();
        assert_eq!(s.status(), RunStatus::Init);
        let status = s.run(&gaussian).unwrap();
        assert_eq!(status, RunStatus::Converged);
        assert!(s.converged());
        assert!(s.grtest().unwrap().iter().all(|&r| r < 1.1));
        // trial runs never jump
        assert!(s.chain().moves.iter().all(|m| m.index != MoveIndex::VectorJump));
        let per_walker = s.walker_chains()[0].len();
        assert_eq!(s.chain().len(), 3 * (per_walker - per_walker / 2));
        // a finished sampler does not run again
        assert_eq!(s.run(&gaussian).unwrap(), RunStatus::Converged);
    }

    #[test]
    fn unmixed_walkers_exhaust_loops() {
        let mut cfg = config(50, 3);
        cfg.convergence_threshold = 1.0 + 1e-9;
        // tiny steps leave each walker diffusing on its own
        let mut s = Sampler::new(template_with_step(1e-3), cfg, SamplingMode::Trial).unwrap();
        assert_eq!(s.run(&gaussian).unwrap(), RunStatus::LoopExhausted);
        assert_eq!(s.loops(), 3);
        // chains accumulate: 50 + 100 + 150 rows per walker
        assert!(s.walker_chains().iter().all(|c| c.len() == 300));
        assert_eq!(s.n_steps(), 200);
        assert!(!s.chain().is_empty());
    }

    #[test]
    fn full_run_uses_trial_buffer_and_starts() {
        let mut trial = Sampler::new(template(), config(500, 1), SamplingMode::Trial).unwrap();
        trial.run(&gaussian).unwrap();

        let mut full = Sampler::new(template(), config(500, 1), SamplingMode::Full).unwrap();
        full.run_buffered(&gaussian, &trial).unwrap();
        assert!(full
            .chain()
            .moves
            .iter()
            .any(|m| m.index == MoveIndex::VectorJump));
        assert!(full.acceptance().unwrap().vector_jump.is_some());
    }

    #[test]
    fn mismatched_trial_is_rejected() {
        let data = template().shared_data();
        let params = vec![ParamConfig::fitted("x", 0.0, PriorSpec::uniform(-1.0, 1.0))];
        let narrow = FitState::new(&params, data, &PriorRegistry::default()).unwrap();
        let mut trial = Sampler::new(narrow, config(100, 1), SamplingMode::Trial).unwrap();
        trial.run(&gaussian).unwrap();
        let mut full = Sampler::new(template(), config(100, 1), SamplingMode::Full).unwrap();
        assert!(matches!(
            full.run_buffered(&gaussian, &trial),
            Err(Error::Shape(_))
        ));
    }

    #[test]
    fn same_seed_same_run() {
        let mut a = Sampler::new(template(), config(300, 1), SamplingMode::Trial).unwrap();
        let mut b = Sampler::new(template(), config(300, 1), SamplingMode::Trial).unwrap();
        a.run(&gaussian).unwrap();
        b.run(&gaussian).unwrap();
        assert_eq!(a.chain(), b.chain());
    }

    #[test]
    fn expired_deadline_aligns_walkers() {
        let mut cfg = config(100_000, 1);
        cfg.batch_timeout_secs = Some(1e-6);
        let mut s = Sampler::new(template(), cfg, SamplingMode::Trial).unwrap();
        let status = s.run(&gaussian).unwrap();
        assert_eq!(status, RunStatus::LoopExhausted);
        let lens: Vec<usize> = s.walker_chains().iter().map(Chain::len).collect();
        assert!(lens.windows(2).all(|w| w[0] == w[1]));
        assert!(lens[0] < 100_000);
    }

    #[test]
    fn emptied_trial_keeps_its_width() {
        let slow = |state: &FitState| {
            std::thread::sleep(std::time::Duration::from_millis(2));
            gaussian(state)
        };
        let mut cfg = config(1000, 1);
        cfg.batch_timeout_secs = Some(1e-6);
        let mut trial = Sampler::new(template(), cfg, SamplingMode::Trial).unwrap();
        trial.run(&slow).unwrap();
        assert!(trial.walker_chains().iter().all(Chain::is_empty));
        assert_eq!(trial.chain().n_free(), 2);

        let mut full = Sampler::new(template(), config(100, 1), SamplingMode::Full).unwrap();
        assert!(matches!(
            full.run_buffered(&gaussian, &trial),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn progress_modes_share_numerics() {
        let run = |progress: ProgressMode| {
            let mut cfg = config(300, 1);
            cfg.progress = progress;
            let mut s = Sampler::new(template(), cfg, SamplingMode::Trial).unwrap();
            s.run(&gaussian).unwrap();
            s
        };
        let silent = run(ProgressMode::Silent);
        for progress in [ProgressMode::Labeled, ProgressMode::Bar] {
            let s = run(progress);
            assert_eq!(s.chain(), silent.chain(), "{progress:?}");
            assert_eq!(s.walker_chains(), silent.walker_chains(), "{progress:?}");
        }
    }

    #[test]
    fn rejects_state_without_free_parameters() {
        let data = template().shared_data();
        let params = vec![ParamConfig::fixed("x", 0.0)];
        let state = FitState::new(&params, data, &PriorRegistry::default()).unwrap();
        assert!(matches!(
            Sampler::new(state, config(10, 1), SamplingMode::Trial),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn bytes_round_trip_is_exact() {
        let mut s = Sampler::new(template(), config(200, 1), SamplingMode::Trial).unwrap();
        s.run(&gaussian).unwrap();
        let restored = Sampler::from_bytes(&s.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.chain(), s.chain());
        assert_eq!(restored.status(), s.status());
        assert_eq!(restored.grtest(), s.grtest());
        assert_eq!(restored.walker_chains(), s.walker_chains());
        assert_eq!(restored.config(), s.config());
    }
}
