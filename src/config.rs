/*!
Run configuration.

The sampler never reads files itself; callers hand it a [`RunConfig`] and a
list of [`ParamConfig`]s, usually parsed from one TOML document:

```rust
use tfit_mcmc::config::FitConfig;

let cfg = FitConfig::from_toml_str(r#"
    [run]
    walkers = 4
    convergence_threshold = 1.05

    [run.full]
    n_steps = 5000

    [[params]]
    name = "RD1"
    full_name = "planet radius ratio"
    value = 0.1
    fit = true
    chromatic = true
    prior = { func = "uniform", minimum = 0.0, maximum = 0.5 }
"#).unwrap();
assert_eq!(cfg.run.walkers, 4);
assert_eq!(cfg.params[0].prior.func.as_deref(), Some("uniform"));
```
*/

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::priors::PriorSpec;

/// Which phase of a fit a [`Sampler`](crate::sampler::Sampler) runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    /// Short exploratory run, also used for step-size calibration.
    Trial,
    /// Production run, usually buffered from a finished trial run.
    Full,
}

impl fmt::Display for SamplingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplingMode::Trial => write!(f, "trial"),
            SamplingMode::Full => write!(f, "full"),
        }
    }
}

/// Per-mode chain-length schedule.
///
/// Inside a [`RunConfig`] each field left out of a `[trial]` or `[full]`
/// table keeps that mode's own preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Fraction of each walker's accumulated chain discarded as burn-in.
    pub burnin_fraction: f64,
    /// Chain length of the first loop.
    pub n_steps: usize,
    /// Added to the chain length after every unconverged loop.
    pub n_steps_increment: usize,
    pub max_loops: usize,
    /// Scale applied to differential-evolution jumps.
    pub correction_scale: f64,
}

impl ModeConfig {
    fn trial() -> Self {
        Self {
            burnin_fraction: 0.5,
            n_steps: 2_000,
            n_steps_increment: 1_000,
            max_loops: 3,
            correction_scale: 0.3,
        }
    }

    fn full() -> Self {
        Self {
            burnin_fraction: 0.2,
            n_steps: 10_000,
            n_steps_increment: 10_000,
            max_loops: 10,
            correction_scale: 0.3,
        }
    }
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self::full()
    }
}

/// A mode table as written in configuration; missing fields keep the preset.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ModeTable {
    burnin_fraction: Option<f64>,
    n_steps: Option<usize>,
    n_steps_increment: Option<usize>,
    max_loops: Option<usize>,
    correction_scale: Option<f64>,
}

impl ModeTable {
    fn over(self, preset: ModeConfig) -> ModeConfig {
        ModeConfig {
            burnin_fraction: self.burnin_fraction.unwrap_or(preset.burnin_fraction),
            n_steps: self.n_steps.unwrap_or(preset.n_steps),
            n_steps_increment: self.n_steps_increment.unwrap_or(preset.n_steps_increment),
            max_loops: self.max_loops.unwrap_or(preset.max_loops),
            correction_scale: self.correction_scale.unwrap_or(preset.correction_scale),
        }
    }
}

impl From<&ModeConfig> for ModeTable {
    fn from(m: &ModeConfig) -> Self {
        Self {
            burnin_fraction: Some(m.burnin_fraction),
            n_steps: Some(m.n_steps),
            n_steps_increment: Some(m.n_steps_increment),
            max_loops: Some(m.max_loops),
            correction_scale: Some(m.correction_scale),
        }
    }
}

fn serialize_mode<S: Serializer>(mode: &ModeConfig, s: S) -> std::result::Result<S::Ok, S::Error> {
    ModeTable::from(mode).serialize(s)
}

fn deserialize_trial<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<ModeConfig, D::Error> {
    Ok(ModeTable::deserialize(d)?.over(ModeConfig::trial()))
}

fn deserialize_full<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<ModeConfig, D::Error> {
    Ok(ModeTable::deserialize(d)?.over(ModeConfig::full()))
}

/// Step-size calibration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub acceptance_low: f64,
    pub acceptance_high: f64,
    /// Offset keeping the correction factor finite at 0% and 100% acceptance.
    pub delta: f64,
    /// Exponent of the correction factor; smaller is slower and steadier.
    pub exponent: f64,
    /// Chain length per walker for each calibration loop.
    pub n_iterations: usize,
    /// Leading iterations of each calibration chain ignored when counting.
    pub burnin: usize,
    pub max_loops: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            acceptance_low: 0.2,
            acceptance_high: 0.4,
            delta: 0.01,
            exponent: 0.5,
            n_iterations: 2_000,
            burnin: 0,
            max_loops: 20,
        }
    }
}

/// Which posterior summaries the results table carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultMode {
    /// KDE peak with asymmetric envelope.
    Mode,
    /// Median with 16th/84th percentiles.
    Percentile,
    #[default]
    All,
}

impl ResultMode {
    pub fn wants_mode(self) -> bool {
        matches!(self, ResultMode::Mode | ResultMode::All)
    }

    pub fn wants_percentile(self) -> bool {
        matches!(self, ResultMode::Percentile | ResultMode::All)
    }
}

/// How walkers report progress during a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressMode {
    Silent,
    /// One `indicatif` bar per walker.
    Bar,
    /// Periodic `log` lines per walker.
    Labeled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub walkers: usize,
    #[serde(serialize_with = "serialize_mode", deserialize_with = "deserialize_trial")]
    pub trial: ModeConfig,
    #[serde(serialize_with = "serialize_mode", deserialize_with = "deserialize_full")]
    pub full: ModeConfig,
    /// Every free parameter's Gelman-Rubin statistic must fall below this.
    pub convergence_threshold: f64,
    /// Record every `thinning`-th iteration.
    pub thinning: usize,
    /// Upper bound on worker threads; `None` uses one thread per walker.
    pub max_concurrency: Option<usize>,
    pub calibration: CalibrationConfig,
    pub result_mode: ResultMode,
    /// Master seed; walker seeds are derived from it. `None` draws from entropy.
    pub seed: Option<u64>,
    /// Cooperative deadline for one batch of walkers.
    pub batch_timeout_secs: Option<f64>,
    /// Short name of the per-channel noise-scale parameter.
    pub noise_param: String,
    pub progress: ProgressMode,
    /// Emit labeled log lines every this fraction of a walker's chain.
    pub report_fraction: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            walkers: 4,
            trial: ModeConfig::trial(),
            full: ModeConfig::full(),
            convergence_threshold: 1.02,
            thinning: 1,
            max_concurrency: None,
            calibration: CalibrationConfig::default(),
            result_mode: ResultMode::All,
            seed: None,
            batch_timeout_secs: None,
            noise_param: "DSC".to_string(),
            progress: ProgressMode::Labeled,
            report_fraction: 0.1,
        }
    }
}

impl RunConfig {
    /// Parses a bare `RunConfig` document and validates it.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: RunConfig = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn mode(&self, mode: SamplingMode) -> &ModeConfig {
        match mode {
            SamplingMode::Trial => &self.trial,
            SamplingMode::Full => &self.full,
        }
    }

    pub fn mode_mut(&mut self, mode: SamplingMode) -> &mut ModeConfig {
        match mode {
            SamplingMode::Trial => &mut self.trial,
            SamplingMode::Full => &mut self.full,
        }
    }

    /// Number of worker threads for a batch.
    pub fn worker_threads(&self) -> usize {
        match self.max_concurrency {
            Some(max) => max.clamp(1, self.walkers.max(1)),
            None => self.walkers.max(1),
        }
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_secs.map(Duration::from_secs_f64)
    }

    /// Iterations between two labeled progress lines for a chain of `n`.
    pub fn report_every(&self, n: usize) -> usize {
        ((n as f64 * self.report_fraction).ceil() as usize).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.walkers < 2 {
            return Err(Error::Config(format!(
                "need at least 2 walkers for the Gelman-Rubin test, got {}",
                self.walkers
            )));
        }
        for (name, m) in [("trial", &self.trial), ("full", &self.full)] {
            if !(0.0..1.0).contains(&m.burnin_fraction) {
                return Err(Error::Config(format!(
                    "{name}.burnin_fraction must be in [0, 1), got {}",
                    m.burnin_fraction
                )));
            }
            if m.n_steps == 0 || m.max_loops == 0 {
                return Err(Error::Config(format!(
                    "{name}.n_steps and {name}.max_loops must be positive"
                )));
            }
            if !(m.correction_scale.is_finite() && m.correction_scale > 0.0) {
                return Err(Error::Config(format!(
                    "{name}.correction_scale must be positive, got {}",
                    m.correction_scale
                )));
            }
        }
        if self.convergence_threshold <= 1.0 || self.convergence_threshold.is_nan() {
            return Err(Error::Config(format!(
                "convergence_threshold must exceed 1, got {}",
                self.convergence_threshold
            )));
        }
        if self.thinning == 0 {
            return Err(Error::Config("thinning must be at least 1".into()));
        }
        if self.max_concurrency == Some(0) {
            return Err(Error::Config("max_concurrency must be at least 1".into()));
        }
        if let Some(t) = self.batch_timeout_secs {
            if !(t.is_finite() && t > 0.0) {
                return Err(Error::Config(format!("batch_timeout_secs must be positive, got {t}")));
            }
        }
        if !(self.report_fraction > 0.0 && self.report_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "report_fraction must be in (0, 1], got {}",
                self.report_fraction
            )));
        }
        self.calibration.validate()
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0 <= self.acceptance_low
            && self.acceptance_low < self.acceptance_high
            && self.acceptance_high <= 1.0)
        {
            return Err(Error::Config(format!(
                "calibration window [{}, {}] is malformed",
                self.acceptance_low, self.acceptance_high
            )));
        }
        if !(self.exponent.is_finite() && self.exponent > 0.0) {
            return Err(Error::Config(format!(
                "calibration exponent must be positive, got {}",
                self.exponent
            )));
        }
        // delta = 0 sends the factor to 0 at 0% and to inf at 100% acceptance
        if !(self.delta.is_finite() && self.delta > 0.0) {
            return Err(Error::Config(format!(
                "calibration delta must be positive, got {}",
                self.delta
            )));
        }
        if self.n_iterations == 0 || self.max_loops == 0 || self.burnin >= self.n_iterations {
            return Err(Error::Config(format!(
                "calibration needs n_iterations > burnin ({} <= {}) and max_loops > 0",
                self.n_iterations, self.burnin
            )));
        }
        Ok(())
    }
}

/// A parameter's starting value: one shared value, or one value per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Scalar(f64),
    PerChannel(Vec<f64>),
}

/// One row of the parameter grid as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamConfig {
    /// Short name, e.g. `RD1`.
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    pub value: ParamValue,
    /// Sampled when true, held fixed otherwise.
    #[serde(default)]
    pub fit: bool,
    /// One free value per channel when true, one shared value otherwise.
    #[serde(default)]
    pub chromatic: bool,
    #[serde(default)]
    pub prior: PriorSpec,
    /// Forced Gibbs step size.
    #[serde(default)]
    pub beta: Option<f64>,
}

impl ParamConfig {
    pub fn fixed(name: &str, value: f64) -> Self {
        Self {
            name: name.to_string(),
            full_name: None,
            value: ParamValue::Scalar(value),
            fit: false,
            chromatic: false,
            prior: PriorSpec::default(),
            beta: None,
        }
    }

    pub fn fitted(name: &str, value: f64, prior: PriorSpec) -> Self {
        Self {
            fit: true,
            prior,
            ..Self::fixed(name, value)
        }
    }

    pub fn chromatic(mut self) -> Self {
        self.chromatic = true;
        self
    }

    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = Some(beta);
        self
    }

    pub fn with_full_name(mut self, full_name: &str) -> Self {
        self.full_name = Some(full_name.to_string());
        self
    }

    pub fn full_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or(&self.name)
    }

    /// The value of every channel.
    pub fn values(&self, n_channel: usize) -> Result<Vec<f64>> {
        match &self.value {
            ParamValue::Scalar(v) => Ok(vec![*v; n_channel]),
            ParamValue::PerChannel(vs) if vs.len() == n_channel => Ok(vs.clone()),
            ParamValue::PerChannel(vs) => Err(Error::Config(format!(
                "{} has {} per-channel values but the data has {n_channel} channels",
                self.name,
                vs.len()
            ))),
        }
    }
}

/// A complete fit description: sampler settings, parameters and step-size overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub params: Vec<ParamConfig>,
    /// Step sizes keyed by short parameter name; these take precedence over
    /// each parameter's own `beta`.
    #[serde(default)]
    pub step_sizes: BTreeMap<String, f64>,
}

impl FitConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: FitConfig = toml::from_str(s)?;
        cfg.run.validate()?;
        Ok(cfg)
    }
}
