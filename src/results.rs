/*!
Posterior summaries of a merged chain.

One [`ResultRow`] is produced per free entry, in free-vector order. Chromatic
entries carry the mean wavelength of their channel. Depending on the
[`ResultMode`] a row holds the peak of a kernel density estimate with its
one-sigma envelope, the sigma percentiles of the chain, or both.

Derived quantities, computed by a caller closure from full parameter states,
can be appended as extra rows. They are evaluated on random chain rows drawn
without replacement and summarized with percentiles only.
*/

use log::info;
use ndarray::{Array1, Array2, Axis};
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::chain::Chain;
use crate::config::ResultMode;
use crate::error::{Error, Result};
use crate::sampler::Sampler;
use crate::state::FitState;
use crate::stats::{kde_mode, percentiles, SIGMA_PERCENTILES};

/// Grid points of the density estimate behind the mode columns.
pub const KDE_GRID: usize = 512;

/// Random chain rows used for derived quantities unless told otherwise.
pub const DEFAULT_DERIVED_SAMPLES: usize = 10_000;

/// Summary of one free entry or one derived quantity in one channel.
///
/// Columns that the result mode did not ask for are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub name: String,
    pub short_name: String,
    pub wave_center: Option<f64>,
    pub mode: Option<f64>,
    pub mode_upper: Option<f64>,
    pub mode_lower: Option<f64>,
    pub p50: Option<f64>,
    pub p16: Option<f64>,
    pub p84: Option<f64>,
    pub p50_upper: Option<f64>,
    pub p50_lower: Option<f64>,
}

impl ResultRow {
    fn new(name: &str, short_name: &str, wave_center: Option<f64>) -> Self {
        Self {
            name: name.to_owned(),
            short_name: short_name.to_owned(),
            wave_center,
            mode: None,
            mode_upper: None,
            mode_lower: None,
            p50: None,
            p16: None,
            p84: None,
            p50_upper: None,
            p50_lower: None,
        }
    }

    fn fill_percentiles(&mut self, values: Array1<f64>) -> Result<()> {
        let p = percentiles(values.view(), &SIGMA_PERCENTILES)?;
        let (p16, p50, p84) = (p[0], p[1], p[2]);
        self.p16 = Some(p16);
        self.p50 = Some(p50);
        self.p84 = Some(p84);
        self.p50_upper = Some(p84 - p50);
        self.p50_lower = Some(p50 - p16);
        Ok(())
    }

    fn fill_mode(&mut self, values: Array1<f64>) -> Result<()> {
        let kde = kde_mode(values.view(), KDE_GRID)
            .ok_or_else(|| Error::Shape(format!("no finite samples of {}", self.short_name)))?;
        self.mode = Some(kde.mode);
        self.mode_upper = Some((kde.upper - kde.mode).abs());
        self.mode_lower = Some((kde.mode - kde.lower).abs());
        Ok(())
    }

    /// `name=value+upper-lower` for the requested estimate, if present.
    pub fn format(&self, kind: ResultMode) -> Option<String> {
        let (value, upper, lower) = match kind {
            ResultMode::Percentile => (self.p50?, self.p50_upper?, self.p50_lower?),
            _ => (self.mode?, self.mode_upper?, self.mode_lower?),
        };
        let channel = self
            .wave_center
            .map(|w| format!(" [{w:.3} um]"))
            .unwrap_or_default();
        Some(format!("{}{channel}={value:.8}+{upper:.8}-{lower:.8}", self.name))
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultsTable {
    pub rows: Vec<ResultRow>,
    pub mode: ResultMode,
}

impl ResultsTable {
    /// Summarizes a merged chain from row `start` on.
    pub fn from_chain(chain: &Chain, state: &FitState, mode: ResultMode, start: usize) -> Result<Self> {
        if chain.n_free() != state.n_free() {
            return Err(Error::Shape(format!(
                "chain has {} free values, state has {}",
                chain.n_free(),
                state.n_free()
            )));
        }
        let samples = chain.states.slice(ndarray::s![start.min(chain.len()).., ..]);
        if samples.nrows() == 0 {
            return Err(Error::Shape("no chain rows to summarize".into()));
        }
        let wave_centers = state.data().wave_centers();

        let mut rows = Vec::with_capacity(state.n_free());
        for (i, column) in samples.axis_iter(Axis(1)).enumerate() {
            let wave_center = state.free_channel(i).map(|c| wave_centers[c]);
            let mut row = ResultRow::new(
                &state.free_full_names()[i],
                &state.free_names()[i],
                wave_center,
            );
            match wave_center {
                Some(w) => info!("calculating results for {} {w:.3} um", row.short_name),
                None => info!("calculating results for {}", row.short_name),
            }
            if mode.wants_mode() {
                row.fill_mode(column.to_owned())?;
            }
            if mode.wants_percentile() {
                row.fill_percentiles(column.to_owned())?;
            }
            rows.push(row);
        }
        Ok(Self { rows, mode })
    }

    /// Summarizes the merged chain of a finished run with its configured
    /// result mode.
    pub fn from_sampler(sampler: &Sampler, start: usize) -> Result<Self> {
        Self::from_chain(
            sampler.chain(),
            sampler.template(),
            sampler.config().result_mode,
            start,
        )
    }

    /// Appends one row per channel for a quantity derived from full states.
    ///
    /// `derive` receives `template` with its free vector replaced by a chain
    /// row and returns one value per channel. `n_samples` rows are drawn
    /// without replacement, fewer if the chain is shorter. Mode columns stay
    /// `None`.
    pub fn add_derived<F>(
        &mut self,
        chain: &Chain,
        template: &FitState,
        name: &str,
        short_name: &str,
        n_samples: usize,
        seed: u64,
        derive: F,
    ) -> Result<()>
    where
        F: Fn(&FitState) -> Array1<f64>,
    {
        if chain.is_empty() {
            return Err(Error::Shape("no chain rows to derive from".into()));
        }
        let n_channel = template.n_channel();
        let n = n_samples.min(chain.len());
        let mut rng = SmallRng::seed_from_u64(seed);
        let picks = index::sample(&mut rng, chain.len(), n);

        let mut state = template.clone();
        let mut derived = Array2::zeros((n, n_channel));
        for (k, row) in picks.iter().enumerate() {
            state.set_free_from_row(chain.states.row(row))?;
            let values = derive(&state);
            if values.len() != n_channel {
                return Err(Error::Shape(format!(
                    "{short_name} returned {} values for {n_channel} channels",
                    values.len()
                )));
            }
            derived.row_mut(k).assign(&values);
        }

        let wave_centers = template.data().wave_centers();
        for (c, column) in derived.axis_iter(Axis(1)).enumerate() {
            let mut row = ResultRow::new(name, short_name, Some(wave_centers[c]));
            if self.mode.wants_percentile() {
                row.fill_percentiles(column.to_owned())?;
            }
            self.rows.push(row);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows whose short or full name is `name`.
    pub fn find<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ResultRow> + 'a {
        self.rows
            .iter()
            .filter(move |r| r.short_name == name || r.name == name)
    }

    /// Logs one line per row for `kind` (`Mode` or `Percentile`), optionally
    /// restricted to rows named `key`.
    pub fn log_summary(&self, kind: ResultMode, key: Option<&str>) -> Result<()> {
        if let Some(key) = key {
            if self.find(key).next().is_none() {
                return Err(Error::Config(format!("no result named {key}")));
            }
        }
        for row in &self.rows {
            if key.is_some_and(|k| row.short_name != k && row.name != k) {
                continue;
            }
            if let Some(line) = row.format(kind) {
                info!("\t{line}");
            }
        }
        Ok(())
    }
}
