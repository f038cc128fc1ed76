/*!
# Parameter state

[`FitState`] holds every model parameter as a `[n_param, n_channel]` grid (the
*full* view) together with the flattened vector of only the sampled values
(the *free* view). A fitted parameter contributes either one free value shared
by all channels, or one free value per channel when it is chromatic.

The two views are kept consistent by construction: the free vector can only be
changed through methods that project the change onto the grid.

```rust
use std::sync::Arc;
use ndarray::{arr1, Array2};
use tfit_mcmc::config::ParamConfig;
use tfit_mcmc::data::InputData;
use tfit_mcmc::priors::{PriorRegistry, PriorSpec};
use tfit_mcmc::state::FitState;

let data = InputData::from_flux(
    arr1(&[0.0, 1.0, 2.0]).view(),
    arr1(&[1.0, 2.0]).view(),
    Array2::ones((2, 3)),
    Array2::from_elem((2, 3), 0.01),
).unwrap();
let params = vec![
    ParamConfig::fitted("RD1", 0.1, PriorSpec::uniform(0.0, 1.0)).chromatic(),
    ParamConfig::fitted("BB", 0.3, PriorSpec::uniform(0.0, 1.0)),
    ParamConfig::fixed("P1", 3.5),
];
let state = FitState::new(&params, Arc::new(data), &PriorRegistry::default()).unwrap();
// two channels of RD1 plus one shared BB
assert_eq!(state.n_free(), 3);
assert_eq!(state.free_names(), ["RD1", "RD1", "BB"]);
```
*/

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::config::{FitConfig, ParamConfig};
use crate::data::InputData;
use crate::error::{Error, Result};
use crate::persist;
use crate::priors::{Prior, PriorRegistry, PriorSpec, REJECT};

/// Which free entries the last proposal touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveIndex {
    /// Single-parameter Gibbs step on this free index.
    Gibbs(usize),
    /// Differential-evolution jump of the whole free vector.
    VectorJump,
}

/// Immutable description of the parameter grid and its free view, shared
/// between every copy of a state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Layout {
    names: Vec<String>,
    full_names: Vec<String>,
    fit_mask: Vec<bool>,
    channel_mask: Vec<bool>,
    /// Resolved prior of each parameter, `None` for fixed parameters without one.
    priors: Vec<Option<Prior>>,
    forced_beta: Vec<Option<f64>>,

    free_names: Vec<String>,
    free_full_names: Vec<String>,
    free_priors: Vec<Prior>,
    free_forced_beta: Vec<Option<f64>>,
    /// Grid cell each free entry is read back from.
    free_origin: Vec<(usize, usize)>,
    /// Grid cells each free entry writes to.
    free_to_full: Vec<Vec<(usize, usize)>>,
    /// Free entry controlling each grid cell.
    full_to_free: Array2<Option<usize>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitState {
    data: Arc<InputData>,
    layout: Arc<Layout>,
    full_grid: Array2<f64>,
    free_vector: Array1<f64>,
    step_size: Array1<f64>,
    /// Log-posterior of the current state.
    pub log_likelihood: f64,
    pub last_move: MoveIndex,
}

impl FitState {
    /// Builds the grid from parameter rows and the free view from it.
    ///
    /// Every fitted parameter must carry a resolvable prior. Step sizes are
    /// initialised with [`FitState::assign_step_size`] and no overrides.
    pub fn new(
        params: &[ParamConfig],
        data: Arc<InputData>,
        registry: &PriorRegistry,
    ) -> Result<Self> {
        Self::build(params, data, registry, &BTreeMap::new())
    }

    /// Builds the state of a [`FitConfig`], applying its step-size overrides.
    pub fn from_config(
        config: &FitConfig,
        data: Arc<InputData>,
        registry: &PriorRegistry,
    ) -> Result<Self> {
        Self::build(&config.params, data, registry, &config.step_sizes)
    }

    fn build(
        params: &[ParamConfig],
        data: Arc<InputData>,
        registry: &PriorRegistry,
        overrides: &BTreeMap<String, f64>,
    ) -> Result<Self> {
        if params.is_empty() {
            return Err(Error::Config("no parameters given".into()));
        }
        let n_channel = data.n_channel();
        let mut seen = HashSet::new();
        let mut full_grid = Array2::zeros((params.len(), n_channel));
        let mut priors = Vec::with_capacity(params.len());
        for (row, p) in params.iter().enumerate() {
            if !seen.insert(p.name.as_str()) {
                return Err(Error::Config(format!("parameter {} is defined twice", p.name)));
            }
            full_grid.row_mut(row).assign(&Array1::from(p.values(n_channel)?));
            let has_spec = p.prior != PriorSpec::default();
            let prior = if p.fit || has_spec {
                Some(registry.resolve(&p.prior, &p.name)?)
            } else {
                None
            };
            priors.push(prior);
            if let Some(beta) = p.beta {
                if !(beta.is_finite() && beta >= 0.0) {
                    return Err(Error::Config(format!(
                        "{}: forced step size must be finite and non-negative, got {beta}",
                        p.name
                    )));
                }
            }
        }

        let mut layout = Layout {
            names: params.iter().map(|p| p.name.clone()).collect(),
            full_names: params.iter().map(|p| p.full_name().to_string()).collect(),
            fit_mask: params.iter().map(|p| p.fit).collect(),
            channel_mask: params.iter().map(|p| p.chromatic).collect(),
            priors,
            forced_beta: params.iter().map(|p| p.beta).collect(),
            free_names: Vec::new(),
            free_full_names: Vec::new(),
            free_priors: Vec::new(),
            free_forced_beta: Vec::new(),
            free_origin: Vec::new(),
            free_to_full: Vec::new(),
            full_to_free: Array2::from_elem((params.len(), n_channel), None),
        };
        layout.build_free_view(n_channel)?;

        let mut state = Self {
            data,
            layout: Arc::new(layout),
            full_grid,
            free_vector: Array1::zeros(0),
            step_size: Array1::zeros(0),
            log_likelihood: REJECT,
            last_move: MoveIndex::VectorJump,
        };
        state.update_free_from_full();
        state.assign_step_size(overrides)?;
        Ok(state)
    }

    /// Rebuilds the free view from the current fit and channel masks.
    ///
    /// Free values are read from the full grid, so the grid is the source of
    /// truth across this call. Step sizes are reset.
    pub fn get_fitted_params(&mut self) -> Result<()> {
        self.rebuild((*self.layout).clone())
    }

    /// Switches a parameter between fitted and fixed and rebuilds the free view.
    ///
    /// The state is left untouched when the rebuilt view is invalid.
    pub fn set_fit(&mut self, name: &str, fit: bool) -> Result<()> {
        let row = self.require_param(name)?;
        let mut layout = (*self.layout).clone();
        layout.fit_mask[row] = fit;
        self.rebuild(layout)
    }

    fn rebuild(&mut self, mut layout: Layout) -> Result<()> {
        layout.build_free_view(self.n_channel())?;
        let previous = std::mem::replace(&mut self.layout, Arc::new(layout));
        self.update_free_from_full();
        if let Err(e) = self.assign_step_size(&BTreeMap::new()) {
            self.layout = previous;
            self.update_free_from_full();
            return Err(e);
        }
        Ok(())
    }

    /// Writes every free value into all the grid cells it controls.
    pub fn update_full_from_free(&mut self) {
        for (cells, &value) in self.layout.free_to_full.iter().zip(&self.free_vector) {
            for &cell in cells {
                self.full_grid[cell] = value;
            }
        }
    }

    /// Reads every free value back from its grid cell.
    pub fn update_free_from_full(&mut self) {
        self.free_vector = self
            .layout
            .free_origin
            .iter()
            .map(|&cell| self.full_grid[cell])
            .collect();
    }

    /// Initialises step sizes.
    ///
    /// For each free entry, in order of precedence: `overrides` keyed by the
    /// short parameter name, the parameter's forced step size, one third of
    /// its prior range. A non-uniform prior with neither override nor forced
    /// value has no range and is a configuration error.
    pub fn assign_step_size(&mut self, overrides: &BTreeMap<String, f64>) -> Result<()> {
        let layout = &self.layout;
        let mut step = Array1::zeros(self.free_vector.len());
        for (i, slot) in step.iter_mut().enumerate() {
            let name = &layout.free_names[i];
            *slot = if let Some(&beta) = overrides.get(name) {
                beta
            } else if let Some(beta) = layout.free_forced_beta[i] {
                beta
            } else if let Some((lo, hi)) = layout.free_priors[i].range() {
                (hi - lo) / 3.0
            } else {
                return Err(Error::Config(format!(
                    "{name} has a {:?} prior without a range; set its step size explicitly",
                    layout.free_priors[i]
                )));
            };
            if !(slot.is_finite() && *slot >= 0.0) {
                return Err(Error::Config(format!("{name}: invalid step size {slot}")));
            }
        }
        self.step_size = step;
        Ok(())
    }

    pub fn data(&self) -> &InputData {
        &self.data
    }

    pub fn shared_data(&self) -> Arc<InputData> {
        Arc::clone(&self.data)
    }

    pub fn n_param(&self) -> usize {
        self.full_grid.nrows()
    }

    pub fn n_channel(&self) -> usize {
        self.full_grid.ncols()
    }

    pub fn n_free(&self) -> usize {
        self.free_vector.len()
    }

    pub fn full_grid(&self) -> ArrayView2<'_, f64> {
        self.full_grid.view()
    }

    /// Every parameter's value in one channel, the forward model's input.
    pub fn channel_column(&self, channel: usize) -> ArrayView1<'_, f64> {
        self.full_grid.column(channel)
    }

    pub fn free_vector(&self) -> ArrayView1<'_, f64> {
        self.free_vector.view()
    }

    pub fn step_size(&self) -> ArrayView1<'_, f64> {
        self.step_size.view()
    }

    pub fn set_step_size(&mut self, step_size: Array1<f64>) -> Result<()> {
        if step_size.len() != self.n_free() {
            return Err(Error::Shape(format!(
                "step size has {} entries, state has {} free values",
                step_size.len(),
                self.n_free()
            )));
        }
        self.step_size = step_size;
        Ok(())
    }

    /// Sets one free value and projects it onto the grid.
    pub fn set_free_value(&mut self, index: usize, value: f64) {
        self.free_vector[index] = value;
        for &cell in &self.layout.free_to_full[index] {
            self.full_grid[cell] = value;
        }
    }

    /// Adds `scale * jump` to the free vector and projects it onto the grid.
    pub fn apply_jump(&mut self, jump: ArrayView1<f64>, scale: f64) {
        self.free_vector.scaled_add(scale, &jump);
        self.update_full_from_free();
    }

    /// Restores a free vector previously taken from this state.
    pub(crate) fn restore_free(&mut self, free: Array1<f64>) {
        debug_assert_eq!(free.len(), self.n_free());
        self.free_vector = free;
        self.update_full_from_free();
    }

    /// Replaces the free vector with a chain row and projects it onto the grid.
    pub fn set_free_from_row(&mut self, row: ArrayView1<f64>) -> Result<()> {
        if row.len() != self.n_free() {
            return Err(Error::Shape(format!(
                "chain row has {} entries, state has {} free values",
                row.len(),
                self.n_free()
            )));
        }
        self.free_vector.assign(&row);
        self.update_full_from_free();
        Ok(())
    }

    pub fn names(&self) -> &[String] {
        &self.layout.names
    }

    pub fn full_names(&self) -> &[String] {
        &self.layout.full_names
    }

    pub fn fit_mask(&self) -> &[bool] {
        &self.layout.fit_mask
    }

    pub fn channel_mask(&self) -> &[bool] {
        &self.layout.channel_mask
    }

    pub fn free_names(&self) -> &[String] {
        &self.layout.free_names
    }

    pub fn free_full_names(&self) -> &[String] {
        &self.layout.free_full_names
    }

    pub fn free_priors(&self) -> &[Prior] {
        &self.layout.free_priors
    }

    /// `(parameter row, channel)` a free entry is read from.
    pub fn free_origin(&self, index: usize) -> (usize, usize) {
        self.layout.free_origin[index]
    }

    /// All grid cells a free entry controls.
    pub fn free_cells(&self, index: usize) -> &[(usize, usize)] {
        &self.layout.free_to_full[index]
    }

    /// Free entry controlling a grid cell, if the cell is sampled.
    pub fn free_index_of(&self, param: usize, channel: usize) -> Option<usize> {
        self.layout.full_to_free[(param, channel)]
    }

    /// Channel of a free entry when its parameter varies per channel.
    pub fn free_channel(&self, index: usize) -> Option<usize> {
        let (row, channel) = self.layout.free_origin[index];
        self.layout.channel_mask[row].then_some(channel)
    }

    pub fn param_row(&self, name: &str) -> Option<usize> {
        self.layout.names.iter().position(|n| n == name)
    }

    /// The grid row of a parameter, one value per channel.
    pub fn get(&self, name: &str) -> Result<ArrayView1<'_, f64>> {
        let row = self.require_param(name)?;
        Ok(self.full_grid.row(row))
    }

    fn require_param(&self, name: &str) -> Result<usize> {
        self.param_row(name)
            .ok_or_else(|| Error::Config(format!("unknown parameter {name}")))
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

impl Layout {
    fn build_free_view(&mut self, n_channel: usize) -> Result<()> {
        self.free_names.clear();
        self.free_full_names.clear();
        self.free_priors.clear();
        self.free_forced_beta.clear();
        self.free_origin.clear();
        self.free_to_full.clear();
        self.full_to_free.fill(None);

        for row in 0..self.names.len() {
            if !self.fit_mask[row] {
                continue;
            }
            let prior = self.priors[row].ok_or_else(|| {
                Error::Config(format!("{} is fitted but has no prior", self.names[row]))
            })?;
            let groups: Vec<Vec<usize>> = if self.channel_mask[row] {
                (0..n_channel).map(|c| vec![c]).collect()
            } else {
                vec![(0..n_channel).collect()]
            };
            for channels in groups {
                let index = self.free_origin.len();
                self.free_names.push(self.names[row].clone());
                self.free_full_names.push(self.full_names[row].clone());
                self.free_priors.push(prior);
                self.free_forced_beta.push(self.forced_beta[row]);
                self.free_origin.push((row, channels[0]));
                for &c in &channels {
                    self.full_to_free[(row, c)] = Some(index);
                }
                self.free_to_full
                    .push(channels.into_iter().map(|c| (row, c)).collect());
            }
        }
        Ok(())
    }
}
