/*!
Scalar priors on fitted parameters.

A prior maps a parameter value to an additive contribution to the log-density,
or to [`REJECT`] when the value lies outside the prior's support. Priors are
named in the run configuration (`func = "gaussian"`) and resolved exactly once,
when the [`FitState`](crate::state::FitState) is built, into a [`Prior`] value
that is cached per free parameter. Sampling never looks a prior up by name.

# Examples

```rust
use std::collections::BTreeMap;
use tfit_mcmc::priors::{PriorRegistry, PriorSpec, REJECT};

let registry = PriorRegistry::default();
let spec = PriorSpec {
    func: Some("uniform".to_string()),
    args: BTreeMap::from([("minimum".to_string(), 0.0), ("maximum".to_string(), 10.0)]),
};
let prior = registry.resolve(&spec, "RD1").unwrap();
assert_eq!(prior.log_prob(5.0), 0.0);
assert_eq!(prior.log_prob(-1.0), REJECT);
```
*/

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Log-density of a state that violates a prior or produces a non-finite likelihood.
pub const REJECT: f64 = f64::NEG_INFINITY;

/// Name used when a parameter specifies no prior function.
pub const DEFAULT_PRIOR: &str = "uniform";

/// Uniform prior: `0` inside `[minimum, maximum]`, [`REJECT`] outside.
pub fn uniform_prior(value: f64, minimum: f64, maximum: f64) -> f64 {
    if !(minimum..=maximum).contains(&value) {
        return REJECT;
    }
    0.0
}

/// Gaussian prior in log space, `-((value - mu) / sigma)^2`.
pub fn gaussian_prior(value: f64, mu: f64, sigma: f64) -> f64 {
    -((value - mu) / sigma).powi(2)
}

/// Gaussian prior with hard bounds `[vmin, vmax]`.
pub fn trunc_gaussian_prior(value: f64, mu: f64, sigma: f64, vmin: f64, vmax: f64) -> f64 {
    if !(vmin..=vmax).contains(&value) {
        return REJECT;
    }
    gaussian_prior(value, mu, sigma)
}

/// A resolved prior, cached on each free parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Prior {
    Uniform { minimum: f64, maximum: f64 },
    Gaussian { mu: f64, sigma: f64 },
    TruncatedGaussian { mu: f64, sigma: f64, vmin: f64, vmax: f64 },
}

impl Prior {
    /// Log-density contribution of `value`, or [`REJECT`].
    ///
    /// NaN is outside every support.
    pub fn log_prob(&self, value: f64) -> f64 {
        if value.is_nan() {
            return REJECT;
        }
        match *self {
            Prior::Uniform { minimum, maximum } => uniform_prior(value, minimum, maximum),
            Prior::Gaussian { mu, sigma } => gaussian_prior(value, mu, sigma),
            Prior::TruncatedGaussian {
                mu,
                sigma,
                vmin,
                vmax,
            } => trunc_gaussian_prior(value, mu, sigma, vmin, vmax),
        }
    }

    /// The allowed range used to derive a default step size.
    ///
    /// Only uniform priors define one.
    pub fn range(&self) -> Option<(f64, f64)> {
        match *self {
            Prior::Uniform { minimum, maximum } => Some((minimum, maximum)),
            _ => None,
        }
    }
}

/// Prior as written in configuration: a function name plus named arguments.
///
/// In TOML: `prior = { func = "tgaussian", mu = 0.1, sigma = 0.01, vmin = 0.0, vmax = 1.0 }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriorSpec {
    #[serde(default)]
    pub func: Option<String>,
    #[serde(flatten)]
    pub args: BTreeMap<String, f64>,
}

impl PriorSpec {
    pub fn uniform(minimum: f64, maximum: f64) -> Self {
        Self::named("uniform", &[("minimum", minimum), ("maximum", maximum)])
    }

    pub fn gaussian(mu: f64, sigma: f64) -> Self {
        Self::named("gaussian", &[("mu", mu), ("sigma", sigma)])
    }

    pub fn trunc_gaussian(mu: f64, sigma: f64, vmin: f64, vmax: f64) -> Self {
        Self::named(
            "tgaussian",
            &[("mu", mu), ("sigma", sigma), ("vmin", vmin), ("vmax", vmax)],
        )
    }

    pub fn named(func: &str, args: &[(&str, f64)]) -> Self {
        Self {
            func: Some(func.to_string()),
            args: args.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }
}

/// Builds a [`Prior`] from the named arguments of a [`PriorSpec`].
pub type PriorBuilder = fn(&BTreeMap<String, f64>) -> Result<Prior>;

/// Name to builder mapping used to resolve [`PriorSpec`]s.
///
/// The default registry knows `uniform`, `gaussian` and `tgaussian`.
/// Further names (aliases, or stricter variants of the built-in priors)
/// are added with [`PriorRegistry::register`].
#[derive(Clone)]
pub struct PriorRegistry {
    builders: HashMap<String, PriorBuilder>,
}

impl Default for PriorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            builders: HashMap::new(),
        };
        registry.register("uniform", build_uniform);
        registry.register("gaussian", build_gaussian);
        registry.register("tgaussian", build_trunc_gaussian);
        registry
    }
}

impl PriorRegistry {
    pub fn register(&mut self, name: &str, builder: PriorBuilder) {
        self.builders.insert(name.to_string(), builder);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Resolves `spec` for the parameter called `param`.
    ///
    /// A spec without `func` falls back to [`DEFAULT_PRIOR`]. Unknown names,
    /// missing or unexpected arguments and malformed bounds are configuration
    /// errors.
    pub fn resolve(&self, spec: &PriorSpec, param: &str) -> Result<Prior> {
        let name = spec.func.as_deref().unwrap_or(DEFAULT_PRIOR);
        let builder = self.builders.get(name).ok_or_else(|| {
            let mut known: Vec<&str> = self.builders.keys().map(String::as_str).collect();
            known.sort_unstable();
            Error::Config(format!(
                "prior.func = {name:?} for {param} is not registered; must be one of: {}",
                known.join(", ")
            ))
        })?;
        builder(&spec.args).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{param}: {msg}")),
            other => other,
        })
    }
}

fn take_args<const N: usize>(
    prior: &str,
    args: &BTreeMap<String, f64>,
    keys: [&str; N],
) -> Result<[f64; N]> {
    if let Some(extra) = args.keys().find(|k| !keys.contains(&k.as_str())) {
        return Err(Error::Config(format!(
            "unexpected argument {extra:?} for {prior} prior (expected {})",
            keys.join(", ")
        )));
    }
    let mut out = [0.0; N];
    for (slot, key) in out.iter_mut().zip(keys) {
        *slot = *args
            .get(key)
            .ok_or_else(|| Error::Config(format!("{prior} prior requires argument {key:?}")))?;
        if slot.is_nan() {
            return Err(Error::Config(format!("{prior} prior argument {key:?} is NaN")));
        }
    }
    Ok(out)
}

fn build_uniform(args: &BTreeMap<String, f64>) -> Result<Prior> {
    let [minimum, maximum] = take_args("uniform", args, ["minimum", "maximum"])?;
    if minimum >= maximum {
        return Err(Error::Config(format!(
            "uniform prior needs minimum < maximum, got [{minimum}, {maximum}]"
        )));
    }
    Ok(Prior::Uniform { minimum, maximum })
}

fn build_gaussian(args: &BTreeMap<String, f64>) -> Result<Prior> {
    let [mu, sigma] = take_args("gaussian", args, ["mu", "sigma"])?;
    if sigma <= 0.0 {
        return Err(Error::Config(format!(
            "gaussian prior needs sigma > 0, got {sigma}"
        )));
    }
    Ok(Prior::Gaussian { mu, sigma })
}

fn build_trunc_gaussian(args: &BTreeMap<String, f64>) -> Result<Prior> {
    let [mu, sigma, vmin, vmax] = take_args("tgaussian", args, ["mu", "sigma", "vmin", "vmax"])?;
    if sigma <= 0.0 {
        return Err(Error::Config(format!(
            "tgaussian prior needs sigma > 0, got {sigma}"
        )));
    }
    if vmin >= vmax {
        return Err(Error::Config(format!(
            "tgaussian prior needs vmin < vmax, got [{vmin}, {vmax}]"
        )));
    }
    Ok(Prior::TruncatedGaussian {
        mu,
        sigma,
        vmin,
        vmax,
    })
}
