//! Parallel MCMC fitting of a parametric model to multi-channel time series.

pub mod calibrate;
pub mod chain;
pub mod config;
pub mod data;
pub mod error;
pub mod fit;
pub mod io;
pub mod likelihood;
mod persist;
pub mod priors;
pub mod proposal;
pub mod results;
pub mod sampler;
pub mod state;
pub mod stats;

pub use error::{Error, Result};
