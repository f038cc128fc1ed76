//! Error types shared across the crate.
//!
//! Only setup and storage problems are errors. A rejected trial state is
//! signalled with [`crate::priors::REJECT`] and a run that never converges
//! ends in [`crate::sampler::RunStatus::LoopExhausted`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed parameter specification, unknown prior name,
    /// inconsistent run settings.
    #[error("configuration error: {0}")]
    Config(String),

    /// Input tables whose dimensions do not agree with each other or with
    /// the parameter grid.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// Failure writing or reading a persisted state, chain or result table.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// The walker thread pool could not be started.
    #[error("runtime error: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for Error {
    fn from(e: rayon::ThreadPoolBuildError) -> Self {
        Error::Runtime(format!("failed to create thread pool: {e}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(feature = "csv")]
impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}
