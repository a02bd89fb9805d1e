//! Crate-wide error type.

use std::io;
use std::path::PathBuf;

use crate::config::ConfigError;

/// Errors raised while building, running, or post-processing a co-simulation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown charging site `{0}` (expected `caltech` or `jpl`)")]
    UnknownSite(String),

    #[error("unknown scheduling algorithm `{0}`")]
    UnknownAlgorithm(String),

    #[error("unknown tariff `{0}`")]
    UnknownTariff(String),

    #[error("unknown solver backend `{0}`")]
    UnknownSolver(String),

    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),

    #[error("local time {0} does not exist in the simulation timezone")]
    NonexistentLocalTime(chrono::NaiveDateTime),

    #[error("cannot parse timestamp `{0}`")]
    BadTimestamp(String),

    #[error("{context}: `{value}` is not a number")]
    BadValue { context: String, value: String },

    #[error("{}: no column `{column}`", path.display())]
    MissingColumn { path: PathBuf, column: String },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("ACN-Data request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("schedule optimization failed: {0}")]
    Solver(String),

    #[error("circuit engine failed: {0}")]
    Engine(String),

    #[error("no baseline load rows in {} between {start} and {end}", path.display())]
    NoBaselineData {
        path: PathBuf,
        start: chrono::NaiveDateTime,
        end: chrono::NaiveDateTime,
    },

    #[error("load series for `{name}` has {available} samples, need {needed}")]
    SeriesTooShort {
        name: String,
        needed: usize,
        available: usize,
    },

    #[error("EV experiment `{0}` has not been run yet")]
    SimulationNotRun(String),

    #[error("no EV experiment registered under `{0}`")]
    UnknownExperiment(String),

    #[error("plot rendering failed: {0}")]
    Plot(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
