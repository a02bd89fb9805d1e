//! Co-simulation of EV charging sites and a distribution feeder.

/// EV charging sessions, networks, scheduling and the result cache.
pub mod acn;
pub mod cli;
pub mod composite;
pub mod config;
pub mod error;
/// Feeder time series, circuit engines and voltage telemetry.
pub mod grid;
pub mod io;
pub mod logging;
pub mod plot;
pub mod runner;
pub mod solar;
pub mod translate;

pub use error::{Error, Result};
