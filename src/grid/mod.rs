//! Distribution feeder side of the co-simulation.

pub mod dss;
pub mod engine;
pub mod experiment;
pub mod kpi;
pub mod loads;
pub mod telemetry;

pub use dss::DssScriptEngine;
pub use engine::{CircuitEngine, ReportKind, ReportTable};
pub use experiment::{FeederConfig, FeederExperiment};
pub use kpi::VoltageKpiReport;
pub use loads::LoadTable;
pub use telemetry::{EnvelopePoint, FeederTelemetry, TimeTable};
