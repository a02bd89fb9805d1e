//! EV charging side of the co-simulation.

pub mod algorithms;
pub mod events;
pub mod experiment;
pub mod network;
pub mod optimizer;
pub mod simulator;
pub mod sources;
pub mod tariff;

pub use algorithms::{SchedulingPolicy, SolverBackend};
pub use events::{ChargingSession, EventQueue};
pub use experiment::{AcnExperiment, AcnExperimentConfig};
pub use network::{ChargingNetwork, Site};
pub use simulator::{SimulationResult, Simulator};
pub use sources::{AcnDataClient, EventSource, SyntheticEvents};
pub use tariff::TimeOfUseTariff;
