//! Couples EV experiments to buses of a feeder experiment.

use std::collections::BTreeMap;
use std::path::Path;

use num_complex::Complex64;
use tracing::info;

use crate::acn::experiment::AcnExperiment;
use crate::error::{Error, Result};
use crate::grid::engine::CircuitEngine;
use crate::grid::experiment::FeederExperiment;
use crate::plot::{self, VoltagePlotOptions};
use crate::translate;

/// An EV experiment attached to a feeder bus.
pub struct BusExperiment {
    pub bus: String,
    pub experiment: AcnExperiment,
}

/// EV charging plus feeder co-simulation.
pub struct CompositeExperiment<E: CircuitEngine> {
    acn: BTreeMap<String, BusExperiment>,
    feeder: FeederExperiment<E>,
    unbalanced: bool,
    /// Steps of the EV series skipped before injecting into the feeder.
    ev_load_offset: usize,
}

impl<E: CircuitEngine> CompositeExperiment<E> {
    pub fn new(feeder: FeederExperiment<E>, unbalanced: bool, ev_load_offset: usize) -> Self {
        Self {
            acn: BTreeMap::new(),
            feeder,
            unbalanced,
            ev_load_offset,
        }
    }

    /// Registers an EV experiment under `id`, feeding `bus`.
    pub fn insert_acn(
        &mut self,
        id: impl Into<String>,
        bus: impl Into<String>,
        experiment: AcnExperiment,
    ) {
        self.acn.insert(
            id.into(),
            BusExperiment {
                bus: bus.into(),
                experiment,
            },
        );
    }

    pub fn acn_ids(&self) -> impl Iterator<Item = &str> {
        self.acn.keys().map(String::as_str)
    }

    pub fn acn(&self, id: &str) -> Option<&BusExperiment> {
        self.acn.get(id)
    }

    pub fn feeder(&self) -> &FeederExperiment<E> {
        &self.feeder
    }

    /// Buses that host an EV experiment, sorted and deduplicated.
    pub fn acn_buses(&self) -> Vec<String> {
        let mut buses: Vec<String> = self.acn.values().map(|b| b.bus.clone()).collect();
        buses.sort();
        buses.dedup();
        buses
    }

    /// Runs (or loads from cache) every EV experiment.
    ///
    /// # Errors
    ///
    /// Stops at the first failing experiment.
    pub fn run_acn(&mut self) -> Result<()> {
        for (id, entry) in &mut self.acn {
            let result = entry.experiment.get_or_run()?;
            info!(
                id = %id,
                bus = %entry.bus,
                energy_kwh = result.energy_delivered_kwh(),
                "EV experiment ready"
            );
        }
        Ok(())
    }

    /// Injects the EV load of experiment `id` into its bus.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownExperiment`] for an unknown id,
    /// [`Error::SimulationNotRun`] before [`CompositeExperiment::run_acn`],
    /// and [`Error::SeriesTooShort`] if the EV series does not cover the
    /// feeder horizon after the offset.
    pub fn add_acn_load(&mut self, id: &str) -> Result<()> {
        let entry = self
            .acn
            .get(id)
            .ok_or_else(|| Error::UnknownExperiment(id.to_string()))?;
        let result = entry
            .experiment
            .result()
            .ok_or_else(|| Error::SimulationNotRun(id.to_string()))?;

        let loads = if self.unbalanced {
            translate::unbalanced_loads(result, &entry.bus)
        } else {
            vec![translate::balanced_load(result, &entry.bus)]
        };
        for (name, series) in loads {
            self.feeder.add_load(&[name], &series, self.ev_load_offset)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// See [`CompositeExperiment::add_acn_load`].
    pub fn add_acn_loads(&mut self) -> Result<()> {
        let ids: Vec<String> = self.acn.keys().cloned().collect();
        for id in ids {
            self.add_acn_load(&id)?;
        }
        Ok(())
    }

    /// Adds a balanced time-varying load on `load_<bus>`; negative values
    /// model generation such as rooftop solar.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SeriesTooShort`] if `load` does not cover the horizon.
    pub fn add_general_load(&mut self, bus: &str, load: &[f64], offset: usize) -> Result<()> {
        let series: Vec<Complex64> = load.iter().map(|&p| Complex64::new(p, 0.0)).collect();
        self.feeder
            .add_load(&[format!("load_{bus}")], &series, offset)
    }

    /// Adds `load` to each of `buses`, or to every EV bus when `None`.
    ///
    /// # Errors
    ///
    /// See [`CompositeExperiment::add_general_load`].
    pub fn add_general_loads(
        &mut self,
        load: &[f64],
        offset: usize,
        buses: Option<&[String]>,
    ) -> Result<()> {
        let buses = match buses {
            Some(b) => b.to_vec(),
            None => self.acn_buses(),
        };
        for bus in &buses {
            self.add_general_load(bus, load, offset)?;
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns the first engine failure.
    pub fn run_dss(&mut self, detailed_metrics: bool) -> Result<()> {
        self.feeder.run(detailed_metrics)
    }

    /// Renders the feeder's voltage envelope to an SVG file.
    ///
    /// # Errors
    ///
    /// Returns an error if rendering or writing fails.
    pub fn plot_dss_voltages(&self, path: &Path, title: Option<&str>, legend: bool) -> Result<()> {
        let options = VoltagePlotOptions {
            title: title.map(str::to_string),
            legend,
            ..VoltagePlotOptions::default()
        };
        plot::write_voltage_svg(&self.feeder.telemetry().voltage_envelope(), &options, path)
    }
}
