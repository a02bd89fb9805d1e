//! Config-driven construction and execution of co-simulations and sweeps.

use std::path::PathBuf;

use tracing::info;

use crate::acn::experiment::{AcnExperiment, AcnExperimentConfig};
use crate::composite::CompositeExperiment;
use crate::config::{CosimConfig, SweepConfig};
use crate::error::Result;
use crate::grid::engine::CircuitEngine;
use crate::grid::experiment::FeederExperiment;

/// Algorithm that only runs with the first configured tariff.
const SINGLE_TARIFF_ALGORITHM: &str = "min_cost";

/// Builds the composite experiment: one EV experiment per `[[ev]]` entry and
/// a feeder experiment on `engine`. Nothing is simulated yet.
///
/// # Errors
///
/// Returns an error if an EV entry is invalid or the baseline loads cannot be
/// read.
pub fn build_cosim<E: CircuitEngine>(
    config: &CosimConfig,
    engine: E,
) -> Result<CompositeExperiment<E>> {
    let feeder = FeederExperiment::new(config.feeder.to_feeder_config(), engine)?;
    let mut composite =
        CompositeExperiment::new(feeder, config.cosim.unbalanced, config.cosim.ev_load_offset);
    for ev in &config.ev {
        let experiment =
            AcnExperiment::new(ev.to_experiment_config()?, config.events.event_source())?;
        composite.insert_acn(&ev.id, &ev.bus, experiment);
    }
    Ok(composite)
}

/// Runs the full pipeline: EV simulations, load injection and the feeder
/// time series.
///
/// # Errors
///
/// Returns the first error from any stage.
pub fn run_cosim<E: CircuitEngine>(
    config: &CosimConfig,
    engine: E,
) -> Result<CompositeExperiment<E>> {
    let mut composite = build_cosim(config, engine)?;
    composite.run_acn()?;
    composite.add_acn_loads()?;

    let feeder_config = config.feeder.to_feeder_config();
    for load in &config.general_load {
        let series = load.series(&feeder_config)?;
        info!(name = %load.name, kind = %load.kind, "adding general load");
        composite.add_general_loads(&series, load.offset, load.buses.as_deref())?;
    }

    composite.run_dss(config.cosim.detailed_metrics)?;
    Ok(composite)
}

/// One finished sweep combination.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepOutcome {
    pub site: String,
    pub alg_name: String,
    pub tariff_name: String,
    pub energy_delivered_kwh: f64,
    pub sim_path: PathBuf,
}

/// Site, algorithm and tariff combinations in run order.
pub fn sweep_combinations(sweep: &SweepConfig) -> Vec<(String, String, String)> {
    let mut combos = Vec::new();
    for site in &sweep.sites {
        for alg in &sweep.algorithms {
            let tariffs = if alg == SINGLE_TARIFF_ALGORITHM {
                &sweep.tariffs[..sweep.tariffs.len().min(1)]
            } else {
                &sweep.tariffs[..]
            };
            for tariff in tariffs {
                combos.push((site.clone(), alg.clone(), tariff.clone()));
            }
        }
    }
    combos
}

/// Runs every sweep combination through the result cache.
///
/// # Errors
///
/// Stops at the first combination that fails.
pub fn run_sweep(config: &CosimConfig) -> Result<Vec<SweepOutcome>> {
    let sweep = &config.sweep;
    let combos = sweep_combinations(sweep);
    info!(combinations = combos.len(), "starting sweep");

    let mut outcomes = Vec::with_capacity(combos.len());
    for (site, alg, tariff) in combos {
        let mut exp_config = AcnExperimentConfig::new(&site, sweep.start, sweep.end, &alg, &tariff);
        exp_config.sim_timezone = sweep.timezone.clone();
        exp_config.events_dir = sweep.events_dir.clone();
        exp_config.sim_dir = sweep.sim_dir.clone();

        let mut experiment = AcnExperiment::new(exp_config, config.events.event_source())?;
        let sim_path = experiment.sim_filename();
        let energy = experiment.get_or_run()?.energy_delivered_kwh();
        info!(
            %site,
            alg_name = %alg,
            tariff_name = %tariff,
            energy_kwh = energy,
            "sweep combination done"
        );
        outcomes.push(SweepOutcome {
            site,
            alg_name: alg,
            tariff_name: tariff,
            energy_delivered_kwh: energy,
            sim_path,
        });
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sweep_has_fourteen_combinations() {
        // 2 sites x (unctrl 3 + min_cost 1 + llf 3)
        let combos = sweep_combinations(&SweepConfig::default());
        assert_eq!(combos.len(), 14);
        let min_cost: Vec<_> = combos.iter().filter(|c| c.1 == "min_cost").collect();
        assert_eq!(min_cost.len(), 2);
        assert!(min_cost.iter().all(|c| c.2 == "sce_tou_ev_4_march_2019"));
    }

    #[test]
    fn sweep_order_is_site_then_algorithm_then_tariff() {
        let combos = sweep_combinations(&SweepConfig::default());
        assert_eq!(combos[0], ("jpl".into(), "unctrl".into(), "sce_tou_ev_4_march_2019".into()));
        assert_eq!(combos[3].1, "min_cost");
        assert_eq!(combos[7].0, "caltech");
    }

    #[test]
    fn empty_tariffs_yield_no_combinations() {
        let sweep = SweepConfig {
            tariffs: Vec::new(),
            ..SweepConfig::default()
        };
        assert!(sweep_combinations(&sweep).is_empty());
    }
}
