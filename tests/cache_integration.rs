mod common;

use common::{FixedEvents, UnreachableSource, at, caltech_queue};
use ev_grid_cosim::acn::events::EventQueue;
use ev_grid_cosim::acn::experiment::{AcnExperiment, AcnExperimentConfig};
use ev_grid_cosim::acn::simulator::SimulationResult;
use ev_grid_cosim::acn::sources::EventSource;
use std::path::Path;

fn config(dir: &Path, alg: &str) -> AcnExperimentConfig {
    let mut config =
        AcnExperimentConfig::new("caltech", at(0, 0), at(2, 0), alg, "sce_tou_ev_4_march_2019");
    config.events_dir = dir.join("events");
    config.sim_dir = dir.join("sims");
    config
}

fn experiment(config: AcnExperimentConfig, source: impl EventSource + 'static) -> AcnExperiment {
    AcnExperiment::new(config, Box::new(source)).expect("experiment")
}

#[test]
fn cache_file_names_follow_convention() {
    let dir = tempfile::tempdir().expect("tempdir");
    let exp = experiment(config(dir.path(), "unctrl"), UnreachableSource);

    // 00:00 PDT is 07:00 UTC.
    assert_eq!(
        exp.events_filename(),
        dir.path()
            .join("events")
            .join("site-caltech_start-20190701T070000_end-20190701T090000.json")
    );
    assert_eq!(
        exp.sim_filename(),
        dir.path().join("sims").join(
            "site-caltech_start-20190701T070000_end-20190701T090000\
             _alg_name-unctrl_tariff_name-sce_tou_ev_4_march_2019_external_load_name-\
             _bus_transformer_cap-225.json"
        )
    );
}

#[test]
fn uncontrolled_run_delivers_requested_energy_and_is_cached() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut first = experiment(config(dir.path(), "unctrl"), FixedEvents(caltech_queue()));
    let result = first.get_or_run().expect("run").clone();

    assert_eq!(result.steps(), 24);
    assert!((result.energy_delivered_kwh() - 18.0).abs() < 1e-6);
    assert!(first.events_filename().exists());
    assert!(first.sim_filename().exists());

    // A second experiment with the same inputs never asks for events.
    let mut second = experiment(config(dir.path(), "unctrl"), UnreachableSource);
    assert_eq!(second.get_or_run().expect("cache hit"), &result);
}

#[test]
fn cached_events_are_reused_across_algorithms() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first = experiment(config(dir.path(), "unctrl"), FixedEvents(caltech_queue()));
    let events = first.get_events().expect("generate");

    let mut llf = experiment(config(dir.path(), "llf"), UnreachableSource);
    assert_eq!(llf.get_events().expect("cached"), events);
    let result = llf.get_or_run().expect("llf run");
    assert!(result.energy_delivered_kwh() > 0.0);
    assert_eq!(result.algorithm, "llf");
}

#[test]
fn external_load_changes_only_the_simulation_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let plain = experiment(config(dir.path(), "load_flattening"), UnreachableSource);

    let mut with_load = config(dir.path(), "load_flattening");
    with_load.external_load = Some(vec![120.0; 24]);
    let loaded = experiment(with_load.clone(), UnreachableSource);

    with_load.external_load = Some(vec![150.0; 24]);
    let other = experiment(with_load, UnreachableSource);

    assert_eq!(plain.events_filename(), loaded.events_filename());
    assert_ne!(plain.sim_filename(), loaded.sim_filename());
    assert_ne!(loaded.sim_filename(), other.sim_filename());
}

#[test]
fn transformer_rating_is_not_served_from_another_ratings_cache() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut large = experiment(config(dir.path(), "load_flattening"), FixedEvents(caltech_queue()));
    large.get_or_run().expect("run");

    let mut small_config = config(dir.path(), "load_flattening");
    small_config.bus_transformer_capacity_kva = 10.0;
    let small = experiment(small_config, UnreachableSource);
    assert_eq!(small.events_filename(), large.events_filename());
    assert_ne!(small.sim_filename(), large.sim_filename());
    assert!(!small.sim_filename().exists());
}

#[test]
fn results_survive_json_round_trip() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut exp = experiment(config(dir.path(), "llf"), FixedEvents(caltech_queue()));
    let result = exp.get_or_run().expect("run").clone();

    let reread = SimulationResult::from_json(&exp.sim_filename()).expect("read back");
    assert_eq!(reread, result);
    let events = EventQueue::from_json(&exp.events_filename()).expect("events");
    assert_eq!(events, caltech_queue());
}

#[test]
fn unknown_names_are_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut exp = experiment(config(dir.path(), "greedy"), FixedEvents(caltech_queue()));
    assert!(exp.get_or_run().is_err());

    let mut bad_site = config(dir.path(), "unctrl");
    bad_site.site = "mars".into();
    assert!(AcnExperiment::new(bad_site, Box::new(UnreachableSource)).is_err());
}
