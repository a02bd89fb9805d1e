//! Shared test fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use num_complex::Complex64;

use ev_grid_cosim::acn::events::{ChargingSession, EventQueue};
use ev_grid_cosim::acn::sources::{EventRequest, EventSource};
use ev_grid_cosim::config::{CosimConfig, EvConfig, EventsConfig, FeederRunConfig};
use ev_grid_cosim::grid::{CircuitEngine, ReportKind, ReportTable};
use ev_grid_cosim::{Error, Result};

/// Buses of the fake feeder; each hosts balanced and per-phase EV loads.
pub const BUSES: [&str; 2] = ["1003", "2002"];

/// Baseline load present on every bus (kW).
pub const BASE_KW: f64 = 50.0;

pub fn at(hour: u32, minute: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2019, 7, 1)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .expect("valid time")
}

/// In-memory circuit: one voltage per bus, dropping 1e-4 p.u. per kW of
/// load on that bus. Keeps the highest kW ever applied per load.
#[derive(Debug, Default)]
pub struct FakeEngine {
    pub commands: Vec<String>,
    loads: BTreeMap<String, (f64, f64)>,
    solved: BTreeMap<String, f64>,
    pub peak_kw: BTreeMap<String, f64>,
    pub fail_on_solve: bool,
}

impl FakeEngine {
    /// Engine whose every solve fails.
    pub fn failing() -> Self {
        Self {
            fail_on_solve: true,
            ..Self::default()
        }
    }

    fn define_loads(&mut self) {
        self.loads.clear();
        for bus in BUSES {
            self.loads.insert(format!("load_{bus}"), (0.0, 0.0));
            for phase in ['a', 'b', 'c'] {
                self.loads.insert(format!("load_{bus}_{phase}"), (0.0, 0.0));
            }
            self.loads.insert(format!("base_{bus}"), (BASE_KW, 10.0));
        }
    }

    fn bus_kw(&self, bus: &str) -> f64 {
        self.loads
            .iter()
            .filter(|(name, _)| name.ends_with(bus) || name.contains(&format!("_{bus}_")))
            .map(|(_, (kw, _))| kw)
            .sum()
    }
}

impl CircuitEngine for FakeEngine {
    fn run_command(&mut self, command: &str) -> Result<()> {
        self.commands.push(command.to_string());
        match command {
            "Clear" => self.define_loads(),
            "Solve" if self.fail_on_solve => {
                return Err(Error::Engine("solution did not converge".into()));
            }
            "Solve" => {
                for bus in BUSES {
                    let kw = self.bus_kw(bus);
                    self.solved.insert(bus.to_string(), 1.0 - kw * 1e-4);
                }
                for (name, (kw, _)) in &self.loads {
                    let peak = self.peak_kw.entry(name.clone()).or_insert(f64::MIN);
                    *peak = peak.max(*kw);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn load_names(&self) -> Vec<String> {
        self.loads.keys().cloned().collect()
    }

    fn load_kw(&self, name: &str) -> Result<f64> {
        self.loads
            .get(name)
            .map(|l| l.0)
            .ok_or_else(|| Error::Engine(format!("no load {name}")))
    }

    fn load_kvar(&self, name: &str) -> Result<f64> {
        self.loads
            .get(name)
            .map(|l| l.1)
            .ok_or_else(|| Error::Engine(format!("no load {name}")))
    }

    fn set_load_kw(&mut self, name: &str, kw: f64) -> Result<()> {
        if let Some(l) = self.loads.get_mut(name) {
            l.0 = kw;
        }
        Ok(())
    }

    fn set_load_kvar(&mut self, name: &str, kvar: f64) -> Result<()> {
        if let Some(l) = self.loads.get_mut(name) {
            l.1 = kvar;
        }
        Ok(())
    }

    fn bus_names(&self) -> Result<Vec<String>> {
        Ok(BUSES.iter().map(|b| b.to_string()).collect())
    }

    fn bus_nodes(&self, _bus: &str) -> Result<Vec<u32>> {
        Ok(vec![1, 2, 3])
    }

    fn bus_pu_voltages(&self, bus: &str) -> Result<Vec<Complex64>> {
        let v = self.solved.get(bus).copied().unwrap_or(1.0);
        Ok(vec![
            Complex64::from_polar(v, 0.0),
            Complex64::from_polar(v, (-120f64).to_radians()),
            Complex64::from_polar(v, 120f64.to_radians()),
        ])
    }

    fn transformer_names(&self) -> Vec<String> {
        vec!["sub_regulator_a".into(), "feeder_xfmr".into()]
    }

    fn transformer_tap(&self, _name: &str) -> Result<f64> {
        Ok(1.00625)
    }

    fn transformer_wdg(&self, _name: &str) -> Result<u32> {
        Ok(2)
    }

    fn export_report(&mut self, kind: ReportKind) -> Result<ReportTable> {
        ReportTable::from_reader(format!("Element,Value\n{kind},1\n").as_bytes())
    }
}

/// Returns the same queue for every request.
pub struct FixedEvents(pub EventQueue);

impl EventSource for FixedEvents {
    fn generate_events(&self, _request: &EventRequest<'_>) -> Result<EventQueue> {
        Ok(self.0.clone())
    }
}

/// Fails every request; proves a cache hit when an experiment still succeeds.
pub struct UnreachableSource;

impl EventSource for UnreachableSource {
    fn generate_events(&self, request: &EventRequest<'_>) -> Result<EventQueue> {
        Err(Error::Engine(format!("event source called for {}", request.site)))
    }
}

pub fn session(
    id: &str,
    station: &str,
    arrival: usize,
    departure: usize,
    kwh: f64,
) -> ChargingSession {
    ChargingSession {
        session_id: id.to_string(),
        station_id: station.to_string(),
        arrival,
        departure,
        requested_energy_kwh: kwh,
        max_rate_amps: 32.0,
    }
}

/// Three Caltech sessions over the first two hours.
pub fn caltech_queue() -> EventQueue {
    EventQueue::from_sessions([
        session("s1", "CA-301", 0, 12, 5.0),
        session("s2", "CA-302", 2, 22, 10.0),
        session("s3", "CA-303", 6, 24, 3.0),
    ])
}

/// Hourly baseline P and Q tables with one `base_1003` column.
pub fn write_baseline(dir: &Path, hours: u32) {
    fs::create_dir_all(dir).expect("load dir");
    for (file, value) in [("iowa_nodal_P.csv", 5.0), ("iowa_nodal_Q.csv", 1.0)] {
        let mut csv = String::from("time,base_1003\n");
        for h in 0..=hours {
            let t = at(0, 0) + TimeDelta::hours(i64::from(h));
            csv.push_str(&format!("{},{}\n", t.format("%Y-%m-%d %H:%M:%S"), value));
        }
        fs::write(dir.join(file), csv).expect("baseline csv");
    }
}

/// One-hour feeder run coupled to two synthetic EV experiments whose
/// vehicles are all plugged in from the first step. Files live under `dir`.
pub fn cosim_config(dir: &Path) -> CosimConfig {
    write_baseline(&dir.join("loads"), 4);
    let ev = |id: &str, bus: &str, site: &str| EvConfig {
        id: id.to_string(),
        bus: bus.to_string(),
        site: site.to_string(),
        start: at(0, 0),
        end: at(2, 0),
        events_dir: dir.join("events"),
        sim_dir: dir.join("sims"),
        ..EvConfig::default()
    };
    CosimConfig {
        feeder: FeederRunConfig {
            start: at(0, 0),
            horizon: 60,
            period: 5,
            circuit_dir: dir.join("circuit"),
            load_dir: dir.join("loads"),
            ..FeederRunConfig::default()
        },
        events: EventsConfig {
            source: "synthetic".into(),
            stations: 4,
            dwell_steps_min: 24,
            dwell_steps_max: 24,
            ..EventsConfig::default()
        },
        ev: vec![ev("caltech_1003", "1003", "caltech"), ev("jpl_2002", "2002", "jpl")],
        ..CosimConfig::demo()
    }
}
