//! Quasi-static time series run of the distribution feeder.

use std::path::PathBuf;

use chrono::{NaiveDateTime, TimeDelta};
use num_complex::Complex64;
use tracing::{debug, info};

use super::engine::{CircuitEngine, ReportKind};
use super::loads::LoadTable;
use super::telemetry::FeederTelemetry;
use crate::error::{Error, Result};

/// Topology files redirected into the engine, in order. `RegControl` is
/// skipped when regulator control is off.
const CIRCUIT_FILES: &[&str] = &[
    "Vsource",
    "SubTransformer",
    "RegControl",
    "DistriTransformer",
    "Linecode",
    "Line",
    "CircuitBreaker",
    "Load",
    "Capacitor",
];

/// Regulators whose tap and winding are recorded every step.
pub const REGULATORS: [&str; 3] = ["sub_regulator_a", "sub_regulator_b", "sub_regulator_c"];

#[derive(Debug, Clone, PartialEq)]
pub struct FeederConfig {
    pub start: NaiveDateTime,
    /// Simulated span (minutes).
    pub horizon: u32,
    /// Step length (minutes).
    pub period: u32,
    pub reg_control: bool,
    /// Directory with the `*.dss` topology files.
    pub circuit_dir: PathBuf,
    /// Directory with `iowa_nodal_P.csv` and `iowa_nodal_Q.csv`.
    pub load_dir: PathBuf,
}

impl FeederConfig {
    pub fn end(&self) -> NaiveDateTime {
        self.start + TimeDelta::minutes(i64::from(self.horizon))
    }

    pub fn steps(&self) -> usize {
        (self.horizon / self.period.max(1)) as usize
    }
}

/// Steps a [`CircuitEngine`] over the horizon, injecting baseline and added
/// loads and recording telemetry.
pub struct FeederExperiment<E: CircuitEngine> {
    config: FeederConfig,
    engine: E,
    p: LoadTable,
    q: LoadTable,
    telemetry: FeederTelemetry,
}

impl<E: CircuitEngine> FeederExperiment<E> {
    /// Reads the baseline loads for the window and builds the circuit once.
    ///
    /// # Errors
    ///
    /// Returns an error if the baseline CSVs are missing or empty for the
    /// window, or the engine rejects the circuit.
    pub fn new(config: FeederConfig, engine: E) -> Result<Self> {
        let end = config.end() + TimeDelta::hours(1);
        let p = LoadTable::read_window(
            &config.load_dir.join("iowa_nodal_P.csv"),
            config.start,
            end,
            config.period,
        )?;
        let q = LoadTable::read_window(
            &config.load_dir.join("iowa_nodal_Q.csv"),
            config.start,
            end,
            config.period,
        )?;
        Self::with_loads(config, engine, p, q)
    }

    /// Like [`FeederExperiment::new`] with baseline tables already in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the engine rejects the circuit.
    pub fn with_loads(config: FeederConfig, engine: E, p: LoadTable, q: LoadTable) -> Result<Self> {
        let mut experiment = Self {
            config,
            engine,
            p,
            q,
            telemetry: FeederTelemetry::default(),
        };
        experiment.build_circuit()?;
        Ok(experiment)
    }

    pub fn config(&self) -> &FeederConfig {
        &self.config
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Real power table (kW).
    pub fn p(&self) -> &LoadTable {
        &self.p
    }

    /// Reactive power table (kvar).
    pub fn q(&self) -> &LoadTable {
        &self.q
    }

    pub fn telemetry(&self) -> &FeederTelemetry {
        &self.telemetry
    }

    /// Rebuilds the test feeder from its topology files.
    ///
    /// # Errors
    ///
    /// Returns any engine failure.
    pub fn build_circuit(&mut self) -> Result<()> {
        self.engine.run_command("Clear")?;
        self.engine.run_command("New Circuit.240_node_test_system")?;
        for file in CIRCUIT_FILES {
            if *file == "RegControl" && !self.config.reg_control {
                continue;
            }
            let path = self.config.circuit_dir.join(format!("{file}.dss"));
            self.engine.run_command(&format!("Redirect {}", path.display()))?;
        }
        self.engine.run_command("New EnergyMeter.FeederB Line.L_2001_2002 1")?;
        self.engine.run_command("Set VoltageBases = \"69.0, 13.8, 0.208\"")?;
        self.engine.run_command("CalcVoltageBases")
    }

    /// Adds `series[offset..offset + steps]` to every named load: the real
    /// part onto P, the imaginary part onto Q. Negative values model
    /// generation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SeriesTooShort`] if the series ends before
    /// `offset + steps`.
    pub fn add_load(
        &mut self,
        names: &[String],
        series: &[Complex64],
        offset: usize,
    ) -> Result<()> {
        let steps = self.config.steps();
        let window = series
            .get(offset..offset + steps)
            .ok_or_else(|| Error::SeriesTooShort {
                name: names.join(","),
                needed: offset + steps,
                available: series.len(),
            })?;
        let real: Vec<f64> = window.iter().map(|s| s.re).collect();
        let imag: Vec<f64> = window.iter().map(|s| s.im).collect();
        for name in names {
            self.p.add(name, &real);
            self.q.add(name, &imag);
        }
        debug!(loads = ?names, offset, steps, "added load");
        Ok(())
    }

    /// Sets every engine load to its defined power plus the table value at
    /// row `t`; loads without a column are switched off.
    ///
    /// # Errors
    ///
    /// Returns any engine failure.
    pub fn step_loads(&mut self, t: usize) -> Result<()> {
        for name in self.engine.load_names() {
            let kw = match self.p.get(&name, t) {
                Some(p) => self.engine.load_kw(&name)? + p,
                None => 0.0,
            };
            self.engine.set_load_kw(&name, kw)?;

            let kvar = match self.q.get(&name, t) {
                Some(q) => self.engine.load_kvar(&name)? + q,
                None => 0.0,
            };
            self.engine.set_load_kvar(&name, kvar)?;
        }
        Ok(())
    }

    /// Records |V| (p.u.) of every `bus.node`.
    ///
    /// # Errors
    ///
    /// Returns any engine failure.
    pub fn store_voltages(&mut self, time: NaiveDateTime) -> Result<()> {
        for bus in self.engine.bus_names()? {
            let nodes = self.engine.bus_nodes(&bus)?;
            let volts = self.engine.bus_pu_voltages(&bus)?;
            for (node, v) in nodes.iter().zip(volts) {
                self.telemetry
                    .voltage_pu
                    .insert(time, format!("{bus}.{node}"), v.norm());
            }
        }
        Ok(())
    }

    /// Records tap and active winding of the substation regulators.
    ///
    /// # Errors
    ///
    /// Returns any engine failure.
    pub fn store_transformer_info(&mut self, time: NaiveDateTime) -> Result<()> {
        for name in self.engine.transformer_names() {
            if !REGULATORS.contains(&name.as_str()) {
                continue;
            }
            let tap = self.engine.transformer_tap(&name)?;
            let wdg = self.engine.transformer_wdg(&name)?;
            self.telemetry.taps.insert(time, name.clone(), tap);
            self.telemetry.wdg.insert(time, name, wdg);
        }
        Ok(())
    }

    /// Runs every step of the horizon. With `detailed_metrics` the five
    /// engine reports are also kept per step.
    ///
    /// # Errors
    ///
    /// Stops at the first engine failure. Returns
    /// [`Error::SeriesTooShort`] if the baseline tables do not cover the
    /// horizon.
    pub fn run(&mut self, detailed_metrics: bool) -> Result<()> {
        let steps = self.config.steps();
        for (name, table) in [("baseline load", &self.p), ("baseline reactive load", &self.q)] {
            if table.len() < steps {
                return Err(Error::SeriesTooShort {
                    name: name.into(),
                    needed: steps,
                    available: table.len(),
                });
            }
        }
        info!(
            start = %self.config.start,
            steps,
            period = self.config.period,
            detailed_metrics,
            "running feeder"
        );
        for t in 0..steps {
            self.build_circuit()?;
            self.step_loads(t)?;
            self.engine.run_command("Solve")?;
            let time = self.p.index()[t];
            self.store_voltages(time)?;
            self.store_transformer_info(time)?;
            if detailed_metrics {
                for kind in ReportKind::ALL {
                    let table = self.engine.export_report(kind)?;
                    self.telemetry.record_report(kind, time, table);
                }
            }
            debug!(step = t, %time, "feeder step solved");
        }
        info!(steps, "feeder run finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::grid::engine::ReportTable;
    use crate::grid::loads::parse_timestamp;

    /// Records commands; every bus voltage equals 1 + total load kW / 1000.
    #[derive(Default)]
    struct RecordingEngine {
        commands: Vec<String>,
        loads: BTreeMap<String, (f64, f64)>,
        solved_kw: f64,
    }

    impl CircuitEngine for RecordingEngine {
        fn run_command(&mut self, command: &str) -> Result<()> {
            self.commands.push(command.to_string());
            if command == "Clear" {
                self.loads = [
                    ("load_1".to_string(), (1.0, 0.5)),
                    ("load_2".to_string(), (2.0, 1.0)),
                ]
                .into_iter()
                .collect();
            }
            if command == "Solve" {
                self.solved_kw = self.loads.values().map(|(p, _)| p).sum();
            }
            Ok(())
        }
        fn load_names(&self) -> Vec<String> {
            self.loads.keys().cloned().collect()
        }
        fn load_kw(&self, name: &str) -> Result<f64> {
            Ok(self.loads[name].0)
        }
        fn load_kvar(&self, name: &str) -> Result<f64> {
            Ok(self.loads[name].1)
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
            Ok(vec!["bus_1".into()])
        }
        fn bus_nodes(&self, _bus: &str) -> Result<Vec<u32>> {
            Ok(vec![1, 2])
        }
        fn bus_pu_voltages(&self, _bus: &str) -> Result<Vec<Complex64>> {
            let v = 1.0 + self.solved_kw / 1000.0;
            Ok(vec![Complex64::new(v, 0.0), Complex64::new(0.0, -v)])
        }
        fn transformer_names(&self) -> Vec<String> {
            vec!["sub_xfmr".into(), "sub_regulator_a".into()]
        }
        fn transformer_tap(&self, _name: &str) -> Result<f64> {
            Ok(1.0)
        }
        fn transformer_wdg(&self, _name: &str) -> Result<u32> {
            Ok(2)
        }
        fn export_report(&mut self, _kind: ReportKind) -> Result<ReportTable> {
            Ok(ReportTable::default())
        }
    }

    fn config(reg_control: bool) -> FeederConfig {
        FeederConfig {
            start: parse_timestamp("2019-07-01 00:00").expect("start"),
            horizon: 15,
            period: 5,
            reg_control,
            circuit_dir: PathBuf::from("feeder"),
            load_dir: PathBuf::from("data"),
        }
    }

    fn tables(cfg: &FeederConfig) -> (LoadTable, LoadTable) {
        let index: Vec<NaiveDateTime> = (0..4)
            .map(|k| cfg.start + TimeDelta::minutes(5 * k))
            .collect();
        let p = LoadTable::new(
            index.clone(),
            [("load_1".to_string(), vec![10.0, 20.0, 30.0, 40.0])].into_iter().collect(),
        );
        let q = LoadTable::new(index, BTreeMap::new());
        (p, q)
    }

    fn experiment(reg_control: bool) -> FeederExperiment<RecordingEngine> {
        let cfg = config(reg_control);
        let (p, q) = tables(&cfg);
        FeederExperiment::with_loads(cfg, RecordingEngine::default(), p, q).expect("experiment")
    }

    #[test]
    fn circuit_build_follows_fixed_sequence() {
        let ex = experiment(true);
        let cmds = &ex.engine().commands;
        assert_eq!(cmds[0], "Clear");
        assert_eq!(cmds[1], "New Circuit.240_node_test_system");
        assert!(cmds[2].ends_with("Vsource.dss"));
        assert!(cmds[4].ends_with("RegControl.dss"));
        assert_eq!(cmds[cmds.len() - 3], "New EnergyMeter.FeederB Line.L_2001_2002 1");
        assert_eq!(cmds[cmds.len() - 1], "CalcVoltageBases");
        assert_eq!(cmds.len(), 14);

        let without = experiment(false);
        assert!(!without.engine().commands.iter().any(|c| c.contains("RegControl")));
        assert_eq!(without.engine().commands.len(), 13);
    }

    #[test]
    fn step_loads_adds_table_values_and_zeroes_missing_loads() {
        let mut ex = experiment(true);
        ex.step_loads(1).expect("step");
        let loads = &ex.engine().loads;
        assert_eq!(loads["load_1"], (21.0, 0.0));
        assert_eq!(loads["load_2"], (0.0, 0.0));
    }

    #[test]
    fn add_load_shifts_by_offset_and_accumulates() {
        let mut ex = experiment(true);
        let series: Vec<Complex64> = (0..6).map(|k| Complex64::new(k as f64, -1.0)).collect();
        ex.add_load(&["load_2".to_string()], &series, 2).expect("add");
        ex.add_load(&["load_2".to_string()], &series, 2).expect("add");
        assert_eq!(ex.p().column("load_2"), Some(&[4.0, 6.0, 8.0, 0.0][..]));
        assert_eq!(ex.q().column("load_2"), Some(&[-2.0, -2.0, -2.0, 0.0][..]));

        let err = ex.add_load(&["load_2".to_string()], &series, 4);
        assert!(matches!(
            err,
            Err(Error::SeriesTooShort { needed: 7, available: 6, .. })
        ));
    }

    #[test]
    fn run_records_voltages_and_regulators_per_step() {
        let mut ex = experiment(true);
        ex.run(true).expect("run");
        let tel = ex.telemetry();
        assert_eq!(tel.voltage_pu.len(), 3);
        let t1 = ex.p().index()[1];
        // load_1 = 1 + 20 kW, load_2 switched off.
        for node in ["bus_1.1", "bus_1.2"] {
            let v = tel.voltage_pu.get(t1, node).copied().expect("voltage");
            assert!((v - 1.021).abs() < 1e-12, "{node}: {v}");
        }
        assert_eq!(tel.taps.names(), vec!["sub_regulator_a"]);
        assert_eq!(tel.wdg.get(t1, "sub_regulator_a"), Some(&2));
        assert_eq!(tel.reports.len(), 5);
        assert_eq!(ex.engine().commands.iter().filter(|c| *c == "Solve").count(), 3);
    }

    #[test]
    fn short_reactive_table_is_rejected_before_solving() {
        let cfg = config(true);
        let (p, _) = tables(&cfg);
        let q = LoadTable::new(p.index()[..2].to_vec(), BTreeMap::new());
        let mut ex = FeederExperiment::with_loads(cfg, RecordingEngine::default(), p, q)
            .expect("experiment");

        let err = ex.run(false);
        assert!(matches!(
            err,
            Err(Error::SeriesTooShort { ref name, needed: 3, available: 2 })
                if name == "baseline reactive load"
        ));
        assert!(!ex.engine().commands.iter().any(|c| c == "Solve"));
    }

    #[test]
    fn run_without_detailed_metrics_skips_reports() {
        let mut ex = experiment(false);
        ex.run(false).expect("run");
        assert!(ex.telemetry().reports.is_empty());
    }
}
