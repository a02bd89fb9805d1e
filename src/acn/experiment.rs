//! One EV charging experiment: configuration, cache files and execution.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use sha2::{Digest, Sha256};
use tracing::info;

use super::algorithms::SchedulingPolicy;
use super::events::EventQueue;
use super::network::{ChargingNetwork, Site};
use super::simulator::{SimulationResult, Simulator};
use super::sources::{EventRequest, EventSource, steps_between};
use super::tariff::TimeOfUseTariff;
use crate::error::{Error, Result};

/// Simulation step (minutes).
pub const PERIOD_MINUTES: u32 = 5;
/// EVSE voltage (V).
pub const VOLTAGE: f64 = 208.0;
/// Assumed maximum battery power of every EV (kW).
pub const DEFAULT_BATTERY_POWER_KW: f64 = 6.656;

pub const DEFAULT_TIMEZONE: &str = "America/Los_Angeles";

/// Inputs that determine an EV experiment's output.
#[derive(Debug, Clone, PartialEq)]
pub struct AcnExperimentConfig {
    pub site: String,
    /// Start of the window, local to `sim_timezone`.
    pub start: NaiveDateTime,
    /// End of the window, local to `sim_timezone`.
    pub end: NaiveDateTime,
    pub alg_name: String,
    pub tariff_name: String,
    /// Non-EV load on the bus transformer per step (kW).
    pub external_load: Option<Vec<f64>>,
    pub external_load_name: String,
    pub bus_transformer_capacity_kva: f64,
    pub events_dir: PathBuf,
    pub sim_dir: PathBuf,
    pub sim_timezone: String,
    /// Directory searched for `<tariff_name>.json` before the built-ins.
    pub tariff_dir: Option<PathBuf>,
}

impl AcnExperimentConfig {
    pub fn new(
        site: impl Into<String>,
        start: NaiveDateTime,
        end: NaiveDateTime,
        alg_name: impl Into<String>,
        tariff_name: impl Into<String>,
    ) -> Self {
        Self {
            site: site.into(),
            start,
            end,
            alg_name: alg_name.into(),
            tariff_name: tariff_name.into(),
            external_load: None,
            external_load_name: String::new(),
            bus_transformer_capacity_kva: 225.0,
            events_dir: PathBuf::from("events"),
            sim_dir: PathBuf::from("sims"),
            sim_timezone: DEFAULT_TIMEZONE.to_string(),
            tariff_dir: None,
        }
    }
}

/// Formats `t` as basic ISO-8601 in UTC, e.g. `20190701T070000`.
pub fn iso_format_basic<T: TimeZone>(t: &DateTime<T>) -> String {
    t.with_timezone(&Utc).format("%Y%m%dT%H%M%S").to_string()
}

/// Interprets `naive` as wall-clock time in the zone named `tz_name`.
///
/// Ambiguous times resolve to standard time.
///
/// # Errors
///
/// Returns an error for an unknown zone or a time skipped by a DST change.
pub fn localize(tz_name: &str, naive: NaiveDateTime) -> Result<DateTime<Tz>> {
    let tz: Tz = tz_name
        .parse()
        .map_err(|_| Error::UnknownTimezone(tz_name.to_string()))?;
    tz.from_local_datetime(&naive)
        .latest()
        .ok_or(Error::NonexistentLocalTime(naive))
}

/// First 16 hex digits of the SHA-256 of the series' little-endian bytes.
pub fn series_digest(series: &[f64]) -> String {
    let mut hasher = Sha256::new();
    for v in series {
        hasher.update(v.to_le_bytes());
    }
    short_hex(hasher)
}

/// First 16 hex digits of the SHA-256 of `bytes`.
pub fn bytes_digest(bytes: &[u8]) -> String {
    short_hex(Sha256::new_with_prefix(bytes))
}

fn short_hex(hasher: Sha256) -> String {
    hasher.finalize()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

/// Everything needed to run one simulation.
#[derive(Debug)]
pub struct PreparedSimulation {
    pub events: EventQueue,
    pub network: ChargingNetwork,
    pub policy: SchedulingPolicy,
    pub tariff: TimeOfUseTariff,
}

/// A cache-aware EV charging experiment.
pub struct AcnExperiment {
    config: AcnExperimentConfig,
    site: Site,
    start: DateTime<Tz>,
    end: DateTime<Tz>,
    source: Box<dyn EventSource>,
    result: Option<SimulationResult>,
}

impl AcnExperiment {
    /// Resolves the site and localizes the window.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown site or timezone, or a nonexistent
    /// local start or end time.
    pub fn new(config: AcnExperimentConfig, source: Box<dyn EventSource>) -> Result<Self> {
        let site: Site = config.site.parse()?;
        let start = localize(&config.sim_timezone, config.start)?;
        let end = localize(&config.sim_timezone, config.end)?;
        Ok(Self {
            config,
            site,
            start,
            end,
            source,
            result: None,
        })
    }

    pub fn config(&self) -> &AcnExperimentConfig {
        &self.config
    }

    pub fn site(&self) -> Site {
        self.site
    }

    pub fn start(&self) -> DateTime<Tz> {
        self.start
    }

    pub fn end(&self) -> DateTime<Tz> {
        self.end
    }

    /// Number of simulation steps between start and end.
    pub fn horizon(&self) -> usize {
        steps_between(self.start, self.end, PERIOD_MINUTES)
    }

    /// The simulation result, once [`AcnExperiment::get_or_run`] has succeeded.
    pub fn result(&self) -> Option<&SimulationResult> {
        self.result.as_ref()
    }

    fn window_stem(&self) -> String {
        format!(
            "site-{}_start-{}_end-{}",
            self.site,
            iso_format_basic(&self.start),
            iso_format_basic(&self.end)
        )
    }

    pub fn events_filename(&self) -> PathBuf {
        self.config
            .events_dir
            .join(format!("{}.json", self.window_stem()))
    }

    /// Cache file of the simulation.
    ///
    /// Besides the names, the key carries a digest of the external load, the
    /// bus transformer rating and a digest of any tariff override file, since
    /// each of them changes the schedule.
    pub fn sim_filename(&self) -> PathBuf {
        let mut name = format!(
            "{}_alg_name-{}_tariff_name-{}_external_load_name-{}",
            self.window_stem(),
            self.config.alg_name,
            self.config.tariff_name,
            self.config.external_load_name
        );
        if let Some(load) = &self.config.external_load {
            let _ = write!(name, "_external_load-{}", series_digest(load));
        }
        let _ = write!(name, "_bus_transformer_cap-{}", self.config.bus_transformer_capacity_kva);
        let tariff_file = TimeOfUseTariff::override_path(
            &self.config.tariff_name,
            self.config.tariff_dir.as_deref(),
        );
        // An unreadable override fails later in `get_tariff`.
        if let Some(bytes) = tariff_file.and_then(|p| fs::read(p).ok()) {
            let _ = write!(name, "_tariff-{}", bytes_digest(&bytes));
        }
        name.push_str(".json");
        self.config.sim_dir.join(name)
    }

    /// Loads cached events or generates and caches them.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache cannot be read or written or the event
    /// source fails.
    pub fn get_events(&self) -> Result<EventQueue> {
        let path = self.events_filename();
        if path.exists() {
            info!(path = %path.display(), "loading cached events");
            return EventQueue::from_json(&path);
        }
        let request = EventRequest {
            site: self.site.name(),
            start: self.start,
            end: self.end,
            period: PERIOD_MINUTES,
            voltage: VOLTAGE,
            max_battery_power_kw: DEFAULT_BATTERY_POWER_KW,
        };
        let events = self.source.generate_events(&request)?;
        create_parent(&path)?;
        events.to_json(&path)?;
        info!(path = %path.display(), events = events.len(), "cached events");
        Ok(events)
    }

    pub fn get_charging_network(&self, events: &EventQueue) -> ChargingNetwork {
        ChargingNetwork::for_site(self.site, VOLTAGE, &events.station_ids())
    }

    /// # Errors
    ///
    /// Returns [`Error::UnknownAlgorithm`] for an unsupported name.
    pub fn get_scheduling_algorithm(&self) -> Result<SchedulingPolicy> {
        SchedulingPolicy::from_name(
            &self.config.alg_name,
            self.config.bus_transformer_capacity_kva,
            self.config.external_load.as_deref(),
        )
    }

    /// # Errors
    ///
    /// Returns an error if the tariff is unknown or its file is unreadable.
    pub fn get_tariff(&self) -> Result<TimeOfUseTariff> {
        TimeOfUseTariff::load(&self.config.tariff_name, self.config.tariff_dir.as_deref())
    }

    /// Assembles events, network, policy and tariff.
    ///
    /// # Errors
    ///
    /// Propagates any failure of the individual builders.
    pub fn build(&self) -> Result<PreparedSimulation> {
        let policy = self.get_scheduling_algorithm()?;
        let tariff = self.get_tariff()?;
        let events = self.get_events()?;
        let network = self.get_charging_network(&events);
        Ok(PreparedSimulation {
            events,
            network,
            policy,
            tariff,
        })
    }

    /// Loads the cached simulation or builds, runs and caches it.
    ///
    /// # Errors
    ///
    /// Returns an error if building, simulating or caching fails.
    pub fn get_or_run(&mut self) -> Result<&SimulationResult> {
        let path = self.sim_filename();
        let result = if path.exists() {
            info!(path = %path.display(), "loading cached simulation");
            SimulationResult::from_json(&path)?
        } else {
            let prepared = self.build()?;
            info!(
                site = %self.site,
                algorithm = %self.config.alg_name,
                tariff = %self.config.tariff_name,
                events = prepared.events.len(),
                evses = prepared.network.evses.len(),
                "running EV simulation"
            );
            let result = Simulator::new(
                &prepared.network,
                &prepared.events,
                &prepared.policy,
                &prepared.tariff,
                self.start,
                PERIOD_MINUTES,
                self.horizon(),
            )
            .run(&self.config.alg_name)?;
            create_parent(&path)?;
            result.to_json(&path)?;
            result
        };
        Ok(self.result.insert(result))
    }
}

fn create_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acn::sources::SyntheticEvents;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid date")
    }

    fn config(site: &str, alg: &str) -> AcnExperimentConfig {
        AcnExperimentConfig::new(
            site,
            date(2019, 7, 1),
            date(2019, 7, 2),
            alg,
            "sce_tou_ev_4_march_2019",
        )
    }

    fn experiment(config: AcnExperimentConfig) -> AcnExperiment {
        AcnExperiment::new(config, Box::new(SyntheticEvents::default())).expect("experiment")
    }

    #[test]
    fn iso_basic_is_utc() {
        let start = localize(DEFAULT_TIMEZONE, date(2019, 7, 1)).expect("start");
        assert_eq!(iso_format_basic(&start), "20190701T070000");
    }

    #[test]
    fn filenames_follow_naming_scheme() {
        let mut cfg = config("caltech", "unctrl");
        cfg.events_dir = PathBuf::from("ev");
        cfg.sim_dir = PathBuf::from("sim");
        let ex = experiment(cfg);
        assert_eq!(
            ex.events_filename(),
            Path::new("ev/site-caltech_start-20190701T070000_end-20190702T070000.json")
        );
        assert_eq!(
            ex.sim_filename(),
            Path::new(
                "sim/site-caltech_start-20190701T070000_end-20190702T070000\
                 _alg_name-unctrl_tariff_name-sce_tou_ev_4_march_2019_external_load_name-\
                 _bus_transformer_cap-225.json"
            )
        );
    }

    #[test]
    fn external_load_contents_change_the_sim_filename() {
        let base = config("jpl", "load_flattening");
        let mut a = base.clone();
        a.external_load = Some(vec![1.0; 288]);
        a.external_load_name = "solar".into();
        let mut b = a.clone();
        b.external_load = Some(vec![2.0; 288]);

        let (fa, fb) = (experiment(a.clone()).sim_filename(), experiment(b).sim_filename());
        assert_ne!(fa, fb);
        assert_eq!(fa, experiment(a).sim_filename());
        assert_ne!(experiment(base).sim_filename(), fa);
    }

    #[test]
    fn transformer_rating_changes_the_sim_filename() {
        let large = config("caltech", "load_flattening");
        let mut small = large.clone();
        small.bus_transformer_capacity_kva = 10.0;

        let wide = experiment(large).sim_filename();
        let narrow = experiment(small).sim_filename();
        assert_ne!(wide, narrow);
        assert!(narrow.to_string_lossy().ends_with("_bus_transformer_cap-10.json"));
    }

    #[test]
    fn tariff_override_contents_change_the_sim_filename() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config("caltech", "min_cost");
        cfg.tariff_dir = Some(dir.path().to_path_buf());
        let built_in = experiment(cfg.clone()).sim_filename();

        let path = dir.path().join("sce_tou_ev_4_march_2019.json");
        let mut tariff = TimeOfUseTariff::built_in("sce_tou_ev_4_march_2019").expect("tariff");
        fs::write(&path, serde_json::to_string(&tariff).expect("json")).expect("write");
        let first = experiment(cfg.clone()).sim_filename();

        tariff.demand_charge = 0.0;
        fs::write(&path, serde_json::to_string(&tariff).expect("json")).expect("write");
        let second = experiment(cfg).sim_filename();

        assert_ne!(built_in, first);
        assert_ne!(first, second);
    }

    #[test]
    fn digest_is_short_hex() {
        let d = series_digest(&[0.0, 1.5]);
        assert_eq!(d.len(), 16);
        assert!(d.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(d, series_digest(&[1.5, 0.0]));
        assert_eq!(bytes_digest(b"abc"), "ba7816bf8f01cfea");
    }

    #[test]
    fn unknown_site_is_rejected() {
        let cfg = config("office", "unctrl");
        assert!(matches!(
            AcnExperiment::new(cfg, Box::new(SyntheticEvents::default())),
            Err(Error::UnknownSite(_))
        ));
    }

    #[test]
    fn skipped_local_time_is_rejected() {
        let spring_forward = NaiveDate::from_ymd_opt(2019, 3, 10)
            .and_then(|d| d.and_hms_opt(2, 30, 0))
            .expect("valid");
        assert!(matches!(
            localize(DEFAULT_TIMEZONE, spring_forward),
            Err(Error::NonexistentLocalTime(_))
        ));
        assert!(matches!(
            localize("Mars/Olympus_Mons", spring_forward),
            Err(Error::UnknownTimezone(_))
        ));
    }

    #[test]
    fn get_or_run_caches_events_and_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config("caltech", "llf");
        cfg.events_dir = dir.path().join("events");
        cfg.sim_dir = dir.path().join("sims");
        let mut ex = experiment(cfg.clone());

        let first = ex.get_or_run().expect("run").clone();
        assert!(ex.events_filename().exists());
        assert!(ex.sim_filename().exists());
        assert_eq!(first.aggregate_power().len(), 288);

        let mut again = experiment(cfg);
        assert_eq!(again.get_or_run().expect("cached"), &first);
    }
}
