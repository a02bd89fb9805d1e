//! TOML-based co-simulation configuration and preset definitions.

use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use chrono_tz::Tz;
use serde::Deserialize;

use crate::acn::algorithms::SchedulingPolicy;
use crate::acn::experiment::{AcnExperimentConfig, DEFAULT_TIMEZONE, PERIOD_MINUTES};
use crate::acn::network::Site;
use crate::acn::sources::{AcnDataClient, EventSource, SyntheticEvents};
use crate::acn::tariff::TimeOfUseTariff;
use crate::error::{Error, Result};
use crate::grid::dss::DEFAULT_EXECUTABLE;
use crate::grid::experiment::FeederConfig;
use crate::grid::loads::LoadTable;
use crate::solar::SolarProfile;

/// Token accepted by the public ACN-Data API for limited access.
const DEMO_TOKEN: &str = "DEMO_TOKEN";

fn midnight(year: i32, month: u32, day: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Top-level co-simulation configuration parsed from TOML.
///
/// Every section has defaults. Load from TOML with
/// [`CosimConfig::from_toml_file`] or start from a preset with
/// [`CosimConfig::from_preset`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CosimConfig {
    /// Feeder window and circuit files.
    #[serde(default)]
    pub feeder: FeederRunConfig,
    /// How EV loads are coupled to the feeder.
    #[serde(default)]
    pub cosim: CouplingConfig,
    /// Where EV charging sessions come from.
    #[serde(default)]
    pub events: EventsConfig,
    /// One entry per EV experiment, each attached to a bus.
    #[serde(default)]
    pub ev: Vec<EvConfig>,
    /// Non-EV time-varying loads such as rooftop solar.
    #[serde(default)]
    pub general_load: Vec<GeneralLoadConfig>,
    /// Parameter sweep over sites, algorithms and tariffs.
    #[serde(default)]
    pub sweep: SweepConfig,
}

/// Feeder window and circuit files.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeederRunConfig {
    /// First simulated instant, in the baseline CSV's clock.
    pub start: NaiveDateTime,
    /// Simulated span (minutes).
    pub horizon: u32,
    /// Step length (minutes).
    pub period: u32,
    /// Include the substation regulator controls.
    pub reg_control: bool,
    pub circuit_dir: PathBuf,
    pub load_dir: PathBuf,
    /// OpenDSS command-line executable.
    pub dss_executable: String,
}

impl Default for FeederRunConfig {
    fn default() -> Self {
        Self {
            start: midnight(2019, 7, 1),
            horizon: 24 * 60,
            period: PERIOD_MINUTES,
            reg_control: true,
            circuit_dir: PathBuf::from("iowa_dist_feeder"),
            load_dir: PathBuf::from("iowa_data"),
            dss_executable: DEFAULT_EXECUTABLE.to_string(),
        }
    }
}

impl FeederRunConfig {
    pub fn to_feeder_config(&self) -> FeederConfig {
        FeederConfig {
            start: self.start,
            horizon: self.horizon,
            period: self.period,
            reg_control: self.reg_control,
            circuit_dir: self.circuit_dir.clone(),
            load_dir: self.load_dir.clone(),
        }
    }
}

/// How EV loads are coupled to the feeder.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CouplingConfig {
    /// Inject per-phase EV loads instead of one balanced load.
    pub unbalanced: bool,
    /// EV steps skipped before the first feeder step.
    pub ev_load_offset: usize,
    /// Export the five engine reports every step.
    pub detailed_metrics: bool,
}

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            unbalanced: true,
            ev_load_offset: 0,
            detailed_metrics: true,
        }
    }
}

/// Where EV charging sessions come from.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsConfig {
    /// `"acndata"` (ACN-Data API) or `"synthetic"` (offline, seeded).
    pub source: String,
    /// Environment variable holding the ACN-Data token.
    pub api_key_env: String,
    /// Overrides the ACN-Data endpoint.
    pub base_url: Option<String>,
    /// Seed of the synthetic generator.
    pub seed: u64,
    /// Stations per site for the synthetic generator.
    pub stations: usize,
    pub demand_kwh_min: f64,
    pub demand_kwh_max: f64,
    pub dwell_steps_min: usize,
    pub dwell_steps_max: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        let synthetic = SyntheticEvents::default();
        Self {
            source: "acndata".to_string(),
            api_key_env: "ACN_API_KEY".to_string(),
            base_url: None,
            seed: synthetic.seed,
            stations: synthetic.stations,
            demand_kwh_min: synthetic.demand_kwh_min,
            demand_kwh_max: synthetic.demand_kwh_max,
            dwell_steps_min: synthetic.dwell_steps_min,
            dwell_steps_max: synthetic.dwell_steps_max,
        }
    }
}

impl EventsConfig {
    /// Builds a fresh event source. An unset token variable falls back to the
    /// public demo token.
    pub fn event_source(&self) -> Box<dyn EventSource> {
        match self.source.as_str() {
            "synthetic" => Box::new(SyntheticEvents {
                seed: self.seed,
                stations: self.stations,
                demand_kwh_min: self.demand_kwh_min,
                demand_kwh_max: self.demand_kwh_max,
                dwell_steps_min: self.dwell_steps_min,
                dwell_steps_max: self.dwell_steps_max,
            }),
            _ => {
                let token = env::var(&self.api_key_env).unwrap_or_else(|_| DEMO_TOKEN.to_string());
                let client = AcnDataClient::new(token);
                Box::new(match &self.base_url {
                    Some(url) => client.with_base_url(url),
                    None => client,
                })
            }
        }
    }
}

/// One EV experiment attached to a feeder bus.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvConfig {
    /// Unique key of the experiment.
    pub id: String,
    /// Feeder bus receiving the EV load.
    pub bus: String,
    /// `"caltech"` or `"jpl"`.
    pub site: String,
    /// Window start, local to `timezone`.
    pub start: NaiveDateTime,
    /// Window end, local to `timezone`.
    pub end: NaiveDateTime,
    pub alg_name: String,
    pub tariff_name: String,
    /// Column of `external_load_csv` used as the external load; also part of
    /// the cache key.
    pub external_load_name: String,
    /// CSV (timestamp index first) holding the external load in kW.
    pub external_load_csv: Option<PathBuf>,
    /// Bus transformer rating (kVA).
    pub bus_transformer_cap: f64,
    pub events_dir: PathBuf,
    pub sim_dir: PathBuf,
    /// IANA zone the window is expressed in.
    pub timezone: String,
    /// Directory searched for `<tariff_name>.json`.
    pub tariff_dir: Option<PathBuf>,
}

impl Default for EvConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            bus: String::new(),
            site: "caltech".to_string(),
            start: midnight(2019, 7, 1),
            end: midnight(2019, 7, 2),
            alg_name: "unctrl".to_string(),
            tariff_name: TimeOfUseTariff::BUILT_IN[0].to_string(),
            external_load_name: String::new(),
            external_load_csv: None,
            bus_transformer_cap: 225.0,
            events_dir: PathBuf::from("events"),
            sim_dir: PathBuf::from("sims"),
            timezone: DEFAULT_TIMEZONE.to_string(),
            tariff_dir: None,
        }
    }
}

impl EvConfig {
    /// Resolves the experiment inputs, reading the external load if one is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the external load CSV is unreadable or lacks the
    /// `external_load_name` column.
    pub fn to_experiment_config(&self) -> Result<AcnExperimentConfig> {
        let mut config = AcnExperimentConfig::new(
            &self.site,
            self.start,
            self.end,
            &self.alg_name,
            &self.tariff_name,
        );
        config.external_load_name = self.external_load_name.clone();
        config.bus_transformer_capacity_kva = self.bus_transformer_cap;
        config.events_dir = self.events_dir.clone();
        config.sim_dir = self.sim_dir.clone();
        config.sim_timezone = self.timezone.clone();
        config.tariff_dir = self.tariff_dir.clone();

        if let Some(path) = &self.external_load_csv {
            let table = LoadTable::read_window(path, self.start, self.end, PERIOD_MINUTES)?;
            let column = table
                .column(&self.external_load_name)
                .ok_or_else(|| Error::MissingColumn {
                    path: path.clone(),
                    column: self.external_load_name.clone(),
                })?;
            config.external_load = Some(column.to_vec());
        }
        Ok(config)
    }
}

/// A non-EV load added to one or more buses.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GeneralLoadConfig {
    pub name: String,
    /// `"solar"` (synthetic profile) or `"csv"`.
    pub kind: String,
    /// CSV (timestamp index first) for `kind = "csv"`.
    pub csv: Option<PathBuf>,
    /// Column of `csv`; defaults to `name`.
    pub column: Option<String>,
    /// Target buses; every EV bus when omitted.
    pub buses: Option<Vec<String>>,
    /// Steps skipped before the first feeder step.
    pub offset: usize,
    /// Multiplier applied to every value.
    pub scale: f64,
    /// Solar peak output (kW).
    pub kw_peak: f64,
    pub sunrise_hour: f64,
    pub sunset_hour: f64,
    /// Solar noise as a fraction of output.
    pub noise_std: f64,
    pub seed: u64,
}

impl Default for GeneralLoadConfig {
    fn default() -> Self {
        Self {
            name: "solar".to_string(),
            kind: "solar".to_string(),
            csv: None,
            column: None,
            buses: None,
            offset: 0,
            scale: 1.0,
            kw_peak: 50.0,
            sunrise_hour: 6.0,
            sunset_hour: 20.0,
            noise_std: 0.0,
            seed: 42,
        }
    }
}

impl GeneralLoadConfig {
    /// Load in kW per feeder step, long enough for `offset` plus the horizon.
    ///
    /// # Errors
    ///
    /// Returns an error if the CSV is unreadable or lacks the column.
    pub fn series(&self, feeder: &FeederConfig) -> Result<Vec<f64>> {
        let len = self.offset + feeder.steps();
        let raw = match self.kind.as_str() {
            "csv" => {
                let path = self.csv.as_deref().ok_or_else(|| {
                    Error::Config(err(
                        format!("general_load {}.csv", self.name),
                        "required when kind = \"csv\"",
                    ))
                })?;
                let end = feeder.start + TimeDelta::minutes(i64::from(feeder.period) * len as i64);
                let table = LoadTable::read_window(path, feeder.start, end, feeder.period)?;
                let column = self.column.as_deref().unwrap_or(&self.name);
                table
                    .column(column)
                    .ok_or_else(|| Error::MissingColumn {
                        path: path.to_path_buf(),
                        column: column.to_string(),
                    })?
                    .to_vec()
            }
            _ => SolarProfile {
                kw_peak: self.kw_peak,
                sunrise_hour: self.sunrise_hour,
                sunset_hour: self.sunset_hour,
                noise_std: self.noise_std,
                seed: self.seed,
            }
            .series(feeder.start, feeder.period, len),
        };
        Ok(raw.into_iter().map(|v| v * self.scale).collect())
    }
}

/// Parameter sweep over sites, algorithms and tariffs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub sites: Vec<String>,
    pub algorithms: Vec<String>,
    /// `min_cost` only runs with the first entry.
    pub tariffs: Vec<String>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub timezone: String,
    pub events_dir: PathBuf,
    pub sim_dir: PathBuf,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            sites: vec!["jpl".to_string(), "caltech".to_string()],
            algorithms: vec!["unctrl".to_string(), "min_cost".to_string(), "llf".to_string()],
            tariffs: TimeOfUseTariff::BUILT_IN.iter().map(|t| t.to_string()).collect(),
            start: midnight(2019, 7, 1),
            end: midnight(2019, 8, 1),
            timezone: DEFAULT_TIMEZONE.to_string(),
            events_dir: PathBuf::from("events"),
            sim_dir: PathBuf::from("sims"),
        }
    }
}

/// Configuration error with field path and constraint description.
#[derive(Debug)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"feeder.period"`, `"ev[0].site"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

fn err(field: impl Into<String>, message: impl Into<String>) -> ConfigError {
    ConfigError {
        field: field.into(),
        message: message.into(),
    }
}

impl CosimConfig {
    /// One Caltech experiment on bus 1003, synthetic sessions, unbalanced.
    pub fn demo() -> Self {
        Self {
            feeder: FeederRunConfig::default(),
            cosim: CouplingConfig::default(),
            events: EventsConfig {
                source: "synthetic".to_string(),
                ..EventsConfig::default()
            },
            ev: vec![EvConfig {
                id: "caltech_1003".to_string(),
                bus: "1003".to_string(),
                ..EvConfig::default()
            }],
            general_load: Vec::new(),
            sweep: SweepConfig::default(),
        }
    }

    /// Two sites on different buses plus rooftop solar on both.
    pub fn solar_mix() -> Self {
        Self {
            ev: vec![
                EvConfig {
                    id: "caltech_1003".to_string(),
                    bus: "1003".to_string(),
                    ..EvConfig::default()
                },
                EvConfig {
                    id: "jpl_2002".to_string(),
                    bus: "2002".to_string(),
                    site: "jpl".to_string(),
                    alg_name: "llf".to_string(),
                    ..EvConfig::default()
                },
            ],
            general_load: vec![GeneralLoadConfig {
                kw_peak: 80.0,
                noise_std: 0.05,
                ..GeneralLoadConfig::default()
            }],
            ..Self::demo()
        }
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["demo", "solar_mix"];

    /// Loads a configuration from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> std::result::Result<Self, ConfigError> {
        match name {
            "demo" => Ok(Self::demo()),
            "solar_mix" => Ok(Self::solar_mix()),
            _ => Err(err(
                "preset",
                format!("unknown preset \"{name}\", available: {}", Self::PRESETS.join(", ")),
            )),
        }
    }

    /// Parses a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> std::result::Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| err("config", format!("cannot read \"{}\": {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> std::result::Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| err("toml", e.to_string()))
    }

    /// Validates all fields and returns every problem found.
    ///
    /// Returns an empty vector if the configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let f = &self.feeder;
        if f.period == 0 {
            errors.push(err("feeder.period", "must be > 0"));
        }
        if f.horizon < f.period {
            errors.push(err("feeder.horizon", "must be >= feeder.period"));
        }
        if f.dss_executable.is_empty() {
            errors.push(err("feeder.dss_executable", "must not be empty"));
        }

        let e = &self.events;
        if e.source != "acndata" && e.source != "synthetic" {
            errors.push(err(
                "events.source",
                format!("must be \"acndata\" or \"synthetic\", got \"{}\"", e.source),
            ));
        }
        if e.demand_kwh_min > e.demand_kwh_max {
            errors.push(err("events.demand_kwh_min", "must be <= events.demand_kwh_max"));
        }
        if e.dwell_steps_min > e.dwell_steps_max {
            errors.push(err("events.dwell_steps_min", "must be <= events.dwell_steps_max"));
        }

        let mut ids = BTreeSet::new();
        for (i, ev) in self.ev.iter().enumerate() {
            let field = |name: &str| format!("ev[{i}].{name}");
            if ev.id.is_empty() {
                errors.push(err(field("id"), "must not be empty"));
            } else if !ids.insert(ev.id.as_str()) {
                errors.push(err(field("id"), format!("duplicate id \"{}\"", ev.id)));
            }
            if ev.bus.is_empty() {
                errors.push(err(field("bus"), "must not be empty"));
            }
            validate_window(
                &mut errors,
                &field("start"),
                ev.start,
                ev.end,
                &ev.timezone,
                &field("timezone"),
            );
            if ev.site.parse::<Site>().is_err() {
                errors.push(err(field("site"), format!("unknown site \"{}\"", ev.site)));
            }
            if SchedulingPolicy::from_name(&ev.alg_name, ev.bus_transformer_cap, None).is_err() {
                errors.push(err(
                    field("alg_name"),
                    format!("unknown algorithm \"{}\"", ev.alg_name),
                ));
            }
            if ev.tariff_dir.is_none()
                && !TimeOfUseTariff::BUILT_IN.contains(&ev.tariff_name.as_str())
            {
                errors.push(err(
                    field("tariff_name"),
                    format!("unknown tariff \"{}\"", ev.tariff_name),
                ));
            }
            if ev.bus_transformer_cap <= 0.0 {
                errors.push(err(field("bus_transformer_cap"), "must be > 0"));
            }
            if ev.external_load_csv.is_some() && ev.external_load_name.is_empty() {
                errors.push(err(
                    field("external_load_name"),
                    "must name the column of external_load_csv",
                ));
            }
        }

        for (i, load) in self.general_load.iter().enumerate() {
            let field = |name: &str| format!("general_load[{i}].{name}");
            match load.kind.as_str() {
                "solar" => {
                    if load.sunrise_hour >= load.sunset_hour {
                        errors.push(err(field("sunrise_hour"), "must be < sunset_hour"));
                    }
                    if load.noise_std < 0.0 {
                        errors.push(err(field("noise_std"), "must be >= 0"));
                    }
                }
                "csv" => {
                    if load.csv.is_none() {
                        errors.push(err(field("csv"), "required when kind = \"csv\""));
                    }
                }
                other => errors.push(err(
                    field("kind"),
                    format!("must be \"solar\" or \"csv\", got \"{other}\""),
                )),
            }
            if load.buses.is_none() && self.ev.is_empty() {
                errors.push(err(field("buses"), "required when no ev experiments are configured"));
            }
        }

        let s = &self.sweep;
        validate_window(&mut errors, "sweep.start", s.start, s.end, &s.timezone, "sweep.timezone");
        for site in &s.sites {
            if site.parse::<Site>().is_err() {
                errors.push(err("sweep.sites", format!("unknown site \"{site}\"")));
            }
        }
        for alg in &s.algorithms {
            if SchedulingPolicy::from_name(alg, 225.0, None).is_err() {
                errors.push(err("sweep.algorithms", format!("unknown algorithm \"{alg}\"")));
            }
        }
        if s.tariffs.is_empty() {
            errors.push(err("sweep.tariffs", "must list at least one tariff"));
        }

        errors
    }
}

fn validate_window(
    errors: &mut Vec<ConfigError>,
    start_field: &str,
    start: NaiveDateTime,
    end: NaiveDateTime,
    timezone: &str,
    timezone_field: &str,
) {
    if start >= end {
        errors.push(err(start_field, "must be before end"));
    }
    if timezone.parse::<Tz>().is_err() {
        errors.push(err(timezone_field, format!("unknown timezone \"{timezone}\"")));
    }
}
