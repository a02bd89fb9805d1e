//! Per-timestep feeder telemetry recorded by the circuit stepper.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;

use super::engine::{ReportKind, ReportTable};

/// Values keyed by timestamp, then by element name.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeTable<T> {
    rows: BTreeMap<NaiveDateTime, BTreeMap<String, T>>,
}

impl<T> Default for TimeTable<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<T> TimeTable<T> {
    pub fn insert(&mut self, time: NaiveDateTime, name: impl Into<String>, value: T) {
        self.rows.entry(time).or_default().insert(name.into(), value);
    }

    pub fn row(&self, time: NaiveDateTime) -> Option<&BTreeMap<String, T>> {
        self.rows.get(&time)
    }

    pub fn get(&self, time: NaiveDateTime, name: &str) -> Option<&T> {
        self.rows.get(&time)?.get(name)
    }

    pub fn timestamps(&self) -> impl Iterator<Item = NaiveDateTime> + '_ {
        self.rows.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDateTime, &BTreeMap<String, T>)> {
        self.rows.iter().map(|(t, row)| (*t, row))
    }

    /// Distinct element names across all rows, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .rows
            .values()
            .flat_map(|row| row.keys().map(String::as_str))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<T: Copy> TimeTable<T> {
    /// One element's values in time order; missing samples are skipped.
    pub fn series(&self, name: &str) -> Vec<(NaiveDateTime, T)> {
        self.rows
            .iter()
            .filter_map(|(t, row)| row.get(name).map(|v| (*t, *v)))
            .collect()
    }
}

/// Highest and lowest node voltage at one timestep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnvelopePoint {
    pub time: NaiveDateTime,
    pub max_pu: f64,
    pub min_pu: f64,
}

/// Everything recorded during a feeder run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeederTelemetry {
    /// Voltage magnitude (p.u.) per `bus.node`.
    pub voltage_pu: TimeTable<f64>,
    /// Regulator tap (p.u.).
    pub taps: TimeTable<f64>,
    /// Regulator active winding.
    pub wdg: TimeTable<u32>,
    pub reports: BTreeMap<ReportKind, BTreeMap<NaiveDateTime, ReportTable>>,
}

impl FeederTelemetry {
    /// Max and min node voltage per timestep. NaN samples are ignored.
    pub fn voltage_envelope(&self) -> Vec<EnvelopePoint> {
        self.voltage_pu
            .iter()
            .filter_map(|(time, row)| {
                let values = row.values().copied().filter(|v| !v.is_nan());
                let (min_pu, max_pu) = values.fold(None, |acc: Option<(f64, f64)>, v| {
                    Some(acc.map_or((v, v), |(lo, hi)| (lo.min(v), hi.max(v))))
                })?;
                Some(EnvelopePoint {
                    time,
                    max_pu,
                    min_pu,
                })
            })
            .collect()
    }

    pub fn record_report(&mut self, kind: ReportKind, time: NaiveDateTime, table: ReportTable) {
        self.reports.entry(kind).or_default().insert(time, table);
    }

    pub fn report(&self, kind: ReportKind, time: NaiveDateTime) -> Option<&ReportTable> {
        self.reports.get(&kind)?.get(&time)
    }
}
