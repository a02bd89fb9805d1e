//! Time-indexed load tables (kW or kvar per named load).

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeDelta};
use tracing::debug;

use crate::error::{Error, Result};

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M",
];

pub fn parse_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let raw = raw.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .ok_or_else(|| Error::BadTimestamp(raw.to_string()))
}

/// Columns of values sharing one timestamp index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadTable {
    index: Vec<NaiveDateTime>,
    columns: BTreeMap<String, Vec<f64>>,
}

impl LoadTable {
    /// Builds a table; every column must match the index length.
    pub fn new(index: Vec<NaiveDateTime>, columns: BTreeMap<String, Vec<f64>>) -> Self {
        debug_assert!(columns.values().all(|c| c.len() == index.len()));
        Self { index, columns }
    }

    /// Reads a CSV whose first column is the timestamp and whose other
    /// columns are named loads. Blank cells read as zero.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed CSV, timestamps or numbers.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let names: Vec<String> = rdr.headers()?.iter().skip(1).map(str::to_string).collect();

        let mut rows: Vec<(NaiveDateTime, Vec<f64>)> = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let ts = parse_timestamp(record.get(0).unwrap_or_default())?;
            let values = record
                .iter()
                .skip(1)
                .map(|v| {
                    if v.is_empty() {
                        Ok(0.0)
                    } else {
                        v.parse::<f64>().map_err(|_| Error::BadValue {
                            context: ts.to_string(),
                            value: v.to_string(),
                        })
                    }
                })
                .collect::<Result<Vec<f64>>>()?;
            rows.push((ts, values));
        }
        rows.sort_by_key(|(ts, _)| *ts);

        let index = rows.iter().map(|(ts, _)| *ts).collect();
        let columns = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let col = rows.iter().map(|(_, v)| v.get(i).copied().unwrap_or(0.0)).collect();
                (name, col)
            })
            .collect();
        Ok(Self { index, columns })
    }

    /// Reads `path`, keeps rows in `[start, end]` and resamples them to
    /// `period_minutes` by back-filling.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoBaselineData`] if no row falls in the window.
    pub fn read_window(
        path: &Path,
        start: NaiveDateTime,
        end: NaiveDateTime,
        period_minutes: u32,
    ) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
        let table = Self::from_reader(std::io::BufReader::new(file))?
            .restrict(start, end)
            .resample_bfill(period_minutes);
        if table.is_empty() {
            return Err(Error::NoBaselineData {
                path: path.to_path_buf(),
                start,
                end,
            });
        }
        debug!(
            path = %path.display(),
            rows = table.len(),
            loads = table.columns.len(),
            "read load table"
        );
        Ok(table)
    }

    /// Rows with `start <= t <= end`.
    pub fn restrict(self, start: NaiveDateTime, end: NaiveDateTime) -> Self {
        let keep: Vec<bool> = self.index.iter().map(|t| *t >= start && *t <= end).collect();
        let filter = |values: Vec<f64>| -> Vec<f64> {
            values
                .into_iter()
                .zip(&keep)
                .filter_map(|(v, k)| k.then_some(v))
                .collect()
        };
        Self {
            index: filter_index(&self.index, &keep),
            columns: self
                .columns
                .into_iter()
                .map(|(name, values)| (name, filter(values)))
                .collect(),
        }
    }

    /// Regular `period_minutes` grid from the floored first timestamp to the
    /// last one; each bin takes the first observation at or after it.
    pub fn resample_bfill(self, period_minutes: u32) -> Self {
        let (Some(&first), Some(&last)) = (self.index.first(), self.index.last()) else {
            return self;
        };
        let period = TimeDelta::minutes(i64::from(period_minutes.max(1)));
        let mut bins = Vec::new();
        let mut sources = Vec::new();
        let mut bin = floor_to(first, period);
        let mut cursor = 0;
        while bin <= last {
            while self.index[cursor] < bin {
                cursor += 1;
            }
            bins.push(bin);
            sources.push(cursor);
            bin += period;
        }
        Self {
            index: bins,
            columns: self
                .columns
                .into_iter()
                .map(|(name, values)| (name, sources.iter().map(|&i| values[i]).collect()))
                .collect(),
        }
    }

    pub fn index(&self) -> &[NaiveDateTime] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str, row: usize) -> Option<f64> {
        self.columns.get(name)?.get(row).copied()
    }

    /// Adds `values` onto the first rows of `name`, creating a zero column
    /// if needed. Values past the end of the table are ignored.
    pub fn add(&mut self, name: &str, values: &[f64]) {
        let len = self.index.len();
        let column = self
            .columns
            .entry(name.to_string())
            .or_insert_with(|| vec![0.0; len]);
        for (cell, v) in column.iter_mut().zip(values) {
            *cell += v;
        }
    }
}

fn filter_index(index: &[NaiveDateTime], keep: &[bool]) -> Vec<NaiveDateTime> {
    index
        .iter()
        .zip(keep)
        .filter_map(|(t, k)| k.then_some(*t))
        .collect()
}

fn floor_to(t: NaiveDateTime, period: TimeDelta) -> NaiveDateTime {
    let secs = t.and_utc().timestamp();
    let step = period.num_seconds().max(1);
    DateTime::from_timestamp(secs - secs.rem_euclid(step), 0).map_or(t, |d| d.naive_utc())
}
