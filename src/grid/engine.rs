//! Interface to the power-flow engine that solves the feeder.

use std::fmt;
use std::io::Read;

use num_complex::Complex64;

use crate::error::Result;

/// Reports the engine can export after a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReportKind {
    Summary,
    Overload,
    Capacity,
    Currents,
    Profile,
}

impl ReportKind {
    pub const ALL: [ReportKind; 5] = [
        ReportKind::Summary,
        ReportKind::Overload,
        ReportKind::Capacity,
        ReportKind::Currents,
        ReportKind::Profile,
    ];

    /// Name understood by the engine's `Export` command.
    pub fn command_name(self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::Overload => "overload",
            Self::Capacity => "capacity",
            Self::Currents => "currents",
            Self::Profile => "profile",
        }
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

/// A CSV report indexed by its first column.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportTable {
    /// Header of every column after the index.
    pub columns: Vec<String>,
    /// `(index, values)` rows in file order.
    pub rows: Vec<(String, Vec<String>)>,
}

impl ReportTable {
    /// Parses CSV with a header row; fields are trimmed.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed CSV.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);
        let columns = rdr.headers()?.iter().skip(1).map(str::to_string).collect();
        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let mut fields = record.iter().map(str::to_string);
            let index = fields.next().unwrap_or_default();
            rows.push((index, fields.collect()));
        }
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell at row `index`, column `column`.
    pub fn get(&self, index: &str, column: &str) -> Option<&str> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows
            .iter()
            .find(|(i, _)| i == index)
            .and_then(|(_, values)| values.get(col))
            .map(String::as_str)
    }
}

/// A stateful circuit solver driven by text commands.
///
/// Load and transformer names are lowercase. Query methods that depend on a
/// solution fail until `Solve` has run on the current model.
pub trait CircuitEngine {
    /// Executes one engine command, e.g. `Redirect Line.dss` or `Solve`.
    fn run_command(&mut self, command: &str) -> Result<()>;

    fn load_names(&self) -> Vec<String>;
    fn load_kw(&self, name: &str) -> Result<f64>;
    fn load_kvar(&self, name: &str) -> Result<f64>;
    fn set_load_kw(&mut self, name: &str, kw: f64) -> Result<()>;
    fn set_load_kvar(&mut self, name: &str, kvar: f64) -> Result<()>;

    /// Buses of the solved circuit in engine order.
    fn bus_names(&self) -> Result<Vec<String>>;
    /// Node numbers of `bus`, aligned with [`CircuitEngine::bus_pu_voltages`].
    fn bus_nodes(&self, bus: &str) -> Result<Vec<u32>>;
    /// Per-unit complex node voltages of `bus`.
    fn bus_pu_voltages(&self, bus: &str) -> Result<Vec<Complex64>>;

    fn transformer_names(&self) -> Vec<String>;
    fn transformer_tap(&self, name: &str) -> Result<f64>;
    /// Winding whose tap [`CircuitEngine::transformer_tap`] reports.
    fn transformer_wdg(&self, name: &str) -> Result<u32>;

    /// Exports one report of the current solution.
    fn export_report(&mut self, kind: ReportKind) -> Result<ReportTable>;
}
