//! [`CircuitEngine`] backed by the OpenDSS command-line program.
//!
//! Commands are buffered into a script. `Solve` writes the script, runs the
//! executable on it and reads the solution back from the engine's CSV
//! exports. Load and transformer properties are parsed from the `New`
//! definitions, both inline and in redirected files, so queries on them do
//! not need a solve.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use num_complex::Complex64;
use tempfile::TempDir;
use tracing::{debug, trace};

use super::engine::{CircuitEngine, ReportKind, ReportTable};
use crate::error::{Error, Result};

pub const DEFAULT_EXECUTABLE: &str = "opendsscmd";

/// Load power factor the engine assumes when a definition gives none.
const DEFAULT_LOAD_PF: f64 = 0.88;
const DEFAULT_LOAD_KW: f64 = 10.0;
/// Deepest chain of nested `Redirect`/`Compile` files followed.
const MAX_REDIRECT_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct LoadDefinition {
    pub kw: f64,
    pub kvar: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformerDefinition {
    /// Winding selected last in the definition.
    pub wdg: u32,
    /// Tap of the active winding (p.u.).
    pub tap: f64,
}

/// Elements declared by `New` commands, in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Definitions {
    pub loads: Vec<(String, LoadDefinition)>,
    pub transformers: Vec<(String, TransformerDefinition)>,
}

impl Definitions {
    /// Parses DSS text.
    ///
    /// Handles `!` and `//` comments, `~` / `More` continuation lines,
    /// case-insensitive keywords and `key = value` spacing.
    pub fn parse(text: &str) -> Self {
        let mut defs = Self::default();
        for statement in statements(text) {
            defs.apply(&statement);
        }
        defs
    }

    /// Parses a DSS file, following nested `Redirect` and `Compile`
    /// statements relative to the directory of the file that names them.
    ///
    /// # Errors
    ///
    /// Returns an error if a file is unreadable or the nesting is deeper
    /// than [`MAX_REDIRECT_DEPTH`], which also catches cycles.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let mut defs = Self::default();
        defs.read_file(path, 0)?;
        Ok(defs)
    }

    fn read_file(&mut self, path: &Path, depth: usize) -> Result<()> {
        if depth > MAX_REDIRECT_DEPTH {
            return Err(Error::Engine(format!(
                "redirects nested deeper than {MAX_REDIRECT_DEPTH} at {}",
                path.display()
            )));
        }
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let base = path.parent().unwrap_or(Path::new(""));
        for statement in statements(&text) {
            match redirect_target(&statement) {
                Some(target) => self.read_file(&base.join(target), depth + 1)?,
                None => self.apply(&statement),
            }
        }
        Ok(())
    }

    fn apply(&mut self, statement: &str) {
        let mut tokens = tokenize(statement).into_iter();
        let Some(verb) = tokens.next() else {
            return;
        };
        if !verb.eq_ignore_ascii_case("new") {
            return;
        }
        let Some(element) = tokens.next() else {
            return;
        };
        let element = element
            .strip_prefix("object=")
            .or_else(|| element.strip_prefix("Object="))
            .unwrap_or(element.as_str())
            .to_ascii_lowercase();
        let props: Vec<(String, String)> = tokens.filter_map(|t| split_property(&t)).collect();

        if let Some(name) = element.strip_prefix("load.") {
            let kw = prop_f64(&props, "kw").unwrap_or(DEFAULT_LOAD_KW);
            let kvar = prop_f64(&props, "kvar").unwrap_or_else(|| {
                let pf = prop_f64(&props, "pf").unwrap_or(DEFAULT_LOAD_PF);
                let q = kw * pf.abs().acos().tan();
                if pf < 0.0 { -q } else { q }
            });
            upsert(&mut self.loads, name, LoadDefinition { kw, kvar });
        } else if let Some(name) = element.strip_prefix("transformer.") {
            let mut wdg = 1;
            let mut taps: BTreeMap<u32, f64> = BTreeMap::new();
            for (key, value) in &props {
                match key.as_str() {
                    "wdg" => {
                        if let Ok(w) = value.parse() {
                            wdg = w;
                        }
                    }
                    "tap" => {
                        if let Ok(t) = value.parse() {
                            taps.insert(wdg, t);
                        }
                    }
                    "taps" => {
                        for (i, t) in list_values(value).iter().enumerate() {
                            if let Ok(t) = t.parse() {
                                taps.insert(i as u32 + 1, t);
                            }
                        }
                    }
                    _ => {}
                }
            }
            let tap = taps.get(&wdg).copied().unwrap_or(1.0);
            upsert(&mut self.transformers, name, TransformerDefinition { wdg, tap });
        }
    }
}

/// Target of a `Redirect` or `Compile` statement, unquoted.
fn redirect_target(statement: &str) -> Option<&str> {
    let (verb, rest) = statement.trim().split_once(char::is_whitespace)?;
    let verb = verb.to_ascii_lowercase();
    (verb == "redirect" || verb == "compile")
        .then(|| rest.trim().trim_matches(|c| c == '"' || c == '\''))
}

fn upsert<T>(items: &mut Vec<(String, T)>, name: &str, value: T) {
    match items.iter_mut().find(|(n, _)| n == name) {
        Some(slot) => slot.1 = value,
        None => items.push((name.to_string(), value)),
    }
}

/// Joins continuation lines onto their statement and strips comments.
fn statements(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in text.lines() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        let continuation = line
            .strip_prefix('~')
            .or_else(|| {
                line.get(..5)
                    .filter(|head| head.eq_ignore_ascii_case("more "))
                    .map(|_| &line[5..])
            });
        match (continuation, out.last_mut()) {
            (Some(rest), Some(prev)) => {
                prev.push(' ');
                prev.push_str(rest.trim());
            }
            _ => out.push(line.to_string()),
        }
    }
    out
}

fn strip_comment(line: &str) -> &str {
    let cut = [line.find('!'), line.find("//")]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(line.len());
    &line[..cut]
}

/// Splits on whitespace outside brackets and quotes, gluing `key = value`.
fn tokenize(statement: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut depth = 0_i32;
    let mut quote: Option<char> = None;
    for c in statement.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(c);
                current.push(c);
            }
            (None, '[' | '(' | '{') => {
                depth += 1;
                current.push(c);
            }
            (None, ']' | ')' | '}') => {
                depth -= 1;
                current.push(c);
            }
            (None, c) if (c.is_whitespace() || c == ',') && depth == 0 => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            (None, c) => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    let mut glued: Vec<String> = Vec::with_capacity(tokens.len());
    let mut iter = tokens.into_iter();
    while let Some(tok) = iter.next() {
        if tok == "=" {
            if let (Some(prev), Some(next)) = (glued.last_mut(), iter.next()) {
                prev.push('=');
                prev.push_str(&next);
            }
        } else if tok.ends_with('=') && tok.len() > 1 {
            let mut tok = tok;
            if let Some(next) = iter.next() {
                tok.push_str(&next);
            }
            glued.push(tok);
        } else if tok.starts_with('=') && tok.len() > 1 {
            match glued.last_mut() {
                Some(prev) => prev.push_str(&tok),
                None => glued.push(tok),
            }
        } else {
            glued.push(tok);
        }
    }
    glued
}

fn split_property(token: &str) -> Option<(String, String)> {
    let (key, value) = token.split_once('=')?;
    let value = value.trim_matches(|c| c == '"' || c == '\'');
    Some((key.trim().to_ascii_lowercase(), value.trim().to_string()))
}

fn prop_f64(props: &[(String, String)], key: &str) -> Option<f64> {
    props
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .and_then(|(_, v)| v.parse().ok())
}

fn list_values(value: &str) -> Vec<String> {
    value
        .trim_matches(|c| matches!(c, '[' | ']' | '(' | ')' | '{' | '}' | '"' | '\''))
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Results read back after a solve.
#[derive(Debug, Default)]
struct Solution {
    /// `(bus, [(node, pu voltage)])` in export order.
    buses: Vec<(String, Vec<(u32, Complex64)>)>,
    taps: BTreeMap<String, f64>,
    reports: BTreeMap<ReportKind, ReportTable>,
}

/// Drives `opendsscmd` (or a compatible executable) through scripts.
#[derive(Debug)]
pub struct DssScriptEngine {
    executable: PathBuf,
    workdir: TempDir,
    commands: Vec<String>,
    definitions: Definitions,
    /// Loads whose kW or kvar was changed since the model was built.
    edited: BTreeMap<String, LoadDefinition>,
    solution: Option<Solution>,
    runs: usize,
    /// Export the reports of every solve in the same engine run.
    reports_with_solve: bool,
}

impl DssScriptEngine {
    /// # Errors
    ///
    /// Returns an error if the scratch directory cannot be created.
    pub fn new(executable: impl Into<PathBuf>) -> Result<Self> {
        let workdir = tempfile::Builder::new()
            .prefix("ev-grid-cosim-dss")
            .tempdir()
            .map_err(|e| Error::io(std::env::temp_dir(), e))?;
        Ok(Self {
            executable: executable.into(),
            workdir,
            commands: Vec::new(),
            definitions: Definitions::default(),
            edited: BTreeMap::new(),
            solution: None,
            runs: 0,
            reports_with_solve: false,
        })
    }

    /// Exports the [`ReportKind`] reports alongside every `Solve` instead of
    /// on the first request, saving a second engine run per step.
    pub fn with_reports(mut self, enabled: bool) -> Self {
        self.reports_with_solve = enabled;
        self
    }

    pub fn definitions(&self) -> &Definitions {
        &self.definitions
    }

    fn redirect(&mut self, target: &str) -> Result<()> {
        let target = target.trim_matches(|c| c == '"' || c == '\'');
        let path = std::path::absolute(target).map_err(|e| Error::io(target, e))?;
        let parsed = Definitions::parse_file(&path)?;
        for (name, load) in parsed.loads {
            upsert(&mut self.definitions.loads, &name, load);
        }
        for (name, xfmr) in parsed.transformers {
            upsert(&mut self.definitions.transformers, &name, xfmr);
        }
        self.commands.push(format!("Redirect \"{}\"", path.display()));
        Ok(())
    }

    fn load(&self, name: &str) -> Result<&LoadDefinition> {
        let name = name.to_ascii_lowercase();
        self.edited
            .get(&name)
            .or_else(|| {
                self.definitions
                    .loads
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, l)| l)
            })
            .ok_or_else(|| Error::Engine(format!("no load named `{name}`")))
    }

    fn edit_load(&mut self, name: &str, edit: impl FnOnce(&mut LoadDefinition)) -> Result<()> {
        let mut load = self.load(name)?.clone();
        edit(&mut load);
        self.edited.insert(name.to_ascii_lowercase(), load);
        self.solution = None;
        Ok(())
    }

    fn transformer(&self, name: &str) -> Result<&TransformerDefinition> {
        let name = name.to_ascii_lowercase();
        self.definitions
            .transformers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t)
            .ok_or_else(|| Error::Engine(format!("no transformer named `{name}`")))
    }

    fn solution(&self) -> Result<&Solution> {
        self.solution
            .as_ref()
            .ok_or_else(|| Error::Engine("circuit has not been solved".into()))
    }

    /// Model commands plus the load edits made since the last build.
    fn model_script(&self) -> String {
        let mut script = self.commands.join("\n");
        for (name, load) in &self.edited {
            script.push_str(&format!(
                "\nEdit Load.{name} kW={} kvar={}",
                load.kw, load.kvar
            ));
        }
        script
    }

    fn execute(&mut self, tail: &[String]) -> Result<()> {
        self.runs += 1;
        let script_path = self.workdir.path().join(format!("run_{}.dss", self.runs));
        let mut script = self.model_script();
        for line in tail {
            script.push('\n');
            script.push_str(line);
        }
        script.push('\n');
        fs::write(&script_path, script).map_err(|e| Error::io(&script_path, e))?;

        trace!(script = %script_path.display(), "running engine");
        let output = Command::new(&self.executable)
            .arg(&script_path)
            .current_dir(self.workdir.path())
            .output()
            .map_err(|e| Error::io(&self.executable, e))?;
        if !output.status.success() {
            return Err(Error::Engine(format!(
                "{} exited with {}: {}",
                self.executable.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn export_path(&self, what: &str) -> PathBuf {
        self.workdir.path().join(format!("{what}_{}.csv", self.runs + 1))
    }

    fn report_paths(&self) -> Vec<(ReportKind, PathBuf)> {
        ReportKind::ALL
            .iter()
            .map(|&k| (k, self.export_path(k.command_name())))
            .collect()
    }

    /// Commands appended to the model for one solve: `Solve`, the voltage and
    /// tap exports and, when enabled, the report exports.
    fn solve_commands(&self) -> Vec<String> {
        let mut tail = vec![
            "Solve".to_string(),
            format!("Export Voltages \"{}\"", self.export_path("voltages").display()),
            format!("Export Taps \"{}\"", self.export_path("taps").display()),
        ];
        if self.reports_with_solve {
            tail.extend(report_exports(&self.report_paths()));
        }
        tail
    }

    fn solve(&mut self) -> Result<()> {
        let voltages = self.export_path("voltages");
        let taps = self.export_path("taps");
        let reports = self.reports_with_solve.then(|| self.report_paths());
        let tail = self.solve_commands();
        self.execute(&tail)?;

        let buses = parse_voltage_export(&read_export(&voltages)?)?;
        let taps = if taps.exists() {
            parse_tap_export(&read_export(&taps)?)?
        } else {
            BTreeMap::new()
        };
        let reports = match reports {
            Some(paths) => read_reports(paths)?,
            None => BTreeMap::new(),
        };
        debug!(buses = buses.len(), taps = taps.len(), reports = reports.len(), "engine solved");
        self.solution = Some(Solution {
            buses,
            taps,
            reports,
        });
        Ok(())
    }

    /// Re-runs the solve once and exports every report of the solution.
    fn export_all_reports(&mut self) -> Result<()> {
        let paths = self.report_paths();
        let mut tail = vec!["Solve".to_string()];
        tail.extend(report_exports(&paths));
        self.execute(&tail)?;

        let reports = read_reports(paths)?;
        if let Some(solution) = self.solution.as_mut() {
            solution.reports = reports;
        }
        Ok(())
    }
}

fn report_exports(paths: &[(ReportKind, PathBuf)]) -> impl Iterator<Item = String> + '_ {
    paths
        .iter()
        .map(|(k, p)| format!("Export {} \"{}\"", k.command_name(), p.display()))
}

fn read_reports(paths: Vec<(ReportKind, PathBuf)>) -> Result<BTreeMap<ReportKind, ReportTable>> {
    let mut reports = BTreeMap::new();
    for (kind, path) in paths {
        let text = read_export(&path)?;
        reports.insert(kind, ReportTable::from_reader(text.as_bytes())?);
    }
    Ok(reports)
}

fn read_export(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| Error::io(path, e))
}

/// Parses `Export Voltages` output: `Bus, BasekV, Node1, Magnitude1, Angle1,
/// pu1, Node2, ...`. Node 0 columns are padding.
pub fn parse_voltage_export(text: &str) -> Result<Vec<(String, Vec<(u32, Complex64)>)>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut buses = Vec::new();
    for record in rdr.records() {
        let record = record?;
        let Some(bus) = record.get(0) else {
            continue;
        };
        let bus = bus.trim_matches('"').to_ascii_lowercase();
        let mut nodes = Vec::new();
        let fields: Vec<&str> = record.iter().skip(2).collect();
        for group in fields.chunks(4) {
            let [node, _magnitude, angle, pu] = group else {
                continue;
            };
            let node: u32 = node.parse().unwrap_or(0);
            if node == 0 {
                continue;
            }
            let (Ok(angle), Ok(pu)) = (angle.parse::<f64>(), pu.parse::<f64>()) else {
                return Err(Error::Engine(format!("bad voltage record for bus `{bus}`")));
            };
            nodes.push((node, Complex64::from_polar(pu, angle.to_radians())));
        }
        buses.push((bus, nodes));
    }
    Ok(buses)
}

/// Parses `Export Taps` output into per-unit taps keyed by transformer name.
pub fn parse_tap_export(text: &str) -> Result<BTreeMap<String, f64>> {
    let table = ReportTable::from_reader(text.as_bytes())?;
    let Some(col) = table
        .columns
        .iter()
        .position(|c| c.eq_ignore_ascii_case("tap"))
    else {
        return Ok(BTreeMap::new());
    };
    Ok(table
        .rows
        .iter()
        .filter_map(|(name, values)| {
            let name = name.trim_matches('"').to_ascii_lowercase();
            let name = name.strip_prefix("transformer.").unwrap_or(&name).to_string();
            values.get(col)?.parse().ok().map(|tap| (name, tap))
        })
        .collect())
}

impl CircuitEngine for DssScriptEngine {
    fn run_command(&mut self, command: &str) -> Result<()> {
        let command = command.trim();
        let (verb, rest) = command
            .split_once(char::is_whitespace)
            .unwrap_or((command, ""));
        match verb.to_ascii_lowercase().as_str() {
            "clear" => {
                self.commands.clear();
                self.definitions = Definitions::default();
                self.edited.clear();
                self.solution = None;
                self.commands.push("Clear".into());
            }
            "redirect" | "compile" => self.redirect(rest.trim())?,
            "solve" => self.solve()?,
            _ => {
                let inline = Definitions::parse(command);
                for (name, load) in inline.loads {
                    upsert(&mut self.definitions.loads, &name, load);
                }
                for (name, xfmr) in inline.transformers {
                    upsert(&mut self.definitions.transformers, &name, xfmr);
                }
                self.commands.push(command.to_string());
                self.solution = None;
            }
        }
        Ok(())
    }

    fn load_names(&self) -> Vec<String> {
        self.definitions.loads.iter().map(|(n, _)| n.clone()).collect()
    }

    fn load_kw(&self, name: &str) -> Result<f64> {
        Ok(self.load(name)?.kw)
    }

    fn load_kvar(&self, name: &str) -> Result<f64> {
        Ok(self.load(name)?.kvar)
    }

    fn set_load_kw(&mut self, name: &str, kw: f64) -> Result<()> {
        self.edit_load(name, |l| l.kw = kw)
    }

    fn set_load_kvar(&mut self, name: &str, kvar: f64) -> Result<()> {
        self.edit_load(name, |l| l.kvar = kvar)
    }

    fn bus_names(&self) -> Result<Vec<String>> {
        Ok(self.solution()?.buses.iter().map(|(b, _)| b.clone()).collect())
    }

    fn bus_nodes(&self, bus: &str) -> Result<Vec<u32>> {
        Ok(bus_entry(self.solution()?, bus)?.iter().map(|(n, _)| *n).collect())
    }

    fn bus_pu_voltages(&self, bus: &str) -> Result<Vec<Complex64>> {
        Ok(bus_entry(self.solution()?, bus)?.iter().map(|(_, v)| *v).collect())
    }

    fn transformer_names(&self) -> Vec<String> {
        self.definitions
            .transformers
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    fn transformer_tap(&self, name: &str) -> Result<f64> {
        let defined = self.transformer(name)?.tap;
        Ok(self
            .solution
            .as_ref()
            .and_then(|s| s.taps.get(&name.to_ascii_lowercase()))
            .copied()
            .unwrap_or(defined))
    }

    /// The tap export carries no winding, so this is the winding last
    /// selected in the transformer's definition.
    fn transformer_wdg(&self, name: &str) -> Result<u32> {
        Ok(self.transformer(name)?.wdg)
    }

    fn export_report(&mut self, kind: ReportKind) -> Result<ReportTable> {
        if self.solution()?.reports.is_empty() {
            self.export_all_reports()?;
        }
        self.solution()?
            .reports
            .get(&kind)
            .cloned()
            .ok_or_else(|| Error::Engine(format!("engine produced no {kind} report")))
    }
}

fn bus_entry<'a>(solution: &'a Solution, bus: &str) -> Result<&'a [(u32, Complex64)]> {
    let bus = bus.to_ascii_lowercase();
    solution
        .buses
        .iter()
        .find(|(b, _)| *b == bus)
        .map(|(_, nodes)| nodes.as_slice())
        .ok_or_else(|| Error::Engine(format!("no bus named `{bus}`")))
}
