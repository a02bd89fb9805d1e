//! CSV export for recorded feeder telemetry.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::grid::telemetry::FeederTelemetry;

/// Leading columns; one `<regulator>_tap` column per regulator follows.
const HEADER: &str = "time,max_voltage_pu,min_voltage_pu";

/// Exports the voltage envelope and regulator taps to a CSV file at `path`.
///
/// # Errors
///
/// Returns an `io::Error` if file creation or writing fails.
pub fn export_csv(telemetry: &FeederTelemetry, path: &Path) -> io::Result<()> {
    let file = File::create(path)?;
    let buf = io::BufWriter::new(file);
    write_csv(telemetry, buf)
}

/// Writes one row per solved step. Taps missing at a step are left blank.
///
/// # Errors
///
/// Returns an `io::Error` if writing fails.
pub fn write_csv(telemetry: &FeederTelemetry, writer: impl Write) -> io::Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    let regulators = telemetry.taps.names();

    let mut header: Vec<String> = HEADER.split(',').map(str::to_string).collect();
    header.extend(regulators.iter().map(|r| format!("{r}_tap")));
    wtr.write_record(&header)?;

    for point in telemetry.voltage_envelope() {
        let mut record = vec![
            point.time.format("%Y-%m-%d %H:%M:%S").to_string(),
            format!("{:.6}", point.max_pu),
            format!("{:.6}", point.min_pu),
        ];
        record.extend(regulators.iter().map(|r| {
            telemetry
                .taps
                .get(point.time, r)
                .map(|tap| format!("{tap:.5}"))
                .unwrap_or_default()
        }));
        wtr.write_record(&record)?;
    }

    wtr.flush()?;
    Ok(())
}
