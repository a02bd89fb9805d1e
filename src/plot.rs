//! SVG chart of the feeder voltage envelope.

use std::fs;
use std::path::Path;

use chrono::TimeDelta;
use plotters::prelude::*;

use crate::error::{Error, Result};
use crate::grid::kpi::{LOWER_LIMIT_PU, UPPER_LIMIT_PU};
use crate::grid::telemetry::EnvelopePoint;

#[derive(Debug, Clone)]
pub struct VoltagePlotOptions {
    pub title: Option<String>,
    pub legend: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for VoltagePlotOptions {
    fn default() -> Self {
        Self {
            title: None,
            legend: true,
            width: 1000,
            height: 500,
        }
    }
}

fn plot_err(e: impl std::fmt::Display) -> Error {
    Error::Plot(e.to_string())
}

/// Renders max and min node voltage against time of day, with the
/// 0.95/1.05 p.u. band drawn as dashed grey lines.
///
/// Returns an empty string when `envelope` is empty.
///
/// # Errors
///
/// Returns [`Error::Plot`] if the backend fails.
pub fn voltage_svg(envelope: &[EnvelopePoint], options: &VoltagePlotOptions) -> Result<String> {
    let mut svg = String::new();
    let Some(first) = envelope.first() else {
        return Ok(svg);
    };
    let origin = first.time;
    let hours = |p: &EnvelopePoint| (p.time - origin).num_seconds() as f64 / 3600.0;

    let x_max = envelope.last().map_or(1.0, hours).max(1.0 / 12.0);
    let y_min = envelope
        .iter()
        .map(|p| p.min_pu)
        .fold(LOWER_LIMIT_PU, f64::min)
        - 0.01;
    let y_max = envelope
        .iter()
        .map(|p| p.max_pu)
        .fold(UPPER_LIMIT_PU, f64::max)
        + 0.01;

    {
        let root = SVGBackend::with_string(&mut svg, (options.width, options.height))
            .into_drawing_area();
        root.fill(&WHITE).map_err(plot_err)?;

        let mut builder = ChartBuilder::on(&root);
        builder.margin(15).x_label_area_size(40).y_label_area_size(60);
        if let Some(title) = &options.title {
            builder.caption(title, ("sans-serif", 20));
        }
        let mut chart = builder
            .build_cartesian_2d(0.0..x_max, y_min..y_max)
            .map_err(plot_err)?;

        let tick_label = |h: &f64| {
            let at = origin + TimeDelta::seconds((h * 3600.0).round() as i64);
            at.format("%H:%M").to_string()
        };
        chart
            .configure_mesh()
            .x_desc("Time of day")
            .y_desc("Voltage p.u.")
            .x_labels(12)
            .y_labels(10)
            .x_label_formatter(&tick_label)
            .draw()
            .map_err(plot_err)?;

        chart
            .draw_series(LineSeries::new(
                envelope.iter().map(|p| (hours(p), p.max_pu)),
                &BLUE,
            ))
            .map_err(plot_err)?
            .label("Max")
            .legend(|(x, y)| PathElement::new([(x, y), (x + 20, y)], &BLUE));
        chart
            .draw_series(LineSeries::new(
                envelope.iter().map(|p| (hours(p), p.min_pu)),
                &RED,
            ))
            .map_err(plot_err)?
            .label("Min")
            .legend(|(x, y)| PathElement::new([(x, y), (x + 20, y)], &RED));

        let grey = RGBColor(128, 128, 128);
        for limit in [UPPER_LIMIT_PU, LOWER_LIMIT_PU] {
            chart
                .draw_series(DashedLineSeries::new(
                    [(0.0, limit), (x_max, limit)],
                    8,
                    4,
                    grey.stroke_width(1),
                ))
                .map_err(plot_err)?;
        }

        if options.legend {
            chart
                .configure_series_labels()
                .background_style(&WHITE.mix(0.8))
                .border_style(&BLACK)
                .draw()
                .map_err(plot_err)?;
        }
        root.present().map_err(plot_err)?;
    }

    Ok(svg)
}

/// # Errors
///
/// Returns an error if rendering fails or `path` cannot be written.
pub fn write_voltage_svg(
    envelope: &[EnvelopePoint],
    options: &VoltagePlotOptions,
    path: &Path,
) -> Result<()> {
    let svg = voltage_svg(envelope, options)?;
    fs::write(path, svg).map_err(|e| Error::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn envelope() -> Vec<EnvelopePoint> {
        let start = NaiveDate::from_ymd_opt(2019, 7, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid time");
        (0..24)
            .map(|h| EnvelopePoint {
                time: start + TimeDelta::hours(h),
                max_pu: 1.02 + 0.001 * h as f64,
                min_pu: 0.97 - 0.001 * h as f64,
            })
            .collect()
    }

    #[test]
    fn renders_svg_with_labels() {
        let options = VoltagePlotOptions {
            title: Some("Feeder voltage".into()),
            ..VoltagePlotOptions::default()
        };
        let svg = voltage_svg(&envelope(), &options).expect("render");
        assert!(svg.contains("<svg"));
        assert!(svg.contains("Time of day"));
        assert!(svg.contains("Voltage p.u."));
        assert!(svg.contains("Feeder voltage"));
    }

    #[test]
    fn empty_envelope_renders_nothing() {
        let svg = voltage_svg(&[], &VoltagePlotOptions::default()).expect("render");
        assert!(svg.is_empty());
    }

    #[test]
    fn writes_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("voltages.svg");
        write_voltage_svg(&envelope(), &VoltagePlotOptions::default(), &path).expect("write");
        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("</svg>"));
    }
}
