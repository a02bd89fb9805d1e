//! EV charging and feeder co-simulation entry point.

use std::process;

use ev_grid_cosim::cli::{self, CliOptions};
use ev_grid_cosim::config::CosimConfig;
use ev_grid_cosim::grid::{DssScriptEngine, VoltageKpiReport};
use ev_grid_cosim::io::export::export_csv;
use ev_grid_cosim::{logging, runner};
use tracing::{error, info};

fn load_config(cli: &CliOptions) -> Result<CosimConfig, String> {
    let config = if let Some(path) = &cli.config {
        CosimConfig::from_toml_file(path).map_err(|e| e.to_string())?
    } else {
        CosimConfig::from_preset(cli.preset.as_deref().unwrap_or("demo"))
            .map_err(|e| e.to_string())?
    };

    let errors = config.validate();
    if !errors.is_empty() {
        let lines: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return Err(lines.join("\n"));
    }
    Ok(config)
}

fn run(cli: &CliOptions) -> Result<(), String> {
    let config = load_config(cli)?;

    if cli.sweep {
        let outcomes = runner::run_sweep(&config).map_err(|e| e.to_string())?;
        for o in &outcomes {
            println!(
                "{:<8} {:<16} {:<26} {:>12.2} kWh",
                o.site, o.alg_name, o.tariff_name, o.energy_delivered_kwh
            );
        }
        return Ok(());
    }

    let mut config = config;
    config.cosim.detailed_metrics &= cli.detailed_metrics;
    let engine = DssScriptEngine::new(&config.feeder.dss_executable)
        .map_err(|e| e.to_string())?
        .with_reports(config.cosim.detailed_metrics);
    let composite = runner::run_cosim(&config, engine).map_err(|e| e.to_string())?;

    let telemetry = composite.feeder().telemetry();
    println!("{}", VoltageKpiReport::from_telemetry(telemetry));

    if let Some(path) = &cli.telemetry_out {
        export_csv(telemetry, path).map_err(|e| format!("failed to write CSV: {e}"))?;
        info!(path = %path.display(), "telemetry written");
    }
    if let Some(path) = &cli.plot {
        composite
            .plot_dss_voltages(path, Some("Feeder voltage envelope"), true)
            .map_err(|e| e.to_string())?;
        info!(path = %path.display(), "voltage plot written");
    }
    Ok(())
}

fn main() {
    logging::init();

    let cli = match cli::parse_args() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("error: {e}");
            cli::print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = run(&cli) {
        error!("{e}");
        process::exit(1);
    }
}
