use std::env;
use std::path::PathBuf;

pub struct CliOptions {
    pub config: Option<PathBuf>,
    pub preset: Option<String>,
    pub sweep: bool,
    pub telemetry_out: Option<PathBuf>,
    pub plot: Option<PathBuf>,
    pub detailed_metrics: bool,
}

pub fn parse_args() -> Result<CliOptions, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    parse_args_from(args)
}

fn parse_args_from(args: Vec<String>) -> Result<CliOptions, String> {
    if args.len() == 1 && (args[0] == "--help" || args[0] == "-h") {
        print_usage();
        std::process::exit(0);
    }
    parse_options(&args)
}

fn parse_options(args: &[String]) -> Result<CliOptions, String> {
    let mut i = 0usize;
    let mut config = None;
    let mut preset = None;
    let mut sweep = false;
    let mut telemetry_out = None;
    let mut plot = None;
    let mut detailed_metrics = true;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                let path =
                    args.next_or_err(i, "missing value for --config (expected a TOML file path)")?;
                if config.replace(PathBuf::from(path)).is_some() {
                    return Err("--config provided more than once".to_string());
                }
            }
            "--preset" => {
                i += 1;
                let name =
                    args.next_or_err(i, "missing value for --preset (expected a preset name)")?;
                if preset.replace(name.to_string()).is_some() {
                    return Err("--preset provided more than once".to_string());
                }
            }
            "--sweep" => sweep = true,
            "--telemetry-out" => {
                i += 1;
                let path = args.next_or_err(
                    i,
                    "missing value for --telemetry-out (expected a file path)",
                )?;
                if telemetry_out.replace(PathBuf::from(path)).is_some() {
                    return Err("--telemetry-out provided more than once".to_string());
                }
            }
            "--plot" => {
                i += 1;
                let path =
                    args.next_or_err(i, "missing value for --plot (expected an SVG file path)")?;
                if plot.replace(PathBuf::from(path)).is_some() {
                    return Err("--plot provided more than once".to_string());
                }
            }
            "--no-detailed-metrics" => detailed_metrics = false,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }

    if config.is_some() && preset.is_some() {
        return Err(
            "arguments `--config` and `--preset` are mutually exclusive; choose one source"
                .to_string(),
        );
    }

    if config.is_none() && preset.is_none() {
        preset = Some("demo".to_string());
    }

    Ok(CliOptions {
        config,
        preset,
        sweep,
        telemetry_out,
        plot,
        detailed_metrics,
    })
}

trait SliceArgExt {
    fn next_or_err(&self, index: usize, err: &str) -> Result<&str, String>;
}

impl SliceArgExt for [String] {
    fn next_or_err(&self, index: usize, err: &str) -> Result<&str, String> {
        self.get(index)
            .map(String::as_str)
            .ok_or_else(|| err.to_string())
    }
}

pub fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  ev-grid-cosim [--config <path> | --preset <name>] [--sweep]");
    eprintln!("                [--telemetry-out <path>] [--plot <path>] [--no-detailed-metrics]");
}

#[cfg(test)]
mod tests {
    use super::parse_args_from;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn supports_config_cli() {
        let opts =
            parse_args_from(args(&["--config", "cosim.toml"])).expect("parse should succeed");
        assert_eq!(opts.config.as_deref().and_then(|p| p.to_str()), Some("cosim.toml"));
        assert!(opts.preset.is_none());
        assert!(!opts.sweep);
        assert!(opts.detailed_metrics);
    }

    #[test]
    fn defaults_to_demo_preset() {
        let opts = parse_args_from(Vec::new()).expect("parse should succeed");
        assert_eq!(opts.preset.as_deref(), Some("demo"));
    }

    #[test]
    fn supports_outputs_and_flags() {
        let opts = parse_args_from(args(&[
            "--preset",
            "solar_mix",
            "--telemetry-out",
            "out.csv",
            "--plot",
            "voltages.svg",
            "--no-detailed-metrics",
            "--sweep",
        ]))
        .expect("parse should succeed");
        assert_eq!(opts.preset.as_deref(), Some("solar_mix"));
        assert_eq!(opts.telemetry_out.as_deref().and_then(|p| p.to_str()), Some("out.csv"));
        assert_eq!(opts.plot.as_deref().and_then(|p| p.to_str()), Some("voltages.svg"));
        assert!(!opts.detailed_metrics);
        assert!(opts.sweep);
    }

    #[test]
    fn rejects_config_and_preset_together() {
        let err = parse_args_from(args(&["--config", "a.toml", "--preset", "demo"])).err();
        assert!(err.is_some_and(|e| e.contains("mutually exclusive")));
    }

    #[test]
    fn rejects_missing_value_and_unknown_flag() {
        assert!(parse_args_from(args(&["--plot"])).is_err());
        let err = parse_args_from(args(&["--scenario", "x"])).err();
        assert_eq!(err.as_deref(), Some("unknown argument: --scenario"));
    }

    #[test]
    fn rejects_repeated_output() {
        let err =
            parse_args_from(args(&["--telemetry-out", "a.csv", "--telemetry-out", "b.csv"])).err();
        assert_eq!(err.as_deref(), Some("--telemetry-out provided more than once"));
    }
}
