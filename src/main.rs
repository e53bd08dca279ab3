use std::path::PathBuf;

use clap::Parser;
use log::{error, info, LevelFilter};

use simp_topopt::{driver, error::TopOptError, input, post_processor};

/// SIMP compliance topology optimization of 2D domains
#[derive(Parser)]
#[command(name = "simp-topopt")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "SIMP structural topology optimization in 2D", long_about = None)]
struct Cli {
    /// Problem definition file
    input_json: String,

    /// Directory receiving nodes.csv, elements.csv and history.csv
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn run(cli: &Cli) -> Result<(), TopOptError> {
    let input_json = input::load_input_file(&cli.input_json)?;
    let problem = input::parse_problem(&input_json)?;

    let (mesh, result) = driver::run(&problem)?;
    post_processor::csv_output(&mesh, &result, &cli.output_dir)?;

    if let Some(last) = result.history.last() {
        info!(
            "final compliance {:.6e} at volume fraction {:.4} ({:?})",
            last.compliance, last.volume_fraction, result.termination
        );
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp(None)
        .init();

    if let Err(err) = run(&cli) {
        error!("{err}");
        std::process::exit(1);
    }
}
