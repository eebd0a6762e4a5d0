use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, LevelFilter};

use pimflow::config::{load_config, ConfigError, RunMode};
use pimflow::sim::Simulator;

/// Cycle-level simulator for a systolic-array NPU coupled with a
/// processing-in-memory DRAM subsystem.
#[derive(Parser, Debug)]
#[command(name = "pimflow", version)]
struct Args {
    /// Path for hardware configuration file
    #[arg(long)]
    config: PathBuf,

    /// Path for memory configuration file
    #[arg(long)]
    mem_config: Option<PathBuf>,

    /// Path for client configuration file
    #[arg(long)]
    cli_config: Option<PathBuf>,

    /// Path for model configuration file
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// Path for system configuration file
    #[arg(long)]
    sys_config: Option<PathBuf>,

    /// Path for experiment result log directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log level [trace, debug, info]
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run mode override [NPU_ONLY, NPU_PIM]
    #[arg(long)]
    mode: Option<String>,
}

fn run(args: Args) -> Result<(), ConfigError> {
    let overlays: Vec<&Path> = [
        args.mem_config.as_deref(),
        args.cli_config.as_deref(),
        args.model_config.as_deref(),
        args.sys_config.as_deref(),
    ]
    .into_iter()
    .flatten()
    .collect();

    let mut config = load_config(&args.config, &overlays)?;

    if let Some(mode) = &args.mode {
        config.run_mode = match mode.as_str() {
            "NPU_ONLY" => RunMode::NpuOnly,
            "NPU_PIM" => RunMode::NpuPim,
            other => {
                return Err(ConfigError::InvalidField {
                    field: "mode",
                    reason: format!("unknown run mode '{}'", other),
                })
            }
        };
    }
    if let Some(log_dir) = &args.log_dir {
        config.log_dir = log_dir.display().to_string();
    }

    info!(
        "model {}, mode {:?}, {} requests",
        config.model_name, config.run_mode, config.request_total_cnt
    );

    let mut simulator = Simulator::new(config);
    simulator.run();
    simulator.log_summary();

    match simulator.write_operation_log() {
        Ok(path) => info!("operation log written to {}", path.display()),
        Err(e) => error!("failed to write operation log: {}", e),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        _ => LevelFilter::Info,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
