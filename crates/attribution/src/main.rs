//! attrib - attribution registration coordinator CLI

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use attribution_core::CoordinatorConfig;
use attribution_core::logging::{LogFormat, init_logging};

mod replay;

#[derive(Parser)]
#[command(name = "attrib")]
#[command(version, about = "Replay and inspect attribution registration coordination", long_about = None)]
struct Cli {
    /// Coordinator config file (TOML)
    #[arg(long, global = true, env = "ATTRIB_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario trace against a recording sink
    Replay {
        /// Trace file with [[step]] tables
        trace: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Ignore --config and print built-in defaults
        #[arg(long)]
        defaults: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<CoordinatorConfig> {
    let Some(path) = path else {
        return Ok(CoordinatorConfig::default());
    };
    // `load` validates as well as parses.
    CoordinatorConfig::load(path)
        .with_context(|| format!("loading config from {}", path.display()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { defaults: true } = cli.command {
        print!("{}", CoordinatorConfig::default().to_toml_string()?);
        return Ok(());
    }

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    match cli.command {
        Commands::Config { .. } => {
            print!("{}", config.to_toml_string()?);
        }
        Commands::Replay { trace, json } => {
            init_logging(&config.logging).context("initializing logging")?;
            let trace = replay::Trace::load(&trace)?;
            let report = replay::run(config, &trace)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report.render());
            }
        }
    }
    Ok(())
}
