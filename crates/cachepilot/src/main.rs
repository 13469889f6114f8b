//! cachepilot command line
//!
//! Thin shell around the engine: parse arguments, load config, initialize
//! logging, dispatch. All residency logic lives in `cachepilot_engine`.

use anyhow::{Context, Result};
use cachepilot_engine::config::{self, Settings};
use cachepilot_logging::LogConfig;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cli;

#[derive(Parser, Debug)]
#[command(name = "cachepilot", about = "Two-tier cache residency for a media library")]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file path (default: ~/.cachepilot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute one residency run: fetch the feed, plan, move files
    Run {
        /// Compute and report the plan without moving anything
        #[arg(long)]
        dry_run: bool,

        /// Reuse the last feed snapshot instead of fetching
        #[arg(long)]
        skip_refresh: bool,

        /// Output the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show cache contents, free space and artifact locations
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Inspect both tiers and every artifact for inconsistencies
    Audit {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Repair inconsistencies found by audit
    Fix {
        #[command(subcommand)]
        action: cli::maintain::FixAction,
    },
}

fn run_command(cli: Cli) -> Result<ExitCode> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    let settings = Settings::load(&config_path).with_context(|| {
        format!("Failed to load configuration from {}", config_path.display())
    })?;

    match cli.command {
        Commands::Run {
            dry_run,
            skip_refresh,
            json,
        } => cli::run::run(
            settings,
            cli::run::RunArgs {
                dry_run,
                skip_refresh,
                json,
            },
        ),
        Commands::Status { json } => cli::status::run(&settings, json),
        Commands::Audit { json } => cli::maintain::audit(&settings, json),
        Commands::Fix { action } => cli::maintain::fix(&settings, action),
    }
}


fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = cachepilot_logging::init_logging(LogConfig {
        app_name: "cachepilot",
        verbose: cli.verbose,
    }) {
        eprintln!("Warning: failed to initialize logging: {err:#}");
    }

    match run_command(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}
