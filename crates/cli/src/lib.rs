pub mod commands;
pub mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dealflow_core::config::{AppConfig, LoadOptions};

use crate::commands::analyze::AnalyzeArgs;

#[derive(Debug, Parser)]
#[command(
    name = "dealflow",
    about = "Dealflow pipeline analytics CLI",
    long_about = "Run funnel, prioritization, win/loss and forecast analytics over a CRM snapshot.",
    after_help = "Examples:\n  \
        dealflow analyze --snapshot snapshot.json --as-of 2024-06-30\n  \
        dealflow config\n  \
        dealflow doctor --json"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to a dealflow.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Analyze a snapshot and print the result bundle as JSON")]
    Analyze {
        #[arg(long, help = "Snapshot file with `deals` and `events` arrays")]
        snapshot: Option<PathBuf>,
        #[arg(long, conflicts_with = "snapshot", help = "JSON array of raw deal records")]
        deals: Option<PathBuf>,
        #[arg(long, requires = "deals", help = "JSON array of raw stage-event records")]
        events: Option<PathBuf>,
        #[arg(long, help = "Analysis instant (RFC 3339 or YYYY-MM-DD); defaults to now")]
        as_of: Option<String>,
        #[arg(long, default_value_t = 4, help = "Worker tasks for history reconstruction")]
        workers: usize,
        #[arg(long, help = "Window basis: created, effective_close or last_modified")]
        window_basis: Option<String>,
        #[arg(long, help = "Inclusive window start")]
        window_start: Option<String>,
        #[arg(long, help = "Inclusive window end; a bare date runs through 23:59:59")]
        window_end: Option<String>,
        #[arg(long, help = "Win/loss breakdowns, e.g. team,rep,stage_of_loss")]
        dimensions: Option<String>,
        #[arg(long, help = "Pretty-print the JSON payload")]
        pretty: bool,
    },
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, pipeline definition and snapshot readability")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
        #[arg(long, help = "Snapshot file to check for readability")]
        snapshot: Option<PathBuf>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    // Logging follows the config when it loads; command handlers report
    // config failures themselves.
    let options = LoadOptions {
        require_file: cli.config.is_some(),
        config_path: cli.config.clone(),
        ..LoadOptions::default()
    };
    let logging = AppConfig::load(options)
        .map(|config| config.logging)
        .unwrap_or_else(|_| AppConfig::default().logging);
    logging::init_logging(&logging);

    let result = match cli.command {
        Command::Analyze {
            snapshot,
            deals,
            events,
            as_of,
            workers,
            window_basis,
            window_start,
            window_end,
            dimensions,
            pretty,
        } => commands::analyze::run(AnalyzeArgs {
            config_path: cli.config,
            snapshot,
            deals,
            events,
            as_of,
            workers,
            window_basis,
            window_start,
            window_end,
            dimensions,
            pretty,
        }),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run(cli.config) }
        }
        Command::Doctor { json, snapshot } => commands::CommandResult {
            exit_code: 0,
            output: commands::doctor::run(json, cli.config, snapshot),
        },
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
