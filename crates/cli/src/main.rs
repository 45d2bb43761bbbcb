//! tandem CLI - Main Entry Point
//!
//! Runs collaborative multi-device UI scripts, validates them and
//! summarizes saved results.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;
mod config;
mod output;

use commands::{config as config_cmd, run, summarize, validate};

/// tandem - multi-device UI test orchestration
#[derive(Parser)]
#[command(name = "tandem")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(long, short = 'c', default_value = "tandem.toml", env = "TANDEM_CONFIG", global = true)]
    config: PathBuf,

    /// Output format
    #[arg(long, default_value = "table", global = true)]
    format: output::OutputFormat,

    /// Log line format
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormat,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a collaborative script across its devices
    Run(run::RunArgs),

    /// Parse and validate scripts without running them
    Validate(validate::ValidateArgs),

    /// Aggregate a saved execution result
    Summarize(summarize::SummarizeArgs),

    /// Manage the configuration file
    #[command(subcommand)]
    Config(config_cmd::ConfigCommands),
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // stdout is reserved for command output
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<bool> {
    match cli.command {
        Commands::Run(args) => {
            let config = config::TandemConfig::load(&cli.config)?;
            run::execute(args, config, cli.format).await
        }
        Commands::Validate(args) => validate::execute(args, cli.format),
        Commands::Summarize(args) => summarize::execute(args, cli.format),
        Commands::Config(cmd) => {
            config_cmd::execute(cmd, &cli.config, cli.format)?;
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match dispatch(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::from(2)
        }
    }
}
