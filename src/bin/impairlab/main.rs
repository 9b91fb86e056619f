//! Impaired-link testbench CLI
//!
//! Runs one experiment (a built-in preset or a JSON config), or lists and
//! prints the available configurations.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cmd_list, cmd_run, cmd_show, resolve_config};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Skip the interactive wait and tear down as soon as primary tasks finish
    #[arg(long)]
    autotest: bool,

    /// Built-in experiment (see `list`)
    #[arg(long, global = true, conflicts_with = "config")]
    preset: Option<String>,

    /// Experiment description (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory for captures and workload logs
    #[arg(long, global = true)]
    shared_dir: Option<PathBuf>,

    /// Seed for the impairment scheduler
    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available presets
    List,

    /// Print the resolved experiment as JSON
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::List) => cmd_list(),
        Some(Commands::Show) => {
            let config = resolve_config(
                cli.preset.as_deref(),
                cli.config.as_deref(),
                cli.shared_dir,
                cli.seed,
            )
            .await?;
            cmd_show(&config)
        }
        None => {
            let config = resolve_config(
                cli.preset.as_deref(),
                cli.config.as_deref(),
                cli.shared_dir,
                cli.seed,
            )
            .await?;
            cmd_run(config, cli.autotest).await
        }
    }
}
