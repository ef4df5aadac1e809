use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "certify")]
#[command(about = "Appliance certification - provision a VM and run a check suite on it")]
#[command(version)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision an instance and run the suite's checks
    Run {
        /// Suite file
        suite: PathBuf,

        /// Skip the remaining checks after the first failure
        #[arg(long)]
        fail_fast: bool,
    },

    /// Validate a suite file without provisioning anything
    Validate {
        /// Suite file
        suite: PathBuf,

        /// Strict mode - fail on missing environment variables
        #[arg(short, long)]
        strict: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    smol::block_on(async {
        match cli.command {
            Commands::Run { suite, fail_fast } => commands::run::run(&suite, fail_fast).await,
            Commands::Validate { suite, strict } => commands::validate::run(&suite, strict).await,
        }
    })
}
