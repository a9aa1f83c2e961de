//! Marginalia CLI - operator interface for the note personalization engine
//!
//! Builds base models, generates and regenerates notes, trains per-user
//! adapters from feedback files and inspects what the adapter store holds.

use anyhow::Result;
use clap::{Parser, Subcommand};
use console::style;
use marginalia_core::config::LogLevel;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod commands;
mod config;
mod utils;

use commands::{
    adapters::AdaptersCommand, generate::GenerateCommand, init_model::InitModelCommand,
    regenerate::RegenerateCommand, train::TrainCommand, Command,
};

#[derive(Parser)]
#[command(
    name = "marginalia",
    version = env!("CARGO_PKG_VERSION"),
    about = "Marginalia note personalization CLI",
    long_about = "Generate study notes, regenerate rejected ones and train per-user adapters from feedback."
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(short, long, global = true, env = "MARGINALIA_CONFIG")]
    config: Option<PathBuf>,

    /// JSON output format
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a base model and tokenizer from a text corpus
    #[command(name = "init-model")]
    InitModel(InitModelCommand),

    /// Generate a note for some content
    #[command(name = "generate", alias = "g")]
    Generate(GenerateCommand),

    /// Replace a rejected note for a user
    #[command(name = "regenerate", alias = "r")]
    Regenerate(RegenerateCommand),

    /// Train a user's adapter from a feedback file
    #[command(name = "train", alias = "t")]
    Train(TrainCommand),

    /// Inspect stored adapters
    #[command(name = "adapters", alias = "a")]
    Adapters(AdaptersCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load(cli.config.as_deref())?;

    init_logging(&cli, config.engine.logging.level)?;

    debug!("Marginalia CLI v{} starting", env!("CARGO_PKG_VERSION"));
    debug!("Configuration loaded: {:?}", config);

    let result = match &cli.command {
        Commands::InitModel(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Generate(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Regenerate(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Train(cmd) => cmd.execute(&config, cli.json).await,
        Commands::Adapters(cmd) => cmd.execute(&config, cli.json).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(cli: &Cli, configured: LogLevel) -> Result<()> {
    let default_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else if cli.quiet {
        "error"
    } else {
        configured.as_directive()
    };

    // RUST_LOG wins over the flags
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
