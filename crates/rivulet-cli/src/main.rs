//! Rivulet CLI - drive the audio graph engine from the command line.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rivulet")]
#[command(author, version, about = "Rivulet audio graph engine CLI", long_about = None)]
struct Cli {
    /// Engine config file (defaults to $RIVULET_CONFIG, then the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a realtime context on a driver thread while a control thread edits the graph
    Simulate(commands::simulate::SimulateArgs),

    /// Render a source chain offline and print a summary
    Render(commands::render::RenderArgs),

    /// Show, create or locate the engine config file
    Config(commands::config::ConfigArgs),
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;

    // Logs go to stderr so `--json` output stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    tracing_log::LogTracer::init().ok();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Simulate(args) => commands::simulate::run(args, config),
        Commands::Render(args) => commands::render::run(args, config),
        Commands::Config(args) => commands::config::run(args, config),
    }
}
