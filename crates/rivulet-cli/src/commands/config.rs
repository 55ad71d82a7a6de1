//! Engine config file management.

use std::path::Path;

use anyhow::Context;
use clap::{Args, Subcommand};
use rivulet_config::{EngineConfig, paths};

use super::common::load_engine_config;

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    action: ConfigAction,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective engine config as TOML
    Show,

    /// Write a default engine config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the path of the engine config file
    Path,
}

pub fn run(args: ConfigArgs, config: Option<&Path>) -> anyhow::Result<()> {
    match args.action {
        ConfigAction::Show => {
            let engine = load_engine_config(config)?;
            if let Err(e) = engine.validate() {
                tracing::warn!("config is invalid: {e}");
            }
            print!("{}", engine.to_toml()?);
        }
        ConfigAction::Init { force } => {
            let path = paths::resolve_engine_config(config);
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            EngineConfig::default()
                .save(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Wrote {}", path.display());
        }
        ConfigAction::Path => {
            let path = paths::resolve_engine_config(config);
            let status = if path.is_file() { "" } else { " (not created)" };
            println!("{}{status}", path.display());
        }
    }
    Ok(())
}
