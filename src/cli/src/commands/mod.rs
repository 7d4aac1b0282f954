//! CLI command definitions and dispatch.

mod build;
mod replay;
mod version;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use kiln_core::KilnConfig;

/// Kiln - build container images from inline Dockerfiles.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// Config file (default: ~/.kiln/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Build an image from an inline or file Dockerfile
    Build(build::BuildArgs),
    /// Interpret a build log captured with `kiln build --raw`
    Replay(replay::ReplayArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Load the config file and apply environment overrides.
pub fn load_config(path: Option<&Path>) -> kiln_core::Result<KilnConfig> {
    let mut config = KilnConfig::load(path)?;
    config.apply_env();
    Ok(config)
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli, config: KilnConfig) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args, config).await,
        Command::Replay(args) => replay::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
