//! Kiln CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kiln_cli::commands::{dispatch, load_config, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    // Initialize tracing; stdout is reserved for the build log
    let default_level = tracing::Level::from(config.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level.as_str().to_lowercase())),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    if let Err(e) = dispatch(cli, config).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
