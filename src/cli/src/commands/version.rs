//! `kiln version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("kiln version {}", kiln_core::VERSION);
    println!("runtime version {}", kiln_runtime::VERSION);
    Ok(())
}
