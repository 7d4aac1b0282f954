//! `kiln replay` command: interpret a captured raw build log.
//!
//! Reads the JSON lines written by `kiln build --raw` (from a file or stdin),
//! prints the reconstructed log and fails the same way the build would have.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use clap::Args;
use futures::StreamExt;
use kiln_runtime::{replay, ByteStream};

/// Size of the chunks handed to the decoder.
const CHUNK_SIZE: usize = 8 * 1024;

#[derive(Args)]
pub struct ReplayArgs {
    /// Captured log file (default: stdin)
    pub file: Option<PathBuf>,
}

pub async fn execute(args: ReplayArgs) -> Result<(), Box<dyn std::error::Error>> {
    let raw = read_input(args.file.as_deref())?;
    tracing::debug!(bytes = raw.len(), "Replaying build log");

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    replay(into_chunks(raw), &mut out).await?;
    out.flush()?;
    Ok(())
}

fn read_input(path: Option<&Path>) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    match path {
        Some(p) => std::fs::read(p)
            .map_err(|e| format!("Failed to read build log {}: {}", p.display(), e).into()),
        None => {
            let mut raw = Vec::new();
            std::io::stdin().read_to_end(&mut raw)?;
            Ok(raw)
        }
    }
}

fn into_chunks(raw: Vec<u8>) -> ByteStream<'static> {
    let raw = Bytes::from(raw);
    let chunks: Vec<kiln_core::Result<Bytes>> = (0..raw.len())
        .step_by(CHUNK_SIZE)
        .map(|start| Ok(raw.slice(start..(start + CHUNK_SIZE).min(raw.len()))))
        .collect();
    futures::stream::iter(chunks).boxed()
}
