//! `kiln build` command: build an image from an inline Dockerfile.
//!
//! Writes the Dockerfile to a temporary `Dockerfile.*` file, packs it as the
//! sole entry of an in-memory build context, submits it to the engine and
//! prints the build log to stdout.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use kiln_core::{KilnConfig, LogMode};
use kiln_runtime::{run_build, BuildRequest, DockerEngine, EngineEndpoint};
use tempfile::NamedTempFile;

/// Dockerfile built when no `--file` is given. Its last step fails on purpose.
pub const DEFAULT_DOCKERFILE: &str = r#"
FROM alpine:3.8
RUN echo "hello world!"
ADD notexists /etc/
"#;

#[derive(Args)]
pub struct BuildArgs {
    /// Name and optionally tag for the image, can be repeated (default: build:sample)
    #[arg(short = 't', long = "tag")]
    pub tag: Vec<String>,

    /// Read the Dockerfile from this path instead of the built-in sample
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Engine address (unix:///path or tcp://host:port)
    #[arg(long = "host")]
    pub host: Option<String>,

    /// Print every engine message as a JSON line, without error detection
    #[arg(long)]
    pub raw: bool,

    /// Abort the build after this many seconds (0 disables the limit)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Keep intermediate containers
    #[arg(long = "no-rm")]
    pub no_rm: bool,
}

pub async fn execute(args: BuildArgs, config: KilnConfig) -> Result<(), Box<dyn std::error::Error>> {
    let dockerfile = read_dockerfile(args.file.as_deref())?;

    // The temp file only provides a unique name; it is removed on drop
    let (_tempfile, dockerfile_name) = write_temp_dockerfile(&dockerfile)?;

    let host = args.host.as_deref().unwrap_or(&config.engine.host);
    let engine = DockerEngine::connect(
        EngineEndpoint::parse(host)?,
        config.engine.api_version.as_deref(),
    )?;

    let request = BuildRequest {
        dockerfile_name,
        dockerfile,
        tags: effective_tags(&args.tag, &config),
        remove_intermediate: config.build.remove_intermediate && !args.no_rm,
        timeout: effective_timeout(args.timeout, &config),
    };
    let mode = effective_mode(args.raw, &config);

    tracing::debug!(
        dockerfile = %request.dockerfile_name,
        tags = ?request.tags,
        mode = %mode,
        timeout = ?request.timeout,
        "Starting build"
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let report = run_build(&engine, &request, mode, &mut out).await?;
    out.flush()?;

    if let Some(id) = &report.image_id {
        tracing::info!(image_id = %id, "Image built");
    }
    Ok(())
}

/// Dockerfile text from `path`, or the built-in sample.
fn read_dockerfile(path: Option<&Path>) -> Result<String, Box<dyn std::error::Error>> {
    match path {
        Some(p) => std::fs::read_to_string(p)
            .map_err(|e| format!("Failed to read Dockerfile {}: {}", p.display(), e).into()),
        None => Ok(DEFAULT_DOCKERFILE.to_string()),
    }
}

/// Write the Dockerfile to a fresh `Dockerfile.*` temp file.
///
/// Returns the file guard and its bare file name, which is used as the
/// archive entry name and the engine's `dockerfile` option.
fn write_temp_dockerfile(dockerfile: &str) -> std::io::Result<(NamedTempFile, String)> {
    let mut file = tempfile::Builder::new().prefix("Dockerfile.").tempfile()?;
    file.write_all(dockerfile.as_bytes())?;
    file.flush()?;

    let name = file
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "temp file has no name"))?;
    Ok((file, name))
}

fn effective_tags(args: &[String], config: &KilnConfig) -> Vec<String> {
    if args.is_empty() {
        config.build.tags.clone()
    } else {
        args.to_vec()
    }
}

fn effective_mode(raw: bool, config: &KilnConfig) -> LogMode {
    if raw {
        LogMode::Passthrough
    } else {
        config.build.mode
    }
}

fn effective_timeout(arg: Option<u64>, config: &KilnConfig) -> Option<Duration> {
    match arg {
        Some(0) => None,
        Some(secs) => Some(Duration::from_secs(secs)),
        None => config.timeout(),
    }
}
