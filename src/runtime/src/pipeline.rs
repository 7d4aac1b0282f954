//! End-to-end build of a single inline Dockerfile.
//!
//! Archives the Dockerfile, submits it to an engine, and consumes the response
//! either structurally (interpret, stop at the first error) or as raw
//! passthrough. A build timeout is enforced here, around both submission and
//! consumption, so the log gathered before expiry still reaches the sink.

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use futures::StreamExt;
use kiln_core::config::LogMode;
use kiln_core::error::{KilnError, Result};
use tokio::time::Instant;

use crate::archive::BuildContext;
use crate::decode::decode_stream;
use crate::engine::{BuildEngine, BuildOptions, ByteStream, MessageStream};
use crate::interpret::BuildLog;

/// A build of one synthetic Dockerfile.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Entry name of the Dockerfile inside the context
    pub dockerfile_name: String,
    /// Dockerfile text
    pub dockerfile: String,
    /// Tags applied to the resulting image
    pub tags: Vec<String>,
    /// Remove intermediate containers after a successful build
    pub remove_intermediate: bool,
    /// Abandon the build after this long
    pub timeout: Option<Duration>,
}

/// Result of a successful build.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildReport {
    /// Full build log (structured mode only)
    pub log: Option<String>,
    /// Image id reported by the engine
    pub image_id: Option<String>,
    /// SHA256 digest of the submitted context, with "sha256:" prefix
    pub context_digest: String,
    /// Number of engine messages received
    pub messages: u64,
}

/// What a consumer saw of the message stream.
struct Consumed {
    log: Option<String>,
    image_id: Option<String>,
    messages: u64,
}

/// Point in time after which the build is abandoned.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    limit: Duration,
}

impl Deadline {
    fn after(limit: Duration) -> Self {
        Self {
            at: Instant::now() + limit,
            limit,
        }
    }

    fn expired(&self) -> KilnError {
        KilnError::TimeoutError(format!("build did not finish within {:?}", self.limit))
    }
}

/// Await `future`, giving up once `deadline` passes.
async fn within<F: Future>(deadline: Option<Deadline>, future: F) -> Result<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline.at, future)
            .await
            .map_err(|_| deadline.expired()),
        None => Ok(future.await),
    }
}

/// Run a build and write its log to `sink`.
///
/// In structured mode the log is written once the stream ends, or before the
/// error is returned if the build fails, the stream breaks or the timeout
/// expires. In passthrough mode every engine message is written as one JSON
/// line as it arrives and in-band errors are not detected.
///
/// Tags beyond the first are added once the engine reports the image id.
pub async fn run_build<E, W>(
    engine: &E,
    request: &BuildRequest,
    mode: LogMode,
    sink: &mut W,
) -> Result<BuildReport>
where
    E: BuildEngine + ?Sized,
    W: Write,
{
    let deadline = request.timeout.map(Deadline::after);

    let archive =
        BuildContext::single(&request.dockerfile_name, request.dockerfile.as_bytes())?
            .into_archive()?;
    let context_digest = archive.prefixed_digest();

    let options = BuildOptions {
        dockerfile: request.dockerfile_name.clone(),
        tags: request.tags.clone(),
        remove_intermediate: request.remove_intermediate,
    };

    let messages = within(deadline, engine.submit_build(archive, &options)).await??;

    let consumed = match mode {
        LogMode::Structured => consume_structured(messages, deadline, sink).await?,
        LogMode::Passthrough => consume_passthrough(messages, deadline, sink).await?,
    };

    apply_extra_tags(engine, &request.tags, consumed.image_id.as_deref(), deadline).await?;

    tracing::info!(
        mode = %mode,
        messages = consumed.messages,
        image_id = consumed.image_id.as_deref().unwrap_or("-"),
        "Build finished"
    );
    Ok(BuildReport {
        log: consumed.log,
        image_id: consumed.image_id,
        context_digest,
        messages: consumed.messages,
    })
}

/// Interpret a captured raw build log, e.g. the output of a passthrough build.
///
/// Writes the accumulated log to `sink` and returns it, or returns the first
/// build or decode error after writing the partial log.
pub async fn replay<W: Write>(raw: ByteStream<'_>, sink: &mut W) -> Result<String> {
    let consumed = consume_structured(decode_stream(raw), None, sink).await?;
    Ok(consumed.log.unwrap_or_default())
}

/// Interpret the stream, flushing the log to `sink` on any outcome.
async fn consume_structured<W: Write>(
    mut messages: MessageStream<'_>,
    deadline: Option<Deadline>,
    sink: &mut W,
) -> Result<Consumed> {
    let mut log = BuildLog::new();
    let mut received = 0u64;

    let outcome = async {
        while let Some(message) = within(deadline, messages.next()).await? {
            received += 1;
            log.feed(message?)?;
        }
        Ok::<(), KilnError>(())
    }
    .await;
    drop(messages);

    if let Err(e) = outcome {
        if !matches!(e, KilnError::BuildFailed { .. }) {
            tracing::warn!(error = %e, "Build response stream aborted");
        }
        write_log(sink, log.log())?;
        return Err(e);
    }

    let image_id = log.image_id().map(str::to_string);
    let text = log.finish()?;
    write_log(sink, &text)?;
    Ok(Consumed {
        log: Some(text),
        image_id,
        messages: received,
    })
}

/// Write every message to `sink` as one JSON line, without error detection.
async fn consume_passthrough<W: Write>(
    mut messages: MessageStream<'_>,
    deadline: Option<Deadline>,
    sink: &mut W,
) -> Result<Consumed> {
    let mut image_id = None;
    let mut received = 0u64;

    while let Some(message) = within(deadline, messages.next()).await? {
        let message = message?;
        received += 1;
        if let Some(id) = message.image_id() {
            image_id = Some(id.to_string());
        }
        serde_json::to_writer(&mut *sink, &message)?;
        sink.write_all(b"\n")?;
        sink.flush()?;
    }

    Ok(Consumed {
        log: None,
        image_id,
        messages: received,
    })
}

async fn apply_extra_tags<E: BuildEngine + ?Sized>(
    engine: &E,
    tags: &[String],
    image_id: Option<&str>,
    deadline: Option<Deadline>,
) -> Result<()> {
    let extra = tags.get(1..).unwrap_or_default();
    if extra.is_empty() {
        return Ok(());
    }
    let Some(image_id) = image_id else {
        tracing::warn!(tags = ?extra, "Engine reported no image id, extra tags not applied");
        return Ok(());
    };

    for tag in extra {
        within(deadline, engine.tag_image(image_id, tag)).await??;
        tracing::info!(image_id = %image_id, tag = %tag, "Tagged image");
    }
    Ok(())
}

fn write_log<W: Write>(sink: &mut W, text: &str) -> Result<()> {
    sink.write_all(text.as_bytes())?;
    sink.flush()?;
    Ok(())
}
