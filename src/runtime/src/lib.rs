//! Kiln Runtime - inline Dockerfile builds against a container engine.
//!
//! This module provides the build-context archiver, the engine build client,
//! and the decoder/interpreter for the engine's streamed build log.

pub mod archive;
pub mod decode;
pub mod engine;
pub mod interpret;
pub mod pipeline;

// Re-export common types
pub use archive::{build_archive, ArchiveEntry, BuildContext, ContextArchive};
pub use decode::{decode_stream, MessageDecoder};
pub use engine::{
    BuildEngine, BuildOptions, ByteStream, DockerEngine, EngineEndpoint, MessageStream,
};
pub use interpret::{BuildLog, LogState};
pub use pipeline::{replay, run_build, BuildReport, BuildRequest};

/// Kiln Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
