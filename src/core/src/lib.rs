//! Kiln Core - Foundational Types
//!
//! Errors, configuration and the build response message model shared by the
//! kiln runtime and CLI.

pub mod config;
pub mod error;
pub mod message;

// Re-export commonly used types
pub use config::{BuildDefaults, EngineConfig, KilnConfig, LogLevel, LogMode};
pub use error::{KilnError, Result};
pub use message::{BuildMessage, ErrorDetail};

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
