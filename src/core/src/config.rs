use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{KilnError, Result};

/// Default engine socket.
pub const DEFAULT_ENGINE_HOST: &str = "unix:///var/run/docker.sock";

/// Default tag for built images.
pub const DEFAULT_IMAGE_TAG: &str = "build:sample";

/// Kiln configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KilnConfig {
    /// Container engine connection
    #[serde(default)]
    pub engine: EngineConfig,

    /// Build request defaults
    #[serde(default)]
    pub build: BuildDefaults,

    /// Whole-build timeout in seconds (0 = unlimited)
    #[serde(default)]
    pub timeout_secs: u64,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,
}

impl KilnConfig {
    /// Default config file location (~/.kiln/config.yaml).
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|h| h.join(".kiln"))
            .unwrap_or_else(|| PathBuf::from(".kiln"))
            .join("config.yaml")
    }

    /// Load configuration from a YAML file.
    ///
    /// An explicit path must exist. Without one, the default path is read if
    /// present and built-in defaults are used otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path(), false),
        };

        if !path.exists() {
            if required {
                return Err(KilnError::ConfigError(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            KilnError::ConfigError(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: KilnConfig = serde_yaml::from_str(&contents)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Apply `DOCKER_HOST` and `DOCKER_API_VERSION` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply environment overrides using the given lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("DOCKER_HOST").filter(|v| !v.is_empty()) {
            self.engine.host = host;
        }
        if let Some(version) = lookup("DOCKER_API_VERSION").filter(|v| !v.is_empty()) {
            self.engine.api_version = Some(version);
        }
    }

    /// The configured timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Engine connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine address: `unix:///path/to/socket` or `tcp://host:port`
    pub host: String,

    /// API version prefix, e.g. "1.41" (None = unversioned paths)
    #[serde(default)]
    pub api_version: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_ENGINE_HOST.to_string(),
            api_version: None,
        }
    }
}

/// Build request defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDefaults {
    /// Tags applied to the built image
    pub tags: Vec<String>,

    /// Remove intermediate containers after a successful build
    pub remove_intermediate: bool,

    /// How the response stream is consumed
    #[serde(default)]
    pub mode: LogMode,
}

impl Default for BuildDefaults {
    fn default() -> Self {
        Self {
            tags: vec![DEFAULT_IMAGE_TAG.to_string()],
            remove_intermediate: true,
            mode: LogMode::Structured,
        }
    }
}

/// Build response consumption mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogMode {
    /// Decode messages, accumulate the log and detect in-band errors.
    #[default]
    Structured,
    /// Copy the raw response to the output unchanged.
    Passthrough,
}

impl std::fmt::Display for LogMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Structured => write!(f, "structured"),
            Self::Passthrough => write!(f, "passthrough"),
        }
    }
}

impl std::str::FromStr for LogMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "structured" => Ok(Self::Structured),
            "passthrough" => Ok(Self::Passthrough),
            _ => Err(format!(
                "unknown log mode: '{}' (supported: structured, passthrough)",
                s
            )),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
