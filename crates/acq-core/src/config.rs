//! Layered configuration using Figment.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults,
//! 2. a TOML file (`config/lab_acq.toml` unless another path is given),
//! 3. environment variables prefixed `LAB_ACQ_`, nested with `__`
//!    (e.g. `LAB_ACQ_SERVER__RING_BUFFER_CAPACITY=8`).
//!
//! Driver crates read their own sections from [`AcqConfig::figment`].

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AcqError, AcqResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/lab_acq.toml";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "LAB_ACQ_";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcqConfig {
    /// Session server options.
    pub server: ServerConfig,
    /// Pipe transport options.
    pub pipes: PipeConfig,
    /// Logging options.
    pub logging: LoggingConfig,
}

/// Session server options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Coordination name; `None` uses the driver's default.
    pub coordination_name: Option<String>,
    /// Slots in the hardware-facing ring buffer.
    pub ring_buffer_capacity: usize,
    /// Accept a new client after the previous one disconnects.
    pub restart_on_disconnect: bool,
    /// Consecutive failed handshakes tolerated before the server gives up.
    pub max_handshake_failures: u32,
    /// Poll interval for accepts and idle control reads, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            coordination_name: None,
            ring_buffer_capacity: 4,
            restart_on_disconnect: true,
            max_handshake_failures: 5,
            poll_interval_ms: 50,
        }
    }
}

/// Pipe transport options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Directory holding pipe endpoints; the system temp dir when unset.
    pub directory: Option<PathBuf>,
    /// How long a client waits for a pipe to accept, in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            directory: None,
            connect_timeout_ms: 1000,
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured output for development.
    #[default]
    Pretty,
    /// Single-line output without colours.
    Compact,
    /// JSON lines for log aggregation.
    Json,
}

/// Logging options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set.
    pub level: String,
    /// Line format.
    pub format: LogFormat,
    /// Include thread names; useful with one thread per pipeline role.
    pub with_thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            with_thread_names: true,
        }
    }
}

impl AcqConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AcqResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AcqResult<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The layered provider, for crates that extract their own sections.
    #[must_use]
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(AcqConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> AcqResult<()> {
        if self.server.ring_buffer_capacity < 2 {
            return Err(AcqError::Config(format!(
                "server.ring_buffer_capacity must be at least 2, got {}",
                self.server.ring_buffer_capacity
            )));
        }
        if self.server.poll_interval_ms == 0 {
            return Err(AcqError::Config(
                "server.poll_interval_ms must be positive".to_string(),
            ));
        }
        if let Some(name) = &self.server.coordination_name {
            if name.trim().is_empty() {
                return Err(AcqError::Config(
                    "server.coordination_name must not be blank".to_string(),
                ));
            }
        }
        crate::logging::parse_level(&self.logging.level)?;
        Ok(())
    }
}
