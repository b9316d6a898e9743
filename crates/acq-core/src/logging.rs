//! Tracing initialisation.
//!
//! Installs a `tracing-subscriber` registry with an [`EnvFilter`] and one fmt
//! layer. `RUST_LOG` takes precedence over the configured level.
//!
//! ```no_run
//! use acq_core::config::AcqConfig;
//! use acq_core::logging;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AcqConfig::load()?;
//! logging::init_tracing(&config.logging)?;
//! tracing::info!(component = "server", "started");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{AcqError, AcqResult};

/// Initialise the global subscriber.
///
/// Idempotent: if a global subscriber is already installed (another test, an
/// embedding application) this returns `Ok(())`.
pub fn init_tracing(config: &LoggingConfig) -> AcqResult<()> {
    let level = parse_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_names(config.with_thread_names)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_thread_names(config.with_thread_names)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_thread_names(config.with_thread_names)
            .boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(env_filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(AcqError::Config(format!("failed to initialise tracing: {e}"))),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_level(level: &str) -> AcqResult<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(AcqError::Config(format!(
            "invalid log level '{level}', expected one of: trace, debug, info, warn, error"
        ))),
    }
}
