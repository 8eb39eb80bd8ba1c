//! Structured logging setup.
//!
//! The library only emits `tracing` events; binaries and tests that want to
//! see them call [`init_logging`] once.

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

/// Install a global fmt subscriber described by `config`.
///
/// `RUST_LOG` takes precedence over the configured level when set.
///
/// # Errors
/// Returns `ProtocolError::ConfigError` if a global subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str().to_lowercase()));

    let builder = fmt()
        .with_env_filter(filter)
        .with_target(config.with_target);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    info!(app = %config.app_name, level = %config.log_level, "Logging initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = LoggingConfig::default();
        // Another test may have installed a subscriber first; either way the
        // second call in this test must be rejected.
        let _ = init_logging(&config);
        assert!(init_logging(&config).is_err());
    }
}
