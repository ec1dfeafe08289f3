//! Logging initialization

use crate::config::LogLevel;
use crate::error::{EngineError, Result};
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: Once = Once::new();

/// Initialize the tracing subscriber once for the process.
///
/// Safe to call repeatedly; only the first call configures the subscriber.
/// `RUST_LOG` still takes precedence over the requested level.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());

    INIT.call_once(|| {
        result = init_logging_inner(level);
    });

    result
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    let tracing_level = match level {
        LogLevel::Silent => return Ok(()),
        LogLevel::Error => Level::ERROR,
        LogLevel::Warning => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(
            format!("mirrortap_engine={}", tracing_level)
                .parse()
                .map_err(|e| EngineError::Config(format!("invalid log directive: {}", e)))?,
        )
        .add_directive(
            format!("mirrortap_capture={}", tracing_level)
                .parse()
                .map_err(|e| EngineError::Config(format!("invalid log directive: {}", e)))?,
        )
        .add_directive(
            "tokio=warn"
                .parse()
                .map_err(|e| EngineError::Config(format!("invalid log directive: {}", e)))?,
        );

    // try_init: the launcher may already have a subscriber installed
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();

    tracing::info!("logging initialized at level: {:?}", level);
    Ok(())
}
