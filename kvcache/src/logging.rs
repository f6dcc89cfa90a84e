//! Process-wide `tracing` subscriber setup.

use crate::error::{KvError, Result};
use tracing_subscriber::EnvFilter;

/// Map a configured log level to a filter directive.
pub fn level_directive(level: &str) -> Result<&'static str> {
    match level.to_ascii_lowercase().as_str() {
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warning" | "warn" => Ok("warn"),
        "error" => Ok("error"),
        other => Err(KvError::Config(format!("unknown log level {other:?}"))),
    }
}

/// Install a fmt subscriber filtered at `level`. `RUST_LOG` takes precedence
/// when set. Calling this more than once keeps the first subscriber.
pub fn init(level: &str) -> Result<()> {
    let directive = level_directive(level)?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}
