//! Tracing subscriber bootstrap for Stratus binaries
//!
//! `RUST_LOG` takes precedence over the level passed in, so operators can
//! raise verbosity for a single module without touching configuration.

use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::error::{Result, StratusError};

/// Install a console `fmt` layer filtered by `RUST_LOG` or `level`.
///
/// Fails if a global subscriber has already been installed.
pub fn init_logging(level: &str, ansi: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(ansi)
        .with_filter(filter);

    Registry::default()
        .with(console_layer)
        .try_init()
        .map_err(|e| StratusError::Internal(format!("Failed to initialize logging: {}", e)))?;

    tracing::debug!(level, "Logging initialized");
    Ok(())
}
