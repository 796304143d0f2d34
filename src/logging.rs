//! Tracing subscriber setup for binaries and tests.
//!
//! The library only emits `tracing` events; installing a subscriber is left to
//! the embedding application. [`init_tracing`] is what the bundled CLI uses:
//! compact lines on stderr, filtered by `GRAPH_DB_API_LOG` (falling back to
//! `RUST_LOG`, then to the given default level).

use tracing_subscriber::EnvFilter;

use crate::errors::GraphDbError;

pub const LOG_ENV: &str = "GRAPH_DB_API_LOG";

fn build_env_filter(default_level: &str) -> Result<EnvFilter, GraphDbError> {
    let directives = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level.to_string());
    EnvFilter::try_new(&directives).map_err(|e| {
        GraphDbError::configuration(format!("invalid tracing filter {directives:?}: {e}"))
    })
}

/// Installs a global fmt subscriber writing to stderr.
///
/// Calling this more than once is harmless; later calls keep the first subscriber.
pub fn init_tracing(default_level: &str) -> Result<(), GraphDbError> {
    let filter = build_env_filter(default_level)?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();
    Ok(())
}
