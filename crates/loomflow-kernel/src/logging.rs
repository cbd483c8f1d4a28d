//! Structured logging setup.
//!
//! The engine only emits `tracing` events; installing a subscriber is left to
//! the embedding process. [`init_logging`] is the default used by binaries and
//! tests in this workspace.

use tracing_subscriber::EnvFilter;

/// Default directive applied when `RUST_LOG` is not set.
pub const DEFAULT_DIRECTIVE: &str = "loomflow=info";

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `default_directive`.
///
/// Calling it more than once is harmless: later calls leave the first
/// subscriber in place and return `false`.
pub fn init_logging(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Same as [`init_logging`] but emits one JSON object per event.
pub fn init_json_logging(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
}
