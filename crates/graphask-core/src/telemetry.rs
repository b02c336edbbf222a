//! Tracing subscriber setup
//!
//! Embedding applications call [`init`] once at startup. `RUST_LOG`
//! overrides the default directive.

use tracing_subscriber::EnvFilter;

/// Default log directive for the crate
pub const DEFAULT_DIRECTIVE: &str = "graphask=info";

/// Install a fmt subscriber with an env filter
///
/// Returns `false` if a global subscriber was already installed.
pub fn init(default_directive: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
