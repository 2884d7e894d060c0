//! Tracing subscriber setup

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info";

fn env_filter(fallback: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback.unwrap_or(DEFAULT_FILTER)))
}

/// Install a human-readable fmt subscriber
///
/// `RUST_LOG` wins over `fallback`. Returns `false` if a global subscriber
/// was already installed, so repeated calls are harmless.
pub fn init_tracing(fallback: Option<&str>) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(fallback))
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Install a JSON fmt subscriber
pub fn init_json_tracing(fallback: Option<&str>) -> bool {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(env_filter(fallback))
        .try_init()
        .is_ok()
}
