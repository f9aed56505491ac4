//! Tracing subscriber setup.

use tracing::Subscriber;
use tracing_subscriber::EnvFilter;

/// Builds a log subscriber with the given default level.
///
/// The `RUST_LOG` environment variable takes precedence over the configured
/// level when set.
pub fn log_subscriber(level: &str) -> impl Subscriber + Send + Sync {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).finish()
}
