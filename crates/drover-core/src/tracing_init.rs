//! Shared tracing/logging initialization.
//!
//! The daemon binary and the integration harnesses set up
//! `tracing_subscriber` the same way: an env-filter plus optional JSON output.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"drover_daemon=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
///
/// Logs always go to stderr; stdout is reserved for event output.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Build the default filter directive for a crate and a level.
///
/// ```
/// assert_eq!(
///     drover_core::tracing_init::default_filter("drover_daemon", "debug"),
///     "drover_daemon=debug,drover_core=debug"
/// );
/// ```
pub fn default_filter(crate_name: &str, level: &str) -> String {
    format!("{crate_name}={level},drover_core={level}")
}
