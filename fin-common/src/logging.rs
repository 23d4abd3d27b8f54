//! Logging utilities for the Fin alerts stack.
//!
//! Provides structured logging via `tracing` with a choice of JSON or
//! human-readable output.
//!
//! # Noise Filtering
//!
//! By default, noisy library modules (hyper, reqwest, rustls, lettre) are set
//! to `warn` level to reduce log clutter while keeping business logs at the
//! specified level.

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Default noisy modules that should be filtered to warn level.
///
/// These modules produce high-volume debug/trace logs that typically
/// don't provide useful business context (connection pool management,
/// TLS handshakes, SMTP chatter).
pub const NOISY_MODULES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "lettre",
];

/// Build the default EnvFilter with noise suppression.
///
/// Creates a filter that sets noisy library modules to `warn` while
/// keeping the base log level for business logic.
fn build_filter(log_level: &str) -> EnvFilter {
    // Try environment variable first (allows override)
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    let mut directives = String::from(log_level);

    for module in NOISY_MODULES {
        directives.push_str(&format!(",{}=warn", module));
    }

    EnvFilter::new(&directives)
}

/// Initialize logging with the given configuration.
///
/// # Arguments
///
/// * `log_level` - Base log level (trace, debug, info, warn, error)
/// * `log_format` - Output format: "json" for structured JSON, "pretty" for human-readable
///
/// Noisy modules are automatically set to `warn` level unless overridden via
/// the `RUST_LOG` environment variable.
pub fn init_logging(log_level: &str, log_format: &str) {
    let filter = build_filter(log_level);

    let subscriber = tracing_subscriber::registry().with(filter);

    if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        let _ = subscriber.with(fmt_layer).try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_includes_noise_suppression() {
        let filter = build_filter("debug");
        let rendered = filter.to_string();
        assert!(rendered.contains("debug"));
        assert!(rendered.contains("lettre=warn"));
        assert!(rendered.contains("reqwest=warn"));
    }

    #[test]
    fn test_init_logging_is_idempotent() {
        // Second init must not panic even though a subscriber is installed.
        init_logging("info", "pretty");
        init_logging("debug", "json");
    }
}
