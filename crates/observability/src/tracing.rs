//! Tracing/logging initialization.
//!
//! JSON lines on stdout. The filter comes from `RUST_LOG` when set, otherwise
//! from `LOG_LEVEL` (`INFO`, `debug`, ...), otherwise `info`.

use tracing_subscriber::EnvFilter;

const DEFAULT_LEVEL: &str = "info";

/// Initialize tracing/logging for the process.
pub fn init() {
    let filter = resolve_filter(
        std::env::var("RUST_LOG").ok().as_deref(),
        std::env::var("LOG_LEVEL").ok().as_deref(),
    );

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

/// Filter directive string from `RUST_LOG`, then `LOG_LEVEL`, then the default.
pub fn filter_directive(rust_log: Option<&str>, log_level: Option<&str>) -> String {
    fn non_empty(v: Option<&str>) -> Option<&str> {
        v.map(str::trim).filter(|v| !v.is_empty())
    }

    if let Some(directive) = non_empty(rust_log) {
        return directive.to_string();
    }
    match non_empty(log_level).map(str::to_ascii_lowercase).as_deref() {
        // Python-style level names seen in existing deployments.
        Some("warning") => "warn".to_string(),
        Some("critical") | Some("fatal") => "error".to_string(),
        Some(level) => level.to_string(),
        None => DEFAULT_LEVEL.to_string(),
    }
}

fn resolve_filter(rust_log: Option<&str>, log_level: Option<&str>) -> EnvFilter {
    let directive = filter_directive(rust_log, log_level);
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}
