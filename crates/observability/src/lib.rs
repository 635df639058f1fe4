//! Process-wide tracing setup shared by the beat and worker processes.

/// Initialize process-wide logging.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init();
}

/// Filter resolution and subscriber installation.
pub mod tracing;
