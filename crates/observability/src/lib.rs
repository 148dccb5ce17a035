//! Shared tracing setup for the wager binaries.

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::{DEFAULT_DIRECTIVE, init_with_default};

/// Initialize process-wide tracing with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init();
}
