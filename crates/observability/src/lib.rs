//! Process-wide tracing setup shared by every binary.

/// Initialize tracing with the default filter (`RUST_LOG`, else `info`) and JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize tracing from explicit settings.
///
/// `filter` is an `EnvFilter` directive; an unparsable directive falls back to `info`.
pub fn init_with(filter: &str, json: bool) {
    tracing::init_with(filter, json);
}

/// Tracing configuration (filters, formatting).
pub mod tracing;
