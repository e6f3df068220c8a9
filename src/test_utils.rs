//! Test logging and assertion helpers.
//!
//! Shared by the unit tests and by `tests/`. Logging is initialised once per
//! process; `RUST_LOG` overrides the default `peerauth=debug` filter.

use std::sync::Once;

static INIT: Once = Once::new();

/// Installs a compact `tracing` subscriber that writes through the test
/// harness's captured output.
pub fn init_test_logging() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("peerauth=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .compact()
            .try_init();
    });
}

/// Marks the start of a named test.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        ::tracing::info!(test = %$name, "=== {} ===", $name);
    };
}

/// Marks a section inside a test.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        ::tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Asserts `cond`, logging expected and actual values either way.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {{
        let ok = $cond;
        if ok {
            ::tracing::debug!(expected = ?$expected, actual = ?$actual, "ok: {}", $msg);
        } else {
            ::tracing::error!(expected = ?$expected, actual = ?$actual, "FAILED: {}", $msg);
        }
        assert!(
            ok,
            "{}: expected {:?}, got {:?}",
            $msg, $expected, $actual
        );
    }};
}

/// Marks the successful end of a named test.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        ::tracing::info!(test = %$name, "=== {} complete ===", $name);
    };
}
