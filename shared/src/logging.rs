//! Shared logging utilities for consistent tracing across the harness

use chrono::{DateTime, Utc};

/// Build the filter directive shared by every harness crate
fn filter_directive(level: &str) -> String {
    format!("harness={level},shared={level},tester={level}")
}

/// Initialize tracing subscriber with an optional log level (defaults to `info`)
pub fn init_tracing(log_level: Option<&str>) {
    use tracing_subscriber::{EnvFilter, fmt};

    let level = log_level.unwrap_or("info");

    fmt()
        .with_env_filter(EnvFilter::new(filter_directive(level)))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Initialize tracing for test binaries
///
/// Safe to call from every test; only the first call installs the subscriber.
/// Honors `RUST_LOG` when set.
pub fn init_test_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive("debug")));

    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(false)
        .try_init();
}

/// Get formatted timestamp for consistent logging
pub fn format_timestamp() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.format("%H:%M:%S%.3f").to_string()
}

/// Macro for fixture-aware debug logging
#[macro_export]
macro_rules! fixture_debug {
    ($fixture:expr, $($arg:tt)*) => {
        tracing::debug!(
            fixture = %$fixture,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for fixture-aware info logging
#[macro_export]
macro_rules! fixture_info {
    ($fixture:expr, $($arg:tt)*) => {
        tracing::info!(
            fixture = %$fixture,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for fixture-aware warning logging
#[macro_export]
macro_rules! fixture_warn {
    ($fixture:expr, $($arg:tt)*) => {
        tracing::warn!(
            fixture = %$fixture,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}

/// Macro for fixture-aware error logging
#[macro_export]
macro_rules! fixture_error {
    ($fixture:expr, $($arg:tt)*) => {
        tracing::error!(
            fixture = %$fixture,
            timestamp = $crate::logging::format_timestamp(),
            $($arg)*
        );
    };
}
