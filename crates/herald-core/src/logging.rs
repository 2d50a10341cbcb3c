//! Logging setup (`tracing-subscriber`).

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::prelude::*;

/// Environment variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "HERALD_LOG";

const DEFAULT_FILTER: &str = "info";

/// Resolve the filter directive: `HERALD_LOG`, then `RUST_LOG`, then
/// `fallback` (usually `log_level` from the config file), then `info`.
fn filter_directive(fallback: Option<&str>) -> String {
    [LOG_ENV, "RUST_LOG"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
        .or_else(|| fallback.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_FILTER.to_string())
}

fn build_filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|e| {
        eprintln!("Invalid log filter '{directive}' ({e}), defaulting to {DEFAULT_FILTER}");
        EnvFilter::new(DEFAULT_FILTER)
    })
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(fallback: Option<&str>) {
    let filter = build_filter(&filter_directive(fallback));

    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .with_target(true)
                .compact()
                .with_timer(ChronoUtc::rfc_3339())
                .with_filter(filter),
        )
        .try_init();
}
