/*!
 * Tracing Setup
 * Structured logging for launches, stream closes and reaping
 */

use tracing::info;
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - POPEN_TRACE_JSON: Enable JSON output (default: false)
///
/// Records emitted through `log` by the pipe layer are forwarded as well.
/// Calling this more than once is harmless; only the first call installs a
/// subscriber.
pub fn init_tracing() {
    if try_init_tracing() {
        info!("Structured tracing initialized");
    }
}

/// Install the subscriber; false if one was already installed
pub fn try_init_tracing() -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if json_requested() {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
    };
    installed.is_ok()
}

fn json_requested() -> bool {
    std::env::var("POPEN_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false)
}
