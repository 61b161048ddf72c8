//! Diagnostic tracing, kept apart from what the operator sees.
//!
//! The CLI talks to the operator through `==>` progress lines and the child's
//! echoed output. Tracing is for whoever debugs the agent itself: it goes to
//! stderr, is filtered by `RUST_LOG`, and is quiet (`warn`) by default.
//!
//! The per-attempt record under `<project>/.codeloop/attempts/` is written by
//! `io::attempt_log` regardless of any filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or unparsable.
const DEFAULT_DIRECTIVE: &str = "warn";

/// Install the global subscriber.
///
/// Lines carry no timestamp or target so they read cleanly between the
/// operator prompts. A second call is a no-op.
///
/// ```bash
/// RUST_LOG=codeloop=debug codeloop new --path demo "print hello world"
/// ```
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .compact();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}
