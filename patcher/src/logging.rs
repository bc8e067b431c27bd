//! Tracing setup for the patcher binary.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: operational log lines on stderr, filtered by
//!   `RUST_LOG`. This is what an operator watches during a run.
//!
//! - **Session artifacts (`io/session_log`)**: `session.json`, crash logs and
//!   agent logs under the work directory. Always written, unaffected by
//!   `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Defaults to `info` for the patcher crates and `warn`
/// elsewhere. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=patcher=debug,submit_watch=debug patcher run
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,patcher=info,submit_watch=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
