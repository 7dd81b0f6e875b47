//! Diagnostic tracing for the orchestrator.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. It is separate from
//! the run artifacts under `project_root/runs/`, which are always written.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=notes_agent=debug notes-agent run --project ./projects/algo-101
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
