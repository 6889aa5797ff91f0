//! Diagnostic tracing for the engine and its collaborators.
//!
//! Diagnostics and product output never share a channel: tracing goes to stderr
//! and is tuned with `RUST_LOG`, while the event stream (rendered by the
//! presenter) and the progress log (read back by the agent) are unaffected by
//! any of this.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "warn,storyloop=info" } else { "warn" }
}

/// Install the global subscriber: compact format on stderr.
///
/// `RUST_LOG` wins over `verbose` when set:
/// ```bash
/// RUST_LOG=storyloop::io::plan_store=debug storyloop run
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
