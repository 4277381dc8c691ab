//! Structured logging setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset.
pub fn default_directives(debug: bool) -> &'static str {
    if debug {
        "mcp_gateway=debug,tower_http=debug"
    } else {
        "mcp_gateway=info,tower_http=info"
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays free.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug)));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}
