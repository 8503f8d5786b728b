//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration; tuned via the
/// standard `RUST_LOG` environment variable, with errors always
/// reported. Diagnostics go to stderr, keeping stdout for
/// operator-facing output.
pub fn initialize_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::ERROR.into())
        .from_env_lossy();
    let format = tracing_subscriber::fmt::layer()
        .compact()
        .without_time()
        .with_writer(std::io::stderr);
    tracing_subscriber::registry().with(format).with(filter).init();
}
