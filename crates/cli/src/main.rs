//! The main entrypoint for the ferrite CLI.

use anyhow::Result;

async fn run() -> Result<()> {
    ferrite_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    ferrite_lib::cli::run_from_iter(std::env::args_os()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    // This code just captures any errors.
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
