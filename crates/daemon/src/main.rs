mod args;
mod process;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use owo_colors::OwoColorize;

use tether_blob_store::ObjectStoreClient;

use args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = process::init_tracing(args.debug);
    process::install_panic_hook();

    // Keep the sender alive: dropping it reads as a shutdown.
    let (_shutdown_tx, shutdown_rx) = match process::spawn_signal_listener() {
        Ok(channel) => channel,
        Err(e) => {
            eprintln!("{} failed to install signal handlers: {e}", "error:".red().bold());
            return ExitCode::from(3);
        }
    };

    let client = Arc::new(ObjectStoreClient::new(args.store_config()));
    let result = tether_sync::run(client, &args.mounts_json, args.sync_options(), shutdown_rx).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            if e.is_fatal() {
                // Bad invocation: mounts JSON or parameters.
                ExitCode::from(2)
            } else {
                // Startup failure: destination base or the remote store.
                ExitCode::from(3)
            }
        }
    }
}
