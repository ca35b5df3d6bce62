//! Process plumbing: logging, panic reporting, signal-driven shutdown.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Install the global tracing subscriber.
///
/// The returned guard flushes the non-blocking writer on drop; keep it
/// alive for the life of the process.
pub fn init_tracing(debug: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stdout());
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(fmt_layer).init();
    guard
}

/// Route panics through `tracing` so they land in the same stream as the
/// rest of the daemon's output.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));
        tracing::error!(
            panic = %info,
            location = location.as_deref().unwrap_or("unknown"),
            "daemon panicked"
        );
    }));
}

/// Translate SIGINT and SIGTERM into the synchronizer's cancellation
/// signal.
///
/// Both signals cancel immediately: draining — flushing pending debounce
/// windows, letting in-flight transfers finish, joining every mount task —
/// happens downstream of the watch channel, so there is no traffic to wind
/// down first and a SIGTERM grace delay would only postpone the flush.
///
/// The sender is returned so the caller can also shut down
/// programmatically; dropping it reads as a shutdown to every receiver, so
/// hold it for the life of the run.
pub fn spawn_signal_listener() -> std::io::Result<(watch::Sender<()>, watch::Receiver<()>)> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let (tx, rx) = watch::channel(());
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        let caught = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        tracing::info!(signal = caught, "shutting down");
        let _ = shutdown_tx.send(());
    });

    Ok((tx, rx))
}
