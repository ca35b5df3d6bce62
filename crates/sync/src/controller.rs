//! Lifecycle controller.
//!
//! Wires the blob client, limiter and per-mount contexts together: every
//! mount gets a seed download, then a recurring poller when polling is
//! enabled and an upload watcher when the mount is writeable. The
//! controller waits for all of it, returns the first error and logs any
//! later ones.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tether_blob_store::BlobClient;

use crate::context::{SharedContext, SyncContext};
use crate::downloader;
use crate::error::{Result, SyncError};
use crate::limiter::TransferLimiter;
use crate::mount::decode_mounts;
use crate::poller::{self, PollerConfig};
use crate::uploader::{self, UploaderConfig, DEFAULT_DEBOUNCE};

/// Coarse run phase, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Starting,
    Downloading,
    Syncing,
    Draining,
    Done,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Starting => "starting",
            ControllerState::Downloading => "downloading",
            ControllerState::Syncing => "syncing",
            ControllerState::Draining => "draining",
            ControllerState::Done => "done",
        }
    }
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Invocation parameters for one synchronizer run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Keep polling the store after the seed download
    pub recurring_downloads: bool,
    /// Stop pollers after this many recurring passes; ≤ 0 means no limit
    pub stop_recurring_downloads_after: i64,
    /// Seconds between pass completions; must be ≥ 1
    pub download_interval: u64,
    /// Stop upload watchers after this many seconds; ≤ 0 means no limit
    pub stop_upload_watchers_after: i64,
    /// Cap on in-flight object transfers across all mounts; must be ≥ 1
    pub concurrency: usize,
    /// Local root under which every mount materializes
    pub destination_base: PathBuf,
    /// On writeable mounts, upload pre-existing local files the store does
    /// not have at startup
    pub reconcile_uploads_on_start: bool,
}

impl SyncOptions {
    /// Options with the stock cadence: one-shot download, interval of 60s
    /// if polling is turned on, no budgets, four concurrent transfers.
    pub fn new(destination_base: impl Into<PathBuf>) -> Self {
        Self {
            recurring_downloads: false,
            stop_recurring_downloads_after: -1,
            download_interval: 60,
            stop_upload_watchers_after: -1,
            concurrency: 4,
            destination_base: destination_base.into(),
            reconcile_uploads_on_start: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency < 1 {
            return Err(SyncError::InvalidOptions(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.download_interval < 1 {
            return Err(SyncError::InvalidOptions(
                "download interval must be at least 1 second".to_string(),
            ));
        }
        Ok(())
    }

    fn poller_budget(&self) -> Option<u64> {
        (self.stop_recurring_downloads_after > 0)
            .then(|| self.stop_recurring_downloads_after as u64)
    }

    fn watcher_budget(&self) -> Option<Duration> {
        (self.stop_upload_watchers_after > 0)
            .then(|| Duration::from_secs(self.stop_upload_watchers_after as u64))
    }

    /// Suppression entries must outlive at least one poll interval so the
    /// poller sees them; two intervals leaves slack for a slow pass.
    fn suppression_ttl(&self) -> Duration {
        Duration::from_secs((self.download_interval * 2).max(5))
    }
}

/// Materialize every mount and keep it in sync until budgets or
/// cancellation end the run.
///
/// Decoding failures abort before any filesystem or store I/O. Afterwards,
/// per-object failures stay local to their pass or event; only the first
/// mount-fatal error is returned, later ones are logged.
pub async fn run(
    client: Arc<dyn BlobClient>,
    mounts_json: &str,
    options: SyncOptions,
    shutdown: watch::Receiver<()>,
) -> Result<()> {
    info!(state = %ControllerState::Starting, "synchronizer starting");

    options.validate()?;
    let mounts = decode_mounts(mounts_json)?;
    if mounts.is_empty() {
        info!(state = %ControllerState::Done, "no mounts configured, nothing to do");
        return Ok(());
    }

    std::fs::create_dir_all(&options.destination_base)
        .map_err(|e| SyncError::local_io(&options.destination_base, e))?;
    for mount in &mounts {
        let root = mount.local_root(&options.destination_base);
        std::fs::create_dir_all(&root).map_err(|e| SyncError::local_io(root, e))?;
    }

    let limiter = TransferLimiter::new(options.concurrency);
    let seeds_remaining = Arc::new(AtomicUsize::new(mounts.len()));

    info!(
        state = %ControllerState::Downloading,
        mounts = mounts.len(),
        concurrency = options.concurrency,
        recurring = options.recurring_downloads,
        "seeding mounts"
    );

    let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
    for mount in mounts {
        let writeable = mount.writeable;
        let ctx = SyncContext::new(
            mount,
            &options.destination_base,
            client.clone(),
            limiter.clone(),
            options.suppression_ttl(),
            shutdown.clone(),
        );

        let poller_config = options.recurring_downloads.then(|| PollerConfig {
            interval: Duration::from_secs(options.download_interval),
            stop_after: options.poller_budget(),
        });
        // Writeable mounts watch even without recurring downloads: local
        // changes still flow up, the store just never flows back down.
        let uploader_config = writeable.then(|| UploaderConfig {
            debounce: DEFAULT_DEBOUNCE,
            stop_after: options.watcher_budget(),
        });
        let reconcile = options.reconcile_uploads_on_start && writeable;
        let seeds = seeds_remaining.clone();

        tasks.spawn(async move {
            let id = ctx.mount().id.clone();
            let result = run_mount(ctx, poller_config, uploader_config, reconcile, seeds).await;
            (id, result)
        });
    }

    let mut draining = false;
    let mut first_error: Option<SyncError> = None;
    while let Some(joined) = tasks.join_next().await {
        if !draining {
            info!(state = %ControllerState::Draining, "mount tasks winding down");
            draining = true;
        }
        match joined {
            Ok((id, Ok(()))) => debug!(mount = %id, "mount task complete"),
            Ok((id, Err(e))) => {
                error!(mount = %id, error = %e, "mount task failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
            Err(e) => {
                error!(error = %e, "mount task aborted");
                if first_error.is_none() {
                    first_error = Some(SyncError::Task(e));
                }
            }
        }
    }

    info!(state = %ControllerState::Done, "synchronizer finished");
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Everything one mount does, in order: seed download, optional startup
/// upload reconciliation, then poller and watcher side by side.
async fn run_mount(
    ctx: SharedContext,
    poller_config: Option<PollerConfig>,
    uploader_config: Option<UploaderConfig>,
    reconcile: bool,
    seeds_remaining: Arc<AtomicUsize>,
) -> Result<()> {
    downloader::run_pass(&ctx, false).await?;
    // No watcher was registered yet, so nothing will consume what the seed
    // pass suppressed; stale entries would swallow the first real edits.
    ctx.suppressions().clear();
    if seeds_remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
        info!(state = %ControllerState::Syncing, "all mounts seeded");
    }

    if reconcile {
        // Best effort; a failed startup upload is retried by the next
        // local event touching the file, not by failing the mount.
        if let Err(e) = uploader::reconcile_existing(&ctx).await {
            warn!(mount = %ctx.mount().id, error = %e, "startup upload reconciliation failed");
        }
    }

    let poller_fut = async {
        match poller_config {
            Some(config) => poller::run(ctx.clone(), config).await,
            None => Ok(()),
        }
    };
    let uploader_fut = async {
        match uploader_config {
            Some(config) => uploader::run(ctx.clone(), config).await,
            None => Ok(()),
        }
    };

    match tokio::join!(poller_fut, uploader_fut) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(first), Err(second)) => {
            warn!(mount = %ctx.mount().id, error = %second, "watcher also failed");
            Err(first)
        }
    }
}
