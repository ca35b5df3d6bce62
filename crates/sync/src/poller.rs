//! Recurring downloader passes.
//!
//! After a mount's seed download the poller reruns the reconciliation at a
//! fixed interval, measured between pass completions. Mirror semantics
//! (deletion propagation) are enabled here; the seed pass ran without them.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::context::SharedContext;
use crate::downloader;
use crate::error::Result;

/// Budget and cadence for one mount's poller.
#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    /// Sleep between pass completions
    pub interval: Duration,
    /// Stop after this many recurring passes; `None` runs until cancellation
    pub stop_after: Option<u64>,
}

/// Poll the remote prefix until the pass budget or cancellation ends it.
///
/// Listing failures are logged and retried on the next tick; they never
/// kill the poller.
pub async fn run(ctx: SharedContext, config: PollerConfig) -> Result<()> {
    let mount_id = ctx.mount().id.clone();
    let mut shutdown = ctx.shutdown();
    let mut completed: u64 = 0;

    debug!(mount = %mount_id, interval = ?config.interval, stop_after = ?config.stop_after, "poller started");

    // Pass first, then sleep: the interval is measured between pass
    // completions, and a fresh poller must not sit idle before its first
    // pass.
    loop {
        match downloader::run_pass(&ctx, true).await {
            Ok(_summary) => {}
            Err(e) => {
                warn!(mount = %mount_id, error = %e, "recurring pass failed, will retry");
            }
        }
        completed += 1;

        if let Some(budget) = config.stop_after {
            if completed >= budget {
                info!(mount = %mount_id, passes = completed, "poller pass budget reached");
                break;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            _ = shutdown.changed() => {
                info!(mount = %mount_id, "poller cancelled");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Instant;

    use bytes::Bytes;
    use tokio::sync::watch;

    use tether_blob_store::{BlobClient, ObjectStoreClient};

    use crate::context::SyncContext;
    use crate::limiter::TransferLimiter;
    use crate::mount::decode_mounts;

    fn context(
        dir: &Path,
        client: Arc<ObjectStoreClient>,
        rx: watch::Receiver<()>,
    ) -> SharedContext {
        let mount = decode_mounts(r#"[{"id":"A","bucket":"b","prefix":"p/A"}]"#)
            .unwrap()
            .remove(0);
        SyncContext::new(
            mount,
            dir,
            client,
            TransferLimiter::new(2),
            Duration::from_secs(60),
            rx,
        )
    }

    #[tokio::test]
    async fn test_pass_budget_stops_the_poller() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ObjectStoreClient::memory());
        let (tx, rx) = watch::channel(());
        let ctx = context(dir.path(), client, rx);

        let start = Instant::now();
        run(
            ctx,
            PollerConfig {
                interval: Duration::from_millis(50),
                stop_after: Some(3),
            },
        )
        .await
        .unwrap();
        // Three passes bracket two inter-pass sleeps.
        assert!(start.elapsed() >= Duration::from_millis(100));
        drop(tx);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_poller() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ObjectStoreClient::memory());
        let (tx, rx) = watch::channel(());
        let ctx = context(dir.path(), client, rx);

        let handle = tokio::spawn(run(
            ctx,
            PollerConfig {
                interval: Duration::from_secs(3600),
                stop_after: None,
            },
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("poller must exit promptly on cancellation")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_recurring_pass_picks_up_new_objects() {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ObjectStoreClient::memory());
        let (tx, rx) = watch::channel(());
        let ctx = context(dir.path(), client.clone(), rx);

        client
            .put("b", "p/A/late.txt", Bytes::from("late"), None)
            .await
            .unwrap();

        run(
            ctx.clone(),
            PollerConfig {
                interval: Duration::from_millis(20),
                stop_after: Some(1),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(ctx.local_path("late.txt")).unwrap(),
            "late"
        );
        drop(tx);
    }
}
