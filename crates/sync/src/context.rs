//! Per-mount sync context.
//!
//! Built by the controller before any worker starts; shared by that mount's
//! downloader, poller and watcher; dropped once all of them have observed
//! cancellation and exited.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use tether_blob_store::BlobClient;

use crate::limiter::TransferLimiter;
use crate::mount::Mount;
use crate::suppress::SuppressionSet;

/// Last-synchronized etags, keyed by relpath.
///
/// Doubles as the record of which relpaths this process has synchronized:
/// mirror passes only delete local files that are present here, so a file
/// the operator dropped in (or one a local writer just created) is never
/// mistaken for a remote deletion.
#[derive(Debug, Default)]
pub struct EtagCache {
    inner: Mutex<HashMap<String, String>>,
}

impl EtagCache {
    pub fn get(&self, relpath: &str) -> Option<String> {
        self.inner.lock().get(relpath).cloned()
    }

    pub fn record(&self, relpath: &str, etag: &str) {
        self.inner.lock().insert(relpath.to_string(), etag.to_string());
    }

    pub fn forget(&self, relpath: &str) {
        self.inner.lock().remove(relpath);
    }

    /// Whether this relpath has ever been synchronized by this process.
    pub fn contains(&self, relpath: &str) -> bool {
        self.inner.lock().contains_key(relpath)
    }
}

/// Shared state for one mount's workers.
pub struct SyncContext {
    mount: Mount,
    root: PathBuf,
    client: Arc<dyn BlobClient>,
    limiter: Arc<TransferLimiter>,
    suppressions: SuppressionSet,
    etags: EtagCache,
    /// Serializes reconciliation passes; a pass never overlaps another pass
    /// on the same mount.
    pass_lock: tokio::sync::Mutex<()>,
    shutdown: watch::Receiver<()>,
}

/// Handle shared between a mount's tasks.
pub type SharedContext = Arc<SyncContext>;

impl SyncContext {
    pub fn new(
        mount: Mount,
        destination_base: &Path,
        client: Arc<dyn BlobClient>,
        limiter: Arc<TransferLimiter>,
        suppression_ttl: Duration,
        shutdown: watch::Receiver<()>,
    ) -> SharedContext {
        let root = mount.local_root(destination_base);
        Arc::new(Self {
            mount,
            root,
            client,
            limiter,
            suppressions: SuppressionSet::new(suppression_ttl),
            etags: EtagCache::default(),
            pass_lock: tokio::sync::Mutex::new(()),
            shutdown,
        })
    }

    pub fn mount(&self) -> &Mount {
        &self.mount
    }

    /// Local root of this mount (`<destination_base>/<id>`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn client(&self) -> &Arc<dyn BlobClient> {
        &self.client
    }

    pub fn limiter(&self) -> &Arc<TransferLimiter> {
        &self.limiter
    }

    pub fn suppressions(&self) -> &SuppressionSet {
        &self.suppressions
    }

    pub fn etags(&self) -> &EtagCache {
        &self.etags
    }

    pub(crate) fn pass_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.pass_lock
    }

    /// A fresh receiver on the global cancellation signal.
    pub fn shutdown(&self) -> watch::Receiver<()> {
        self.shutdown.clone()
    }

    /// Absolute local path for a relpath.
    pub fn local_path(&self, relpath: &str) -> PathBuf {
        let mut path = self.root.clone();
        for part in relpath.split('/') {
            path.push(part);
        }
        path
    }

    /// Relpath for an absolute local path inside this mount, in remote
    /// (`/`-separated) form. `None` for paths outside the root or with
    /// non-UTF-8 components.
    pub fn relpath_for(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let mut parts = Vec::new();
        for part in rel.components() {
            parts.push(part.as_os_str().to_str()?);
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }
}
