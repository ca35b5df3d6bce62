//! Remote → local reconciliation.
//!
//! One pass lists the remote prefix, walks the local tree, and applies the
//! difference: missing or changed objects are streamed down (temp file +
//! atomic rename), and — on mirror passes only — local files whose remote
//! counterpart disappeared are removed. The seed pass never deletes: a
//! fresh destination may legitimately contain files the operator put there.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use tether_blob_store::RemoteObject;

use crate::context::SharedContext;
use crate::error::{Result, SyncError};

/// Suffix for in-flight download staging files. Both the local walk and the
/// upload watcher ignore paths carrying it.
pub(crate) const TMP_SUFFIX: &str = ".tether.tmp";

/// Outcome counts for one reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    /// Objects streamed to disk
    pub downloaded: usize,
    /// Local files removed because their object is gone
    pub deleted: usize,
    /// Objects already current locally
    pub unchanged: usize,
    /// Per-object failures (logged, not fatal to the pass)
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LocalFile {
    pub(crate) size: u64,
    pub(crate) modified: Option<SystemTime>,
}

enum Decision {
    Skip,
    Download,
}

/// Run one reconciliation pass for a mount.
///
/// Passes on the same mount are serialized through the context's pass lock.
/// A listing failure aborts the whole pass; per-object failures are logged
/// and the pass continues.
pub async fn run_pass(ctx: &SharedContext, allow_deletes: bool) -> Result<PassSummary> {
    let _guard = ctx.pass_lock().lock().await;
    let mount_id = ctx.mount().id.clone();

    let listing = ctx
        .client()
        .list(&ctx.mount().bucket, &ctx.mount().prefix)
        .await?;
    let mut remote: HashMap<String, RemoteObject> = HashMap::new();
    for object in listing {
        if let Some(rel) = ctx.mount().relpath_of(&object.key) {
            remote.insert(rel.to_string(), object);
        }
    }

    let local = walk_local_tree(ctx).await?;

    let mut summary = PassSummary::default();
    let mut transfers: JoinSet<bool> = JoinSet::new();
    for (rel, object) in &remote {
        match decide(ctx, rel, object, local.get(rel)) {
            Decision::Skip => summary.unchanged += 1,
            Decision::Download => {
                let ctx = ctx.clone();
                let rel = rel.clone();
                let object = object.clone();
                transfers.spawn(async move {
                    match download_object(&ctx, &rel, &object).await {
                        Ok(()) => true,
                        Err(e) => {
                            log_object_failure(&ctx.mount().id, &rel, "download", &e);
                            false
                        }
                    }
                });
            }
        }
    }
    while let Some(joined) = transfers.join_next().await {
        match joined {
            Ok(true) => summary.downloaded += 1,
            Ok(false) => summary.failed += 1,
            Err(e) => {
                warn!(mount = %mount_id, error = %e, "download task aborted");
                summary.failed += 1;
            }
        }
    }

    if allow_deletes {
        for rel in local.keys() {
            // Only relpaths this process has synchronized are fair game;
            // operator strays and not-yet-uploaded local writes are not.
            if remote.contains_key(rel) || !ctx.etags().contains(rel) {
                continue;
            }
            match delete_local(ctx, rel).await {
                Ok(()) => summary.deleted += 1,
                Err(e) => {
                    log_object_failure(&mount_id, rel, "local delete", &e);
                    summary.failed += 1;
                }
            }
        }
    }

    debug!(
        mount = %mount_id,
        downloaded = summary.downloaded,
        deleted = summary.deleted,
        unchanged = summary.unchanged,
        failed = summary.failed,
        "reconciliation pass complete"
    );
    Ok(summary)
}

pub(crate) fn log_object_failure(mount: &str, rel: &str, action: &str, err: &SyncError) {
    match err {
        SyncError::Remote(blob) if blob.is_retryable() => {
            warn!(mount, rel, error = %err, "{action} failed, will retry next pass");
        }
        _ => error!(mount, rel, error = %err, "{action} failed"),
    }
}

/// Decide whether a remote object needs a transfer.
fn decide(
    ctx: &SharedContext,
    rel: &str,
    object: &RemoteObject,
    local: Option<&LocalFile>,
) -> Decision {
    let Some(local) = local else {
        if ctx.suppressions().consume(rel) {
            // Echo of a local delete: the listing is still showing the
            // object we just removed remotely.
            debug!(mount = %ctx.mount().id, rel, "suppressed re-download of deleted file");
            return Decision::Skip;
        }
        return Decision::Download;
    };

    if ctx.suppressions().contains(rel) && local.size == object.size {
        // Echo of a local write: the bytes are already here.
        ctx.suppressions().consume(rel);
        adopt_etag(ctx, rel, object);
        debug!(mount = %ctx.mount().id, rel, "suppressed re-download of local write");
        return Decision::Skip;
    }

    // On writeable mounts a local file newer than the listed object is a
    // pending upload, not stale data. Last-writer-wins says leave it alone.
    if ctx.mount().writeable {
        if let Some(modified) = local.modified {
            let local_time: DateTime<Utc> = modified.into();
            if local_time > object.last_modified {
                return Decision::Skip;
            }
        }
    }

    match (ctx.etags().get(rel), object.etag.as_deref()) {
        (Some(cached), Some(etag)) => {
            if cached == etag {
                Decision::Skip
            } else {
                Decision::Download
            }
        }
        _ => {
            if local.size == object.size {
                // Unknown provenance but identical size: adopt rather than
                // re-transfer. After a restart this is every file.
                adopt_etag(ctx, rel, object);
                Decision::Skip
            } else {
                Decision::Download
            }
        }
    }
}

fn adopt_etag(ctx: &SharedContext, rel: &str, object: &RemoteObject) {
    ctx.etags()
        .record(rel, object.etag.as_deref().unwrap_or_default());
}

/// Stream one object into place.
async fn download_object(ctx: &SharedContext, rel: &str, object: &RemoteObject) -> Result<()> {
    let _permit = ctx.limiter().acquire().await;

    let path = ctx.local_path(rel);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| SyncError::local_io(parent, e))?;
    }

    let tmp = staging_path(&path);
    if let Err(e) = stream_to_file(ctx, object, &tmp).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    // The rename is the only event the watcher sees for this download;
    // suppress it just before it happens.
    ctx.suppressions().insert(rel);
    if let Err(e) = tokio::fs::rename(&tmp, &path).await {
        ctx.suppressions().consume(rel);
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(SyncError::local_io(path, e));
    }

    adopt_etag(ctx, rel, object);
    debug!(mount = %ctx.mount().id, rel, size = object.size, "downloaded");
    Ok(())
}

async fn stream_to_file(ctx: &SharedContext, object: &RemoteObject, tmp: &Path) -> Result<()> {
    let outcome = ctx
        .client()
        .get(&ctx.mount().bucket, &object.key)
        .await?;

    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|e| SyncError::local_io(tmp, e))?;
    let mut stream = outcome.stream;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk)
            .await
            .map_err(|e| SyncError::local_io(tmp, e))?;
    }
    file.flush()
        .await
        .map_err(|e| SyncError::local_io(tmp, e))?;
    Ok(())
}

/// Remove a local file whose remote object is gone.
async fn delete_local(ctx: &SharedContext, rel: &str) -> Result<()> {
    let path = ctx.local_path(rel);
    ctx.suppressions().insert(rel);
    match tokio::fs::remove_file(&path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            ctx.suppressions().consume(rel);
        }
        Err(e) => {
            ctx.suppressions().consume(rel);
            return Err(SyncError::local_io(path, e));
        }
    }
    ctx.etags().forget(rel);
    remove_empty_parents(ctx.root(), &path);
    debug!(mount = %ctx.mount().id, rel, "deleted local file");
    Ok(())
}

/// Opportunistically remove now-empty parent directories, up to (but not
/// including) the mount root.
fn remove_empty_parents(root: &Path, path: &Path) {
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == root {
            break;
        }
        // Fails on the first non-empty (or already gone) parent.
        if std::fs::remove_dir(dir).is_err() {
            break;
        }
        current = dir.parent();
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// Walk the local tree, returning regular files keyed by relpath.
///
/// Directories are not tracked as entities; symlinks and staging files are
/// skipped entirely.
pub(crate) async fn walk_local_tree(ctx: &SharedContext) -> Result<HashMap<String, LocalFile>> {
    let root = ctx.root().to_path_buf();
    let entries = tokio::task::spawn_blocking(move || {
        let mut entries = Vec::new();
        if root.is_dir() {
            collect_files(&root, &mut entries)?;
        }
        Ok::<_, std::io::Error>(entries)
    })
    .await?
    .map_err(|e| SyncError::local_io(ctx.root(), e))?;

    let mut files = HashMap::new();
    for (path, file) in entries {
        if let Some(rel) = ctx.relpath_for(&path) {
            files.insert(rel, file);
        }
    }
    Ok(files)
}

pub(crate) fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, LocalFile)>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        // Entries can vanish between readdir and stat; skip them.
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();

        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            collect_files(&path, out)?;
        } else if file_type.is_file() {
            if path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(TMP_SUFFIX))
            {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            out.push((
                path,
                LocalFile {
                    size: metadata.len(),
                    modified: metadata.modified().ok(),
                },
            ));
        }
    }
    Ok(())
}
