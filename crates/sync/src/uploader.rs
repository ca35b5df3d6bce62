//! Local → remote propagation for writeable mounts.
//!
//! A recursive filesystem watch feeds raw notifier events into a per-relpath
//! debounce map; when a window closes the coalesced change becomes at most
//! one store mutation. Mutations for one relpath are chained so a late write
//! can never land after a subsequent delete; distinct relpaths proceed
//! independently, each gated by the shared transfer limiter.
//!
//! The watcher only starts after the mount's seed download, so the initial
//! materialization is not observed as a storm of local creates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::context::SharedContext;
use crate::downloader::{self, TMP_SUFFIX};
use crate::error::{Result, SyncError};

/// Default coalescing window for filesystem events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Cadence and budget for one mount's upload watcher.
#[derive(Debug, Clone, Copy)]
pub struct UploaderConfig {
    /// Events for one relpath within this window coalesce into one action
    pub debounce: Duration,
    /// Stop after this long; `None` runs until cancellation
    pub stop_after: Option<Duration>,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            stop_after: None,
        }
    }
}

/// The coalesced action for one relpath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Change {
    /// Put the file's current contents
    Upsert,
    /// Delete the object
    Remove,
}

/// Counts from a startup upload reconciliation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReconcileSummary {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Watch a writeable mount and push local changes to the store.
///
/// Runs until cancellation or until `stop_after` elapses. If the notifier
/// drops its side of the channel the watch is reinitialized and a full
/// mirror pass rediscovers whatever was missed.
pub async fn run(ctx: SharedContext, config: UploaderConfig) -> Result<()> {
    let mount_id = ctx.mount().id.clone();
    let mut shutdown = ctx.shutdown();
    let deadline = config.stop_after.map(|d| Instant::now() + d);

    let (raw_tx, mut raw_rx) = flume::unbounded();
    let mut watcher = start_watch(&ctx, raw_tx)?;

    // relpath → (coalesced change, window close)
    let mut pending: HashMap<String, (Change, Instant)> = HashMap::new();
    // relpath → tail of its serialized mutation chain
    let mut chains: HashMap<String, JoinHandle<()>> = HashMap::new();

    info!(mount = %mount_id, debounce = ?config.debounce, "upload watcher started");

    loop {
        let next_fire = pending.values().map(|(_, at)| *at).min();

        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                info!(mount = %mount_id, "upload watcher cancelled");
                break;
            }

            () = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                info!(mount = %mount_id, "upload watcher budget elapsed");
                break;
            }

            () = async {
                match next_fire {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            } => {
                fire_ready_windows(&ctx, &mut pending, &mut chains, config.debounce);
            }

            incoming = raw_rx.recv_async() => {
                match incoming {
                    Ok(Ok(event)) => handle_event(&ctx, &event, &mut pending, config.debounce),
                    Ok(Err(e)) => {
                        warn!(mount = %mount_id, error = %e, "filesystem notifier error");
                    }
                    Err(_) => {
                        // The notifier dropped its sender: the watch is lost.
                        warn!(mount = %mount_id, "filesystem watch lost, reinitializing");
                        let (tx, rx) = flume::unbounded();
                        watcher = start_watch(&ctx, tx)?;
                        raw_rx = rx;
                        if let Err(e) = downloader::run_pass(&ctx, true).await {
                            warn!(mount = %mount_id, error = %e, "drift-recovery pass failed");
                        }
                    }
                }
            }
        }
    }

    // Drain: close every pending window, then wait for in-flight mutations.
    let drained: Vec<(String, (Change, Instant))> = pending.drain().collect();
    for (rel, (change, _)) in drained {
        dispatch(&ctx, &mut chains, rel, change);
    }
    for (_, handle) in chains.drain() {
        let _ = handle.await;
    }
    drop(watcher);
    info!(mount = %mount_id, "upload watcher stopped");
    Ok(())
}

/// Upload local files the store does not have yet (or differs on by size).
///
/// Used at startup for writeable mounts when the operator opts in; the
/// `head` comparison keeps a restart from re-uploading an unchanged tree.
pub async fn reconcile_existing(ctx: &SharedContext) -> Result<ReconcileSummary> {
    let files = downloader::walk_local_tree(ctx).await?;
    let mut summary = ReconcileSummary::default();

    for (rel, file) in files {
        let key = ctx.mount().key_for(&rel);
        match ctx.client().head(&ctx.mount().bucket, &key).await {
            Ok(Some(object)) if object.size == file.size => summary.skipped += 1,
            Ok(_) => match upload(ctx, &rel).await {
                Ok(()) => summary.uploaded += 1,
                Err(e) => {
                    warn!(mount = %ctx.mount().id, rel = %rel, error = %e, "startup upload failed");
                    summary.failed += 1;
                }
            },
            Err(e) => {
                warn!(mount = %ctx.mount().id, rel = %rel, error = %e, "startup head failed");
                summary.failed += 1;
            }
        }
    }

    info!(
        mount = %ctx.mount().id,
        uploaded = summary.uploaded,
        skipped = summary.skipped,
        failed = summary.failed,
        "startup upload reconciliation complete"
    );
    Ok(summary)
}

fn start_watch(
    ctx: &SharedContext,
    tx: flume::Sender<notify::Result<Event>>,
) -> Result<RecommendedWatcher> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        notify::Config::default(),
    )?;
    watcher.watch(ctx.root(), RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Fold a raw notifier event into the pending map.
fn handle_event(
    ctx: &SharedContext,
    event: &Event,
    pending: &mut HashMap<String, (Change, Instant)>,
    debounce: Duration,
) {
    for (path, change) in classify(event) {
        let Some(rel) = ctx.relpath_for(&path) else {
            continue;
        };
        if ctx.suppressions().consume(&rel) {
            debug!(mount = %ctx.mount().id, rel = %rel, "ignoring self-inflicted event");
            continue;
        }
        // Last event within the window wins.
        pending.insert(rel, (change, Instant::now() + debounce));
    }
}

/// Close every window whose deadline passed and dispatch its action.
fn fire_ready_windows(
    ctx: &SharedContext,
    pending: &mut HashMap<String, (Change, Instant)>,
    chains: &mut HashMap<String, JoinHandle<()>>,
    debounce: Duration,
) {
    let now = Instant::now();
    let ready: Vec<String> = pending
        .iter()
        .filter(|(_, (_, at))| *at <= now)
        .map(|(rel, _)| rel.clone())
        .collect();

    for rel in ready {
        let Some((mut change, _)) = pending.remove(&rel) else {
            continue;
        };

        if change == Change::Upsert {
            match std::fs::metadata(ctx.local_path(&rel)) {
                Ok(metadata) => {
                    // Still being written: defer another window rather than
                    // shipping a torn file.
                    let busy = metadata
                        .modified()
                        .ok()
                        .and_then(|m| m.elapsed().ok())
                        .is_some_and(|elapsed| elapsed < debounce);
                    if busy {
                        pending.insert(rel, (Change::Upsert, now + debounce));
                        continue;
                    }
                }
                // Created and removed within one window.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => change = Change::Remove,
                Err(_) => {}
            }
        }

        dispatch(ctx, chains, rel, change);
    }

    chains.retain(|_, handle| !handle.is_finished());
}

/// Append one mutation to a relpath's serialized chain.
fn dispatch(
    ctx: &SharedContext,
    chains: &mut HashMap<String, JoinHandle<()>>,
    rel: String,
    change: Change,
) {
    let prev = chains.remove(&rel);
    let ctx = ctx.clone();
    let rel_for_task = rel.clone();
    let handle = tokio::spawn(async move {
        if let Some(prev) = prev {
            let _ = prev.await;
        }
        let result = match change {
            Change::Upsert => upload(&ctx, &rel_for_task).await,
            Change::Remove => remove_remote(&ctx, &rel_for_task).await,
        };
        if let Err(e) = result {
            downloader::log_object_failure(&ctx.mount().id, &rel_for_task, "upload sync", &e);
        }
    });
    chains.insert(rel, handle);
}

/// Put a file's current contents to the store.
async fn upload(ctx: &SharedContext, rel: &str) -> Result<()> {
    let path = ctx.local_path(rel);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(mount = %ctx.mount().id, rel, "file vanished before upload");
            return Ok(());
        }
        Err(e) => return Err(SyncError::local_io(path, e)),
    };

    let key = ctx.mount().key_for(rel);
    let size = data.len();
    // Suppress before the store mutation so a pass listing right after the
    // put cannot race the entry in.
    ctx.suppressions().insert(rel);
    let _permit = ctx.limiter().acquire().await;
    match ctx
        .client()
        .put(
            &ctx.mount().bucket,
            &key,
            Bytes::from(data),
            ctx.mount().kms_key_id.as_deref(),
        )
        .await
    {
        Ok(_object) => {
            debug!(mount = %ctx.mount().id, rel, size, "uploaded");
            Ok(())
        }
        Err(e) => {
            ctx.suppressions().consume(rel);
            Err(e.into())
        }
    }
}

/// Delete a relpath's object from the store.
async fn remove_remote(ctx: &SharedContext, rel: &str) -> Result<()> {
    let key = ctx.mount().key_for(rel);
    ctx.suppressions().insert(rel);
    let _permit = ctx.limiter().acquire().await;
    match ctx.client().delete(&ctx.mount().bucket, &key).await {
        Ok(()) => {
            ctx.etags().forget(rel);
            debug!(mount = %ctx.mount().id, rel, "deleted remote object");
            Ok(())
        }
        Err(e) => {
            ctx.suppressions().consume(rel);
            Err(e.into())
        }
    }
}

/// Map a raw notifier event onto per-path changes.
///
/// Directory events produce no remote operations of their own (prefixes are
/// implicit), but a directory moving into or within the tree stands in for
/// events on every file beneath it, so those are expanded by walking.
fn classify(event: &Event) -> Vec<(PathBuf, Change)> {
    let mut changes = Vec::new();
    match &event.kind {
        // A plain mkdir needs no remote operation (prefixes are implicit)
        // and the notifier re-watches new directories on its own; files
        // written into them produce their own events.
        EventKind::Create(CreateKind::Folder) => {}
        EventKind::Create(_) => {
            for path in &event.paths {
                push_upsert(&mut changes, path);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                if to.is_dir() {
                    // One rename event stands for the whole subtree.
                    for file in files_under(to) {
                        if let Ok(rel) = file.strip_prefix(to) {
                            push_remove(&mut changes, &from.join(rel));
                        }
                        push_upsert(&mut changes, &file);
                    }
                } else {
                    push_remove(&mut changes, from);
                    push_upsert(&mut changes, to);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            // Renamed out of the watched tree: a remove at the old path.
            for path in &event.paths {
                push_remove(&mut changes, path);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            for path in &event.paths {
                push_upsert_tree(&mut changes, path);
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            for path in &event.paths {
                if path.exists() {
                    push_upsert_tree(&mut changes, path);
                } else {
                    push_remove(&mut changes, path);
                }
            }
        }
        EventKind::Modify(ModifyKind::Metadata(_)) => {}
        EventKind::Modify(_) => {
            for path in &event.paths {
                push_upsert(&mut changes, path);
            }
        }
        EventKind::Remove(RemoveKind::Folder) => {}
        EventKind::Remove(_) => {
            for path in &event.paths {
                push_remove(&mut changes, path);
            }
        }
        _ => {}
    }
    changes
}

fn push_upsert(out: &mut Vec<(PathBuf, Change)>, path: &Path) {
    if is_staging(path) || path.is_dir() {
        return;
    }
    out.push((path.to_path_buf(), Change::Upsert));
}

/// Upsert a path, expanding directories into the files beneath them.
fn push_upsert_tree(out: &mut Vec<(PathBuf, Change)>, path: &Path) {
    if path.is_dir() {
        for file in files_under(path) {
            push_upsert(out, &file);
        }
    } else {
        push_upsert(out, path);
    }
}

fn push_remove(out: &mut Vec<(PathBuf, Change)>, path: &Path) {
    if is_staging(path) {
        return;
    }
    out.push((path.to_path_buf(), Change::Remove));
}

fn is_staging(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(TMP_SUFFIX))
}

fn files_under(dir: &Path) -> Vec<PathBuf> {
    let mut entries = Vec::new();
    if downloader::collect_files(dir, &mut entries).is_err() {
        return Vec::new();
    }
    entries.into_iter().map(|(path, _)| path).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::sync::watch;

    use tether_blob_store::{BlobClient, ObjectStoreClient};

    use crate::context::SyncContext;
    use crate::limiter::TransferLimiter;
    use crate::mount::decode_mounts;

    fn setup() -> (
        SharedContext,
        Arc<ObjectStoreClient>,
        tempfile::TempDir,
        watch::Sender<()>,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let client = Arc::new(ObjectStoreClient::memory());
        let mount = decode_mounts(r#"[{"id":"M","bucket":"b","prefix":"p/M","writeable":true}]"#)
            .unwrap()
            .remove(0);
        let (tx, rx) = watch::channel(());
        let ctx = SyncContext::new(
            mount,
            dir.path(),
            client.clone(),
            TransferLimiter::new(4),
            Duration::from_secs(60),
            rx,
        );
        std::fs::create_dir_all(ctx.root()).unwrap();
        (ctx, client, dir, tx)
    }

    async fn remote_body(client: &ObjectStoreClient, key: &str) -> Option<String> {
        use futures::TryStreamExt;
        let outcome = client.get("b", key).await.ok()?;
        let chunks: Vec<Bytes> = outcome.stream.try_collect().await.ok()?;
        Some(String::from_utf8(chunks.concat()).unwrap())
    }

    #[tokio::test]
    async fn test_upload_puts_current_contents_and_suppresses() {
        let (ctx, client, _dir, _tx) = setup();
        std::fs::write(ctx.local_path("a.txt"), "local bytes").unwrap();

        upload(&ctx, "a.txt").await.unwrap();
        assert_eq!(
            remote_body(&client, "p/M/a.txt").await.as_deref(),
            Some("local bytes")
        );
        assert!(ctx.suppressions().contains("a.txt"));
    }

    #[tokio::test]
    async fn test_upload_of_vanished_file_is_a_noop() {
        let (ctx, client, _dir, _tx) = setup();
        upload(&ctx, "ghost.txt").await.unwrap();
        assert!(client.head("b", "p/M/ghost.txt").await.unwrap().is_none());
        assert!(!ctx.suppressions().contains("ghost.txt"));
    }

    #[tokio::test]
    async fn test_remove_remote_deletes_and_suppresses() {
        let (ctx, client, _dir, _tx) = setup();
        client
            .put("b", "p/M/gone.txt", Bytes::from("x"), None)
            .await
            .unwrap();

        remove_remote(&ctx, "gone.txt").await.unwrap();
        assert!(client.head("b", "p/M/gone.txt").await.unwrap().is_none());
        assert!(ctx.suppressions().contains("gone.txt"));
    }

    #[tokio::test]
    async fn test_reconcile_uploads_missing_and_skips_matching() {
        let (ctx, client, _dir, _tx) = setup();
        std::fs::write(ctx.local_path("new.txt"), "brand new").unwrap();
        std::fs::write(ctx.local_path("same.txt"), "same size").unwrap();
        client
            .put("b", "p/M/same.txt", Bytes::from("same size"), None)
            .await
            .unwrap();

        let summary = reconcile_existing(&ctx).await.unwrap();
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(
            remote_body(&client, "p/M/new.txt").await.as_deref(),
            Some("brand new")
        );
    }

    #[test]
    fn test_classify_file_create_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        let create =
            classify(&Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone()));
        assert_eq!(create, vec![(file.clone(), Change::Upsert)]);

        let write = classify(
            &Event::new(EventKind::Modify(ModifyKind::Data(
                notify::event::DataChange::Content,
            )))
            .add_path(file.clone()),
        );
        assert_eq!(write, vec![(file, Change::Upsert)]);
    }

    #[test]
    fn test_classify_remove_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.txt");
        let new = dir.path().join("new.txt");
        std::fs::write(&new, "x").unwrap();

        let removed =
            classify(&Event::new(EventKind::Remove(RemoveKind::File)).add_path(old.clone()));
        assert_eq!(removed, vec![(old.clone(), Change::Remove)]);

        let renamed = classify(
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(old.clone())
                .add_path(new.clone()),
        );
        assert_eq!(
            renamed,
            vec![(old, Change::Remove), (new, Change::Upsert)]
        );
    }

    #[test]
    fn test_classify_ignores_staging_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(format!("f.txt{TMP_SUFFIX}"));
        std::fs::write(&staging, "x").unwrap();

        let create =
            classify(&Event::new(EventKind::Create(CreateKind::File)).add_path(staging.clone()));
        assert!(create.is_empty());

        let file = dir.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();
        let chmod = classify(
            &Event::new(EventKind::Modify(ModifyKind::Metadata(
                notify::event::MetadataKind::Permissions,
            )))
            .add_path(file),
        );
        assert!(chmod.is_empty());
    }

    #[test]
    fn test_classify_staging_rename_is_an_install() {
        // The downloader's atomic rename: staging name → final name. Only
        // the final path surfaces, as an upsert.
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(format!("f.txt{TMP_SUFFIX}"));
        let fin = dir.path().join("f.txt");
        std::fs::write(&fin, "x").unwrap();

        let changes = classify(
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(staging)
                .add_path(fin.clone()),
        );
        assert_eq!(changes, vec![(fin, Change::Upsert)]);
    }

    #[test]
    fn test_classify_directory_rename_expands_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let old_dir = dir.path().join("old");
        let new_dir = dir.path().join("new");
        std::fs::create_dir_all(new_dir.join("sub")).unwrap();
        std::fs::write(new_dir.join("a.txt"), "a").unwrap();
        std::fs::write(new_dir.join("sub/b.txt"), "b").unwrap();

        let mut changes = classify(
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(old_dir.clone())
                .add_path(new_dir.clone()),
        );
        changes.sort();
        let mut expected = vec![
            (old_dir.join("a.txt"), Change::Remove),
            (old_dir.join("sub/b.txt"), Change::Remove),
            (new_dir.join("a.txt"), Change::Upsert),
            (new_dir.join("sub/b.txt"), Change::Upsert),
        ];
        expected.sort();
        assert_eq!(changes, expected);
    }

    #[tokio::test]
    async fn test_suppressed_event_is_consumed_and_ignored() {
        let (ctx, _client, _dir, _tx) = setup();
        let file = ctx.local_path("a.txt");
        std::fs::write(&file, "x").unwrap();
        ctx.suppressions().insert("a.txt");

        let mut pending = HashMap::new();
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(file);
        handle_event(&ctx, &event, &mut pending, DEFAULT_DEBOUNCE);

        assert!(pending.is_empty());
        assert!(!ctx.suppressions().contains("a.txt"));
    }

    #[tokio::test]
    async fn test_events_coalesce_per_relpath() {
        let (ctx, _client, _dir, _tx) = setup();
        let file = ctx.local_path("a.txt");
        std::fs::write(&file, "x").unwrap();

        let mut pending = HashMap::new();
        let create = Event::new(EventKind::Create(CreateKind::File)).add_path(file.clone());
        let write = Event::new(EventKind::Modify(ModifyKind::Data(
            notify::event::DataChange::Content,
        )))
        .add_path(file.clone());
        let remove = Event::new(EventKind::Remove(RemoveKind::File)).add_path(file);

        handle_event(&ctx, &create, &mut pending, DEFAULT_DEBOUNCE);
        handle_event(&ctx, &write, &mut pending, DEFAULT_DEBOUNCE);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.get("a.txt").unwrap().0, Change::Upsert);

        // Last event wins: a remove supersedes the pending upsert.
        handle_event(&ctx, &remove, &mut pending, DEFAULT_DEBOUNCE);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.get("a.txt").unwrap().0, Change::Remove);
    }

    /// End-to-end watcher loop against the real notifier. Filesystem event
    /// latency makes this slow-ish but inotify on CI is dependable.
    #[tokio::test(flavor = "multi_thread")]
    async fn test_watcher_uploads_created_file() {
        let (ctx, client, _dir, tx) = setup();

        let handle = tokio::spawn(run(
            ctx.clone(),
            UploaderConfig {
                debounce: Duration::from_millis(100),
                stop_after: None,
            },
        ));

        // Give the watch time to register before writing.
        tokio::time::sleep(Duration::from_millis(300)).await;
        std::fs::write(ctx.local_path("fresh.txt"), "fresh bytes").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            if remote_body(&client, "p/M/fresh.txt").await.as_deref() == Some("fresh bytes") {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "created file was never uploaded"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("watcher must stop on cancellation")
            .unwrap()
            .unwrap();
    }
}
