//! Echo suppression between the downloader and the uploader.
//!
//! Whenever one side of the synchronizer mutates what the other side
//! watches, it records the relpath here first. The other side consumes the
//! entry and ignores the resulting event, which is what breaks the
//! local-write → remote-put → remote-list → local-download loop (and its
//! mirror image). Entries expire so a lost event cannot permanently mask a
//! real change.

use std::time::Duration;

use moka::sync::Cache;

/// Per-mount, time-limited set of relpaths whose next event is swallowed.
#[derive(Debug)]
pub struct SuppressionSet {
    entries: Cache<String, ()>,
}

impl SuppressionSet {
    /// Create a set whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Cache::builder()
                .time_to_live(ttl)
                .max_capacity(100_000)
                .build(),
        }
    }

    /// Mark the next event for `relpath` as self-inflicted.
    pub fn insert(&self, relpath: &str) {
        self.entries.insert(relpath.to_string(), ());
    }

    /// Consume one suppression entry, if present.
    ///
    /// Returns true when the caller should ignore the event it is holding.
    pub fn consume(&self, relpath: &str) -> bool {
        if self.entries.contains_key(relpath) {
            self.entries.invalidate(relpath);
            true
        } else {
            false
        }
    }

    /// Whether `relpath` currently has a live entry.
    pub fn contains(&self, relpath: &str) -> bool {
        self.entries.contains_key(relpath)
    }

    /// Drop every entry.
    ///
    /// The seed download runs before any watcher is registered, so nobody
    /// will ever consume the entries it inserted; the controller clears
    /// them rather than letting them mask the first real local edits.
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_is_one_shot() {
        let set = SuppressionSet::new(Duration::from_secs(60));
        set.insert("a/b.txt");
        assert!(set.contains("a/b.txt"));
        assert!(set.consume("a/b.txt"));
        assert!(!set.consume("a/b.txt"));
    }

    #[test]
    fn test_unknown_relpath_is_not_suppressed() {
        let set = SuppressionSet::new(Duration::from_secs(60));
        assert!(!set.consume("never-inserted"));
    }

    #[test]
    fn test_entries_expire() {
        let set = SuppressionSet::new(Duration::from_millis(50));
        set.insert("a.txt");
        std::thread::sleep(Duration::from_millis(120));
        assert!(!set.contains("a.txt"));
        assert!(!set.consume("a.txt"));
    }

    #[test]
    fn test_clear_drops_everything() {
        let set = SuppressionSet::new(Duration::from_secs(60));
        set.insert("a.txt");
        set.insert("b.txt");
        set.clear();
        assert!(!set.contains("a.txt"));
        assert!(!set.consume("b.txt"));
    }

    #[test]
    fn test_reinsert_refreshes() {
        let set = SuppressionSet::new(Duration::from_secs(60));
        set.insert("a.txt");
        set.insert("a.txt");
        // Still a set: a single consume drains it.
        assert!(set.consume("a.txt"));
        assert!(!set.contains("a.txt"));
    }
}
