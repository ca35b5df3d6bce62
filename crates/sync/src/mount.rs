//! Mount records and the declarative JSON decoder.
//!
//! A mount binds one remote key prefix to one local subdirectory. The set
//! of mounts arrives as a single JSON array string; decoding failures are
//! fatal before any I/O happens.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Result, SyncError};

/// A declarative binding of a remote prefix to a local directory.
///
/// Immutable after decode.
#[derive(Debug, Clone, Deserialize)]
pub struct Mount {
    /// Unique within one invocation; doubles as the local subdirectory name
    pub id: String,
    /// Remote container name
    pub bucket: String,
    /// Remote key prefix, stored without a trailing slash
    #[serde(default)]
    pub prefix: String,
    /// Whether local changes are propagated back to the store
    #[serde(default)]
    pub writeable: bool,
    /// Server-side encryption key id, forwarded verbatim on uploads
    #[serde(default, rename = "kmsKeyId")]
    pub kms_key_id: Option<String>,
}

impl Mount {
    /// Local root of this mount under `destination_base`.
    pub fn local_root(&self, destination_base: &Path) -> PathBuf {
        destination_base.join(&self.id)
    }

    /// The full remote key for a relpath.
    pub fn key_for(&self, relpath: &str) -> String {
        if self.prefix.is_empty() {
            relpath.to_string()
        } else {
            format!("{}/{}", self.prefix, relpath)
        }
    }

    /// Strip the mount prefix off a key, yielding its relpath.
    ///
    /// Returns `None` for keys outside the prefix and for the key equal to
    /// the prefix itself (prefixes are not objects worth materializing).
    pub fn relpath_of<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rel = if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(self.prefix.as_str())?
                .strip_prefix('/')?
        };
        if rel.is_empty() {
            None
        } else {
            Some(rel)
        }
    }
}

/// Decode and validate a JSON array of mount records.
///
/// An empty array is valid and yields no work; so is `null`, which is what
/// some encoders produce for an absent list.
pub fn decode_mounts(mounts_json: &str) -> Result<Vec<Mount>> {
    let mut mounts: Vec<Mount> = serde_json::from_str::<Option<Vec<Mount>>>(mounts_json)
        .map_err(|e| SyncError::InvalidMountConfig(e.to_string()))?
        .unwrap_or_default();

    for mount in &mut mounts {
        if mount.id.is_empty() {
            return Err(SyncError::InvalidMountConfig(
                "mount id must not be empty".to_string(),
            ));
        }
        if mount.id.contains('/') || mount.id.contains('\\') || mount.id == ".." {
            return Err(SyncError::InvalidMountConfig(format!(
                "mount id '{}' is not a valid directory name",
                mount.id
            )));
        }
        if mount.bucket.is_empty() {
            return Err(SyncError::InvalidMountConfig(format!(
                "mount '{}' has an empty bucket",
                mount.id
            )));
        }
        while mount.prefix.ends_with('/') {
            mount.prefix.pop();
        }
        // The original shipped empty strings instead of omitting the field.
        if mount.kms_key_id.as_deref() == Some("") {
            mount.kms_key_id = None;
        }
    }

    // Two mounts must never share a destination; the destination is a pure
    // function of the id.
    for (i, mount) in mounts.iter().enumerate() {
        if mounts[..i].iter().any(|m| m.id == mount.id) {
            return Err(SyncError::InvalidMountConfig(format!(
                "duplicate mount id '{}'",
                mount.id
            )));
        }
    }

    Ok(mounts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(id: &str, prefix: &str) -> Mount {
        Mount {
            id: id.to_string(),
            bucket: "bucket".to_string(),
            prefix: prefix.to_string(),
            writeable: false,
            kms_key_id: None,
        }
    }

    #[test]
    fn test_decode_full_record() {
        let json = r#"[{"id":"A","bucket":"b","prefix":"p/A","writeable":true,"kmsKeyId":"key-1"}]"#;
        let mounts = decode_mounts(json).unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].id, "A");
        assert_eq!(mounts[0].bucket, "b");
        assert_eq!(mounts[0].prefix, "p/A");
        assert!(mounts[0].writeable);
        assert_eq!(mounts[0].kms_key_id.as_deref(), Some("key-1"));
    }

    #[test]
    fn test_decode_defaults_and_unknown_fields() {
        let json = r#"[{"id":"A","bucket":"b","prefix":"p","somethingElse":42}]"#;
        let mounts = decode_mounts(json).unwrap();
        assert!(!mounts[0].writeable);
        assert!(mounts[0].kms_key_id.is_none());
    }

    #[test]
    fn test_decode_empty_array() {
        assert!(decode_mounts("[]").unwrap().is_empty());
    }

    #[test]
    fn test_decode_null_is_empty() {
        assert!(decode_mounts("null").unwrap().is_empty());
    }

    #[test]
    fn test_decode_invalid_json() {
        let err = decode_mounts("some invalid json").unwrap_err();
        assert!(matches!(err, SyncError::InvalidMountConfig(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_decode_missing_required_field() {
        let err = decode_mounts(r#"[{"id":"A"}]"#).unwrap_err();
        assert!(matches!(err, SyncError::InvalidMountConfig(_)));
    }

    #[test]
    fn test_decode_rejects_empty_id_and_bucket() {
        assert!(decode_mounts(r#"[{"id":"","bucket":"b","prefix":"p"}]"#).is_err());
        assert!(decode_mounts(r#"[{"id":"A","bucket":"","prefix":"p"}]"#).is_err());
    }

    #[test]
    fn test_decode_rejects_traversal_ids() {
        assert!(decode_mounts(r#"[{"id":"a/b","bucket":"b","prefix":"p"}]"#).is_err());
        assert!(decode_mounts(r#"[{"id":"..","bucket":"b","prefix":"p"}]"#).is_err());
    }

    #[test]
    fn test_decode_rejects_duplicate_ids() {
        let json = r#"[{"id":"A","bucket":"b","prefix":"p"},{"id":"A","bucket":"b","prefix":"q"}]"#;
        assert!(decode_mounts(json).is_err());
    }

    #[test]
    fn test_decode_trims_trailing_slash_and_empty_kms() {
        let json = r#"[{"id":"A","bucket":"b","prefix":"p/A/","kmsKeyId":""}]"#;
        let mounts = decode_mounts(json).unwrap();
        assert_eq!(mounts[0].prefix, "p/A");
        assert!(mounts[0].kms_key_id.is_none());
    }

    #[test]
    fn test_key_and_relpath_roundtrip() {
        let m = mount("A", "p/A");
        assert_eq!(m.key_for("dir/file.txt"), "p/A/dir/file.txt");
        assert_eq!(m.relpath_of("p/A/dir/file.txt"), Some("dir/file.txt"));
        assert_eq!(m.relpath_of("p/A"), None);
        assert_eq!(m.relpath_of("p/Axe/file.txt"), None);
        assert_eq!(m.relpath_of("other/file.txt"), None);
    }

    #[test]
    fn test_empty_prefix_maps_whole_bucket() {
        let m = mount("A", "");
        assert_eq!(m.key_for("f.txt"), "f.txt");
        assert_eq!(m.relpath_of("f.txt"), Some("f.txt"));
    }
}
