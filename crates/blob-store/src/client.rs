//! The narrow blob API the synchronizer is written against.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::Result;

/// Descriptor for one remote object.
///
/// `etag` is opaque; two descriptors with equal etags are assumed to name
/// equal bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Full key within the bucket
    pub key: String,
    /// Object size in bytes
    pub size: u64,
    /// Opaque content fingerprint, when the store provides one
    pub etag: Option<String>,
    /// Server-side last-modified timestamp
    pub last_modified: DateTime<Utc>,
}

/// A streamed object body plus its descriptor.
pub struct GetOutcome {
    /// Descriptor of the object being read
    pub object: RemoteObject,
    /// Body chunks, in order
    pub stream: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for GetOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetOutcome")
            .field("object", &self.object)
            .field("stream", &"<stream>")
            .finish()
    }
}

/// Uniform list/get/put/delete/head capability over a remote object store.
///
/// Implementations must be safe for concurrent use; the synchronizer shares
/// one client across every mount and bounds in-flight calls externally.
#[async_trait::async_trait]
pub trait BlobClient: Send + Sync + 'static {
    /// List every object under `prefix` in `bucket`.
    ///
    /// Pagination happens internally; the returned set is a point-in-time
    /// snapshot and is not restartable.
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>>;

    /// Stream one object's bytes together with its descriptor.
    async fn get(&self, bucket: &str, key: &str) -> Result<GetOutcome>;

    /// Write an object, optionally under a server-side encryption key.
    ///
    /// Returns the descriptor of the stored object.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        kms_key_id: Option<&str>,
    ) -> Result<RemoteObject>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Fetch an object's descriptor without its body.
    ///
    /// Returns `None` when the object does not exist.
    async fn head(&self, bucket: &str, key: &str) -> Result<Option<RemoteObject>>;
}
