//! `object_store`-backed implementation of the blob API.
//!
//! One [`ObjectStoreClient`] serves every bucket the mount set names.
//! Backend handles are built lazily per `(bucket, kms key)` pair and cached,
//! because S3 server-side encryption is configured on the handle rather than
//! per request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::{BlobClient, GetOutcome, RemoteObject};
use crate::error::{BlobError, Result};

/// Configuration for the object storage backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-memory storage (for testing)
    #[default]
    Memory,

    /// Local filesystem storage; each bucket is a subdirectory of `path`
    Local {
        /// Root directory holding one subdirectory per bucket
        path: PathBuf,
    },

    /// S3-compatible storage (AWS S3, MinIO, etc.)
    ///
    /// Credentials come from the ambient environment, the same way the AWS
    /// SDK reads them.
    S3 {
        /// Optional endpoint override (e.g. "http://localhost:9000")
        endpoint: Option<String>,
        /// Optional region (defaults to "us-east-1")
        region: Option<String>,
        /// Allow plain-HTTP endpoints
        allow_http: bool,
    },
}

type StoreKey = (String, Option<String>);

/// Multi-bucket [`BlobClient`] over the `object_store` crate.
#[derive(Debug)]
pub struct ObjectStoreClient {
    config: StoreConfig,
    stores: Mutex<HashMap<StoreKey, Arc<dyn ObjectStore>>>,
}

impl ObjectStoreClient {
    /// Create a client for the given backend configuration.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            stores: Mutex::new(HashMap::new()),
        }
    }

    /// Create a fully in-memory client. Buckets spring into existence on
    /// first use and vanish with the client.
    pub fn memory() -> Self {
        Self::new(StoreConfig::Memory)
    }

    /// Get or build the backend handle for `(bucket, kms_key_id)`.
    fn store_for(&self, bucket: &str, kms_key_id: Option<&str>) -> Result<Arc<dyn ObjectStore>> {
        // Only the S3 backend differentiates handles by encryption key.
        let kms = match self.config {
            StoreConfig::S3 { .. } => kms_key_id.map(|k| k.to_string()),
            _ => None,
        };
        let key = (bucket.to_string(), kms);

        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(&key) {
            return Ok(store.clone());
        }

        let store: Arc<dyn ObjectStore> = match &self.config {
            StoreConfig::Memory => Arc::new(InMemory::new()),

            StoreConfig::Local { path } => {
                let bucket_root = path.join(bucket);
                std::fs::create_dir_all(&bucket_root)?;
                Arc::new(
                    LocalFileSystem::new_with_prefix(&bucket_root)
                        .map_err(|e| BlobError::InvalidConfig(e.to_string()))?,
                )
            }

            StoreConfig::S3 {
                endpoint,
                region,
                allow_http,
            } => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(region.as_deref().unwrap_or("us-east-1"))
                    .with_allow_http(*allow_http);
                if let Some(endpoint) = endpoint {
                    builder = builder.with_endpoint(endpoint);
                }
                if let Some(kms) = key.1.as_deref() {
                    builder = builder.with_sse_kms_encryption(kms);
                }
                Arc::new(
                    builder
                        .build()
                        .map_err(|e| BlobError::InvalidConfig(e.to_string()))?,
                )
            }
        };

        debug!(bucket, kms = ?key.1, "opened store handle");
        stores.insert(key, store.clone());
        Ok(store)
    }
}

fn object_from_meta(meta: &ObjectMeta) -> RemoteObject {
    RemoteObject {
        key: meta.location.as_ref().to_string(),
        size: meta.size as u64,
        etag: meta.e_tag.clone(),
        last_modified: meta.last_modified,
    }
}

#[async_trait::async_trait]
impl BlobClient for ObjectStoreClient {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<RemoteObject>> {
        let store = self.store_for(bucket, None)?;
        let prefix_path = ObjectPath::from(prefix);
        let metas: Vec<ObjectMeta> = store
            .list(Some(&prefix_path))
            .try_collect()
            .await
            .map_err(|e| BlobError::classify(bucket, prefix, e))?;
        Ok(metas.iter().map(object_from_meta).collect())
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<GetOutcome> {
        let store = self.store_for(bucket, None)?;
        let path = ObjectPath::from(key);
        let result = store
            .get(&path)
            .await
            .map_err(|e| BlobError::classify(bucket, key, e))?;
        let object = object_from_meta(&result.meta);

        let bucket = bucket.to_string();
        let key = key.to_string();
        let stream = result
            .into_stream()
            .map_err(move |e| BlobError::classify(&bucket, &key, e))
            .boxed();

        Ok(GetOutcome { object, stream })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        kms_key_id: Option<&str>,
    ) -> Result<RemoteObject> {
        let store = self.store_for(bucket, kms_key_id)?;
        let path = ObjectPath::from(key);
        let size = data.len() as u64;
        let result = store
            .put(&path, data.into())
            .await
            .map_err(|e| BlobError::classify(bucket, key, e))?;
        // PutResult carries no timestamp; the local clock is close enough
        // for the freshness checks downstream.
        Ok(RemoteObject {
            key: key.to_string(),
            size,
            etag: result.e_tag,
            last_modified: Utc::now(),
        })
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let store = self.store_for(bucket, None)?;
        let path = ObjectPath::from(key);
        match store.delete(&path).await {
            Ok(()) => Ok(()),
            // The object may already be gone; deletion is idempotent.
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(BlobError::classify(bucket, key, e)),
        }
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<RemoteObject>> {
        let store = self.store_for(bucket, None)?;
        let path = ObjectPath::from(key);
        match store.head(&path).await {
            Ok(meta) => Ok(Some(object_from_meta(&meta))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(BlobError::classify(bucket, key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let client = ObjectStoreClient::memory();

        let stored = client
            .put("bucket", "p/a.txt", Bytes::from("hello"), None)
            .await
            .unwrap();
        assert_eq!(stored.size, 5);
        assert!(stored.etag.is_some());

        let outcome = client.get("bucket", "p/a.txt").await.unwrap();
        assert_eq!(outcome.object.size, 5);
        let chunks: Vec<Bytes> = outcome.stream.try_collect().await.unwrap();
        let body: Vec<u8> = chunks.concat();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_list_is_prefix_scoped() {
        let client = ObjectStoreClient::memory();
        client
            .put("bucket", "p/A/one.txt", Bytes::from("1"), None)
            .await
            .unwrap();
        client
            .put("bucket", "p/A/sub/two.txt", Bytes::from("2"), None)
            .await
            .unwrap();
        client
            .put("bucket", "p/AB/other.txt", Bytes::from("3"), None)
            .await
            .unwrap();

        let mut keys: Vec<String> = client
            .list("bucket", "p/A")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["p/A/one.txt", "p/A/sub/two.txt"]);
    }

    #[tokio::test]
    async fn test_buckets_are_isolated() {
        let client = ObjectStoreClient::memory();
        client
            .put("a", "k.txt", Bytes::from("a"), None)
            .await
            .unwrap();
        client
            .put("b", "k.txt", Bytes::from("b"), None)
            .await
            .unwrap();

        assert_eq!(client.list("a", "").await.unwrap().len(), 1);
        let from_b = client.get("b", "k.txt").await.unwrap();
        let chunks: Vec<Bytes> = from_b.stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"b");
    }

    #[tokio::test]
    async fn test_head_missing_is_none() {
        let client = ObjectStoreClient::memory();
        assert!(client.head("bucket", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let client = ObjectStoreClient::memory();
        let err = client.get("bucket", "nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let client = ObjectStoreClient::memory();
        client.delete("bucket", "nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_changes_etag() {
        let client = ObjectStoreClient::memory();
        let first = client
            .put("bucket", "k.txt", Bytes::from("one"), None)
            .await
            .unwrap();
        let second = client
            .put("bucket", "k.txt", Bytes::from("two"), None)
            .await
            .unwrap();
        assert_ne!(first.etag, second.etag);
    }

    #[tokio::test]
    async fn test_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let client = ObjectStoreClient::new(StoreConfig::Local {
            path: dir.path().to_path_buf(),
        });

        client
            .put("bucket", "p/file.txt", Bytes::from("on disk"), None)
            .await
            .unwrap();
        assert!(dir.path().join("bucket").join("p/file.txt").exists());

        let listed = client.list("bucket", "p").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "p/file.txt");
    }
}
