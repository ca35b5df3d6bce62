//! Error types for the blob store adapter.

/// Errors surfaced by [`BlobClient`](crate::BlobClient) implementations.
///
/// Callers retry [`Transient`](BlobError::Transient) failures on their next
/// pass; everything else is permanent for the object in question.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// Invalid backend configuration
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),

    /// The bucket itself is missing
    #[error("bucket '{0}' does not exist")]
    BucketNotFound(String),

    /// An expected object is missing
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    /// The store rejected the request for authorization reasons
    #[error("permission denied: {0}")]
    Permission(String),

    /// Network, throttling, 5xx — safe to retry
    #[error("transient store error: {0}")]
    Transient(#[source] object_store::Error),

    /// IO error while staging data for the store
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobError {
    /// Whether the next reconciliation pass should retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BlobError::Transient(_))
    }

    /// Whether the error just means the object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BlobError::NotFound { .. })
    }

    /// Classify an `object_store` error for a given bucket/key.
    ///
    /// The underlying crate folds HTTP status detail into opaque variants,
    /// so authorization failures are sniffed from the message the same way
    /// the store wrappers have always had to.
    pub(crate) fn classify(bucket: &str, key: &str, err: object_store::Error) -> Self {
        if let object_store::Error::NotFound { .. } = err {
            return BlobError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            };
        }
        let msg = err.to_string();
        let lowered = msg.to_ascii_lowercase();
        if lowered.contains("access denied")
            || lowered.contains("forbidden")
            || lowered.contains("403")
            || lowered.contains("invalidaccesskeyid")
        {
            return BlobError::Permission(msg);
        }
        if lowered.contains("nosuchbucket") {
            return BlobError::BucketNotFound(bucket.to_string());
        }
        BlobError::Transient(err)
    }
}

/// Result type alias for blob store operations.
pub type Result<T> = std::result::Result<T, BlobError>;
