//! Object store adapter for tether.
//!
//! This crate provides the narrow blob API the synchronizer is written
//! against ([`BlobClient`]) and its production implementation over the
//! `object_store` crate ([`ObjectStoreClient`]) with pluggable backends:
//!
//! - S3-compatible stores (AWS S3, MinIO), with optional SSE-KMS
//! - local filesystem (one directory per bucket)
//! - in-memory (for tests)
//!
//! Keys are plain `/`-separated strings; buckets are named per call so a
//! single client can serve every mount in a process.

mod client;
mod error;
mod store;

pub use client::{BlobClient, GetOutcome, RemoteObject};
pub use error::{BlobError, Result};
pub use store::{ObjectStoreClient, StoreConfig};
