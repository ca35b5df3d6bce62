//! Bidirectional object-store prefix / local directory synchronizer.
//!
//! Given a declarative list of mounts — each binding a `(bucket, prefix)`
//! pair to a local subdirectory — this crate materializes every prefix on
//! disk and keeps it there:
//!
//! - a seed download streams every object into place (never deleting
//!   whatever the operator already had locally),
//! - a recurring poller mirrors remote adds, updates and deletes down,
//! - for writeable mounts, a debounced filesystem watcher pushes local
//!   adds, updates, deletes and renames back up.
//!
//! The echo problem — a local write becoming a remote put becoming a local
//! re-download — is broken by a per-mount, TTL'd suppression set plus a
//! content check, and every object transfer in the process is gated by one
//! shared concurrency limiter.
//!
//! ```text
//! controller ── per mount ──► seed pass ──► poller ──► passes…
//!                                 │
//!                                 └──► watcher ──► debounce ──► put/delete
//! ```
//!
//! [`run`] is the single entry point; hand it a
//! [`BlobClient`](tether_blob_store::BlobClient), the mounts JSON and a
//! shutdown receiver.

pub mod context;
pub mod controller;
pub mod downloader;
pub mod error;
pub mod limiter;
pub mod mount;
pub mod poller;
pub mod suppress;
pub mod uploader;

pub use context::{SharedContext, SyncContext};
pub use controller::{run, ControllerState, SyncOptions};
pub use downloader::PassSummary;
pub use error::{Result, SyncError};
pub use limiter::TransferLimiter;
pub use mount::{decode_mounts, Mount};
pub use suppress::SuppressionSet;
