use std::path::PathBuf;

use clap::Parser;
use url::Url;

use tether_blob_store::StoreConfig;
use tether_sync::SyncOptions;

/// Materialize object-store prefixes as local directories and keep them in
/// sync, both ways for writeable mounts.
#[derive(Parser, Debug)]
#[command(name = "tetherd", version, about)]
pub struct Args {
    /// JSON array of mount descriptors
    /// (fields: id, bucket, prefix, writeable, kmsKeyId)
    #[arg(long)]
    pub mounts_json: String,

    /// Local root under which every mount materializes
    #[arg(long)]
    pub destination_base: PathBuf,

    /// Verbose logging
    #[arg(long)]
    pub debug: bool,

    /// Keep polling the store after the initial download
    #[arg(long)]
    pub recurring_downloads: bool,

    /// Stop pollers after this many recurring passes; <= 0 means no limit
    #[arg(long, default_value_t = -1)]
    pub stop_recurring_downloads_after: i64,

    /// Seconds between pass completions; must be >= 1
    #[arg(long, default_value_t = 60)]
    pub download_interval: u64,

    /// Stop upload watchers after this many seconds; <= 0 means no limit
    #[arg(long, default_value_t = -1)]
    pub stop_upload_watchers_after: i64,

    /// Cap on in-flight object transfers across all mounts
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// On writeable mounts, upload local files the store is missing at
    /// startup instead of waiting for the first local edit
    #[arg(long)]
    pub reconcile_uploads_on_start: bool,

    /// Store backend
    #[arg(long, value_enum, default_value = "s3")]
    pub store: StoreBackend,

    /// Endpoint override for S3-compatible stores (e.g. MinIO)
    #[arg(long)]
    pub endpoint: Option<Url>,

    /// S3 region
    #[arg(long)]
    pub region: Option<String>,

    /// Allow plain-HTTP endpoints
    #[arg(long)]
    pub allow_http: bool,

    /// Root directory for the `local` store backend
    #[arg(long)]
    pub local_path: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    /// S3-compatible object store, credentials from the environment
    S3,
    /// A directory per bucket on the local filesystem
    Local,
    /// Ephemeral in-memory store
    Memory,
}

impl Args {
    pub fn store_config(&self) -> StoreConfig {
        match self.store {
            StoreBackend::Memory => StoreConfig::Memory,
            StoreBackend::Local => StoreConfig::Local {
                path: self
                    .local_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("./tether-store")),
            },
            StoreBackend::S3 => StoreConfig::S3 {
                endpoint: self
                    .endpoint
                    .as_ref()
                    .map(|u| u.as_str().trim_end_matches('/').to_string()),
                region: self.region.clone(),
                allow_http: self.allow_http
                    || self.endpoint.as_ref().is_some_and(|u| u.scheme() == "http"),
            },
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        let mut options = SyncOptions::new(&self.destination_base);
        options.recurring_downloads = self.recurring_downloads;
        options.stop_recurring_downloads_after = self.stop_recurring_downloads_after;
        options.download_interval = self.download_interval;
        options.stop_upload_watchers_after = self.stop_upload_watchers_after;
        options.concurrency = self.concurrency;
        options.reconcile_uploads_on_start = self.reconcile_uploads_on_start;
        options
    }
}
