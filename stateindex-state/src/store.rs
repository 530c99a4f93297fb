//! Object store traits used by the fetcher

use std::fs::File;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::config::S3Backend;
use crate::error::IndexResult;

/// One object to retrieve into an already opened local file
#[derive(Debug)]
pub struct DownloadRequest {
    pub bucket: String,
    pub key: String,
    /// Path of `file`, for logging and cleanup
    pub destination: PathBuf,
    pub file: File,
}

/// Trait for stores that can retrieve objects in batches
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Retrieve every requested object into its destination file
    ///
    /// The whole batch fails on the first object that cannot be retrieved.
    /// Objects may complete in any order.
    async fn download(&self, requests: Vec<DownloadRequest>) -> IndexResult<()>;
}

/// Trait for building the object store of one backend
///
/// Region and credentials are per backend, so each backend gets its own store.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self, backend: &S3Backend) -> IndexResult<Box<dyn ObjectStore>>;
}
