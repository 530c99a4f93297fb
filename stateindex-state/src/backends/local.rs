//! Local mirror object store
//!
//! Serves objects from a directory laid out as `{root}/{bucket}/{key}`.
//! Useful for offline runs against a synced copy of the state buckets.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use log::debug;
use tokio::io::AsyncWriteExt;

use crate::config::S3Backend;
use crate::error::{IndexError, IndexResult};
use crate::store::{DownloadRequest, ObjectStore, StoreConnector};

/// Object store backed by a local directory tree
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    /// Mirror root
    root: PathBuf,
    /// Number of objects requested so far, shared between clones
    retrievals: Arc<AtomicUsize>,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retrievals: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Get the mirror root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of objects requested from this store (and its clones)
    pub fn retrievals(&self) -> usize {
        self.retrievals.load(Ordering::SeqCst)
    }

    /// Path of an object inside the mirror
    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key.trim_start_matches('/'))
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn download(&self, requests: Vec<DownloadRequest>) -> IndexResult<()> {
        for request in requests {
            self.retrievals.fetch_add(1, Ordering::SeqCst);

            let source = self.object_path(&request.bucket, &request.key);
            let content = tokio::fs::read(&source).await.map_err(|e| {
                IndexError::fetch(
                    &request.bucket,
                    Some(request.key.as_str()),
                    format!("Failed to read {}: {}", source.display(), e),
                )
            })?;

            let mut file = tokio::fs::File::from_std(request.file);
            file.write_all(&content).await.map_err(|e| {
                IndexError::fetch(
                    &request.bucket,
                    Some(request.key.as_str()),
                    format!("Failed to write {}: {}", request.destination.display(), e),
                )
            })?;
            file.flush().await.map_err(|e| {
                IndexError::fetch(
                    &request.bucket,
                    Some(request.key.as_str()),
                    format!("Failed to flush {}: {}", request.destination.display(), e),
                )
            })?;

            debug!(
                "Copied {} to {}",
                source.display(),
                request.destination.display()
            );
        }

        Ok(())
    }
}

#[async_trait]
impl StoreConnector for LocalObjectStore {
    async fn connect(&self, _backend: &S3Backend) -> IndexResult<Box<dyn ObjectStore>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn request(bucket: &str, key: &str, destination: PathBuf) -> DownloadRequest {
        let file = std::fs::File::create(&destination).unwrap();
        DownloadRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            destination,
            file,
        }
    }

    #[tokio::test]
    async fn test_local_store_copies_objects() {
        let mirror = tempdir().unwrap();
        let out = tempdir().unwrap();
        let store = LocalObjectStore::new(mirror.path());

        let source = store.object_path("states", "prod/app.tfstate");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"{\"version\": 4}").unwrap();

        let destination = out.path().join("app.tfstate");
        store
            .download(vec![request("states", "prod/app.tfstate", destination.clone())])
            .await
            .unwrap();

        assert_eq!(std::fs::read(&destination).unwrap(), b"{\"version\": 4}");
        assert_eq!(store.retrievals(), 1);
    }

    #[tokio::test]
    async fn test_local_store_missing_object() {
        let mirror = tempdir().unwrap();
        let out = tempdir().unwrap();
        let store = LocalObjectStore::new(mirror.path());

        let result = store
            .download(vec![request(
                "states",
                "missing.tfstate",
                out.path().join("missing.tfstate"),
            )])
            .await;

        match result {
            Err(IndexError::Fetch { bucket, key, .. }) => {
                assert_eq!(bucket, "states");
                assert_eq!(key.as_deref(), Some("missing.tfstate"));
            }
            other => panic!("Expected Fetch error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_shares_counter() {
        let mirror = tempdir().unwrap();
        let store = LocalObjectStore::new(mirror.path());
        let backend = S3Backend::new("states", ["a.tfstate"]);

        let connected = store.connect(&backend).await.unwrap();
        let _ = connected.download(Vec::new()).await;
        assert_eq!(store.retrievals(), 0);

        let out = tempdir().unwrap();
        let _ = connected
            .download(vec![request("states", "a.tfstate", out.path().join("a"))])
            .await;
        assert_eq!(store.retrievals(), 1);
    }

    #[test]
    fn test_object_path_ignores_leading_slash() {
        let store = LocalObjectStore::new("/mirror");
        assert_eq!(
            store.object_path("states", "/env/app.tfstate"),
            PathBuf::from("/mirror/states/env/app.tfstate")
        );
    }
}
