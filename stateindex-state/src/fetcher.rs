//! Per-backend object fetching
//!
//! Every configured key is rewritten, mapped to a local path under
//! `{destination}/{bucket}/`, recorded in the [`StateFileMap`], and then
//! either skipped (already present, overwrite disabled) or enqueued. All
//! enqueued keys of one backend are retrieved in a single batch.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};

use crate::config::{FetchOptions, S3Backend};
use crate::error::{IndexError, IndexResult};
use crate::store::{DownloadRequest, StoreConnector};

/// A local state file and the remote object it was fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateObject {
    pub path: PathBuf,
    /// `arn:aws:s3:::{bucket}/{key}`
    pub remote: String,
}

/// Local path to remote reference map, kept in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateFileMap {
    entries: Vec<StateObject>,
}

impl StateFileMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping
    ///
    /// An existing path is replaced and moves to the end, so it is visited
    /// after everything recorded before it.
    pub fn insert(&mut self, path: PathBuf, remote: String) -> Option<String> {
        let previous = self
            .entries
            .iter()
            .position(|e| e.path == path)
            .map(|pos| self.entries.remove(pos).remote);
        self.entries.push(StateObject { path, remote });
        previous
    }

    pub fn remote(&self, path: &Path) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.path == path)
            .map(|e| e.remote.as_str())
    }

    pub fn extend(&mut self, objects: impl IntoIterator<Item = StateObject>) {
        for object in objects {
            self.insert(object.path, object.remote);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &StateObject> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Result of fetching one backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Every configured key, in configuration order
    pub objects: Vec<StateObject>,
    /// Keys retrieved in the batch
    pub downloaded: usize,
    /// Keys skipped because their local copy already existed
    pub skipped: usize,
}

/// Local destination of a (rewritten) key
///
/// The key is split on `/`; empty and `.` segments are dropped. A `..`
/// segment or an empty file name is rejected.
pub fn local_path(destination: &Path, bucket: &str, rewritten_key: &str) -> IndexResult<PathBuf> {
    let (dir, file_name) = match rewritten_key.rfind('/') {
        Some(pos) => (&rewritten_key[..pos], &rewritten_key[pos + 1..]),
        None => ("", rewritten_key),
    };

    if file_name.is_empty() || file_name == "." || file_name == ".." {
        return Err(IndexError::fetch(
            bucket,
            Some(rewritten_key),
            "key does not name a file",
        ));
    }

    let mut path = destination.join(bucket);
    for segment in dir.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(IndexError::fetch(
                    bucket,
                    Some(rewritten_key),
                    "key escapes the bucket directory",
                ));
            }
            segment => path.push(segment),
        }
    }
    path.push(file_name);
    Ok(path)
}

/// Map every key of a backend to its local path without touching the filesystem
pub fn locate_backend(
    backend: &S3Backend,
    destination: &Path,
    options: &FetchOptions,
) -> IndexResult<Vec<StateObject>> {
    backend
        .keys
        .iter()
        .map(|key| {
            let path = local_path(destination, &backend.bucket, &options.rewrite_key(key))?;
            Ok(StateObject {
                path,
                remote: backend.object_arn(key),
            })
        })
        .collect()
}

/// Fetch every key of one backend into `destination`
///
/// Any failure removes every destination file opened for this backend, so a
/// rerun never mistakes an empty or partial file for a fetched one.
pub async fn fetch_backend(
    backend: &S3Backend,
    destination: &Path,
    options: &FetchOptions,
    connector: &dyn StoreConnector,
) -> IndexResult<FetchOutcome> {
    let mut outcome = FetchOutcome::default();
    let mut requests = Vec::new();

    for key in &backend.keys {
        match prepare_key(backend, key, destination, options, &mut outcome) {
            Ok(Some(request)) => requests.push(request),
            Ok(None) => {}
            Err(err) => {
                let opened: Vec<PathBuf> =
                    requests.iter().map(|r| r.destination.clone()).collect();
                drop(requests);
                remove_partial(&opened);
                return Err(err);
            }
        }
    }

    if requests.is_empty() {
        return Ok(outcome);
    }

    outcome.downloaded = requests.len();
    let opened: Vec<PathBuf> = requests.iter().map(|r| r.destination.clone()).collect();

    if let Err(err) = run_batch(backend, options, connector, requests).await {
        remove_partial(&opened);
        return Err(err);
    }

    Ok(outcome)
}

/// Map, record and open one key; `None` when the local copy is kept
fn prepare_key(
    backend: &S3Backend,
    key: &str,
    destination: &Path,
    options: &FetchOptions,
    outcome: &mut FetchOutcome,
) -> IndexResult<Option<DownloadRequest>> {
    let path = local_path(destination, &backend.bucket, &options.rewrite_key(key))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            IndexError::fetch(
                &backend.bucket,
                Some(key),
                format!("Failed to create {}: {}", parent.display(), e),
            )
        })?;
    }

    outcome.objects.push(StateObject {
        path: path.clone(),
        remote: backend.object_arn(key),
    });

    if path.exists() && !options.overwrite {
        debug!("Skipping s3://{}/{}: {} exists", backend.bucket, key, path.display());
        outcome.skipped += 1;
        return Ok(None);
    }

    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)
        .map_err(|e| {
            IndexError::fetch(
                &backend.bucket,
                Some(key),
                format!("Failed to open {}: {}", path.display(), e),
            )
        })?;

    debug!("Enqueued s3://{}/{} -> {}", backend.bucket, key, path.display());
    Ok(Some(DownloadRequest {
        bucket: backend.bucket.clone(),
        key: key.to_string(),
        destination: path,
        file,
    }))
}

async fn run_batch(
    backend: &S3Backend,
    options: &FetchOptions,
    connector: &dyn StoreConnector,
    requests: Vec<DownloadRequest>,
) -> IndexResult<()> {
    let store = connector.connect(backend).await?;
    let download = store.download(requests);

    match options.timeout_secs {
        Some(seconds) => tokio::time::timeout(Duration::from_secs(seconds), download)
            .await
            .map_err(|_| IndexError::Timeout {
                bucket: backend.bucket.clone(),
                seconds,
            })?,
        None => download.await,
    }
}

fn remove_partial(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::LocalObjectStore;
    use crate::config::Substitution;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    fn mirror_with(root: &Path, bucket: &str, keys: &[(&str, &str)]) -> LocalObjectStore {
        let store = LocalObjectStore::new(root);
        for (key, content) in keys {
            let path = store.object_path(bucket, key);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        store
    }

    #[test]
    fn test_local_path_layout() {
        let path = local_path(Path::new("/cache"), "states", "env/prod/app.tfstate").unwrap();
        assert_eq!(path, PathBuf::from("/cache/states/env/prod/app.tfstate"));

        let path = local_path(Path::new("/cache"), "states", "app.tfstate").unwrap();
        assert_eq!(path, PathBuf::from("/cache/states/app.tfstate"));

        let path = local_path(Path::new("/cache"), "states", "/env//./app.tfstate").unwrap();
        assert_eq!(path, PathBuf::from("/cache/states/env/app.tfstate"));
    }

    #[test]
    fn test_local_path_rejects_escapes() {
        let err = local_path(Path::new("/cache"), "states", "../other/app.tfstate").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);

        let err = local_path(Path::new("/cache"), "states", "env/").unwrap_err();
        assert!(err.to_string().contains("does not name a file"));
    }

    #[test]
    fn test_state_file_map_order_and_replace() {
        let mut map = StateFileMap::new();
        assert!(map.insert(PathBuf::from("a"), "arn:a".to_string()).is_none());
        map.insert(PathBuf::from("b"), "arn:b".to_string());
        let previous = map.insert(PathBuf::from("a"), "arn:a2".to_string());

        assert_eq!(previous.as_deref(), Some("arn:a"));
        assert_eq!(map.len(), 2);
        let paths: Vec<&Path> = map.iter().map(|o| o.path.as_path()).collect();
        assert_eq!(paths, vec![Path::new("b"), Path::new("a")]);
        assert_eq!(map.remote(Path::new("a")), Some("arn:a2"));
    }

    #[tokio::test]
    async fn test_fetch_applies_substitutions() {
        let mirror = tempdir().unwrap();
        let out = tempdir().unwrap();
        let store = mirror_with(mirror.path(), "states", &[("a/b_v2", "{}")]);

        let backend = S3Backend::new("states", ["a/b_v2"]);
        let options = FetchOptions {
            path_substitutions: vec![Substitution::new("/", "_"), Substitution::new("_v2", "")],
            ..FetchOptions::default()
        };

        let outcome = fetch_backend(&backend, out.path(), &options, &store)
            .await
            .unwrap();

        let expected = out.path().join("states").join("a_b");
        assert_eq!(
            outcome.objects,
            vec![StateObject {
                path: expected.clone(),
                remote: "arn:aws:s3:::states/a/b_v2".to_string(),
            }]
        );
        assert_eq!(outcome.downloaded, 1);
        assert_eq!(std::fs::read_to_string(expected).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_existing_files_are_skipped_but_recorded() {
        let mirror = tempdir().unwrap();
        let out = tempdir().unwrap();
        let store = mirror_with(
            mirror.path(),
            "states",
            &[("one.tfstate", "remote-1"), ("two.tfstate", "remote-2")],
        );

        let existing = out.path().join("states").join("one.tfstate");
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
        std::fs::write(&existing, "cached").unwrap();

        let backend = S3Backend::new("states", ["one.tfstate", "two.tfstate"]);
        let outcome = fetch_backend(&backend, out.path(), &FetchOptions::default(), &store)
            .await
            .unwrap();

        assert_eq!(outcome.objects.len(), 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.downloaded, 1);
        assert_eq!(store.retrievals(), 1);
        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "cached");
    }

    #[tokio::test]
    async fn test_overwrite_refetches() {
        let mirror = tempdir().unwrap();
        let out = tempdir().unwrap();
        let store = mirror_with(mirror.path(), "states", &[("one.tfstate", "fresh")]);

        let existing = out.path().join("states").join("one.tfstate");
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
        std::fs::write(&existing, "stale and longer").unwrap();

        let backend = S3Backend::new("states", ["one.tfstate"]);
        let options = FetchOptions {
            overwrite: true,
            ..FetchOptions::default()
        };
        fetch_backend(&backend, out.path(), &options, &store)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&existing).unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_failed_batch_removes_opened_files() {
        let mirror = tempdir().unwrap();
        let out = tempdir().unwrap();
        let store = mirror_with(mirror.path(), "states", &[("one.tfstate", "ok")]);

        let backend = S3Backend::new("states", ["one.tfstate", "missing.tfstate"]);
        let err = fetch_backend(&backend, out.path(), &FetchOptions::default(), &store)
            .await
            .unwrap_err();

        match err {
            IndexError::Fetch { key, .. } => assert_eq!(key.as_deref(), Some("missing.tfstate")),
            other => panic!("Expected Fetch error, got {:?}", other),
        }
        assert!(!out.path().join("states/one.tfstate").exists());
        assert!(!out.path().join("states/missing.tfstate").exists());
    }

    #[tokio::test]
    async fn test_rejected_key_removes_earlier_files() {
        let mirror = tempdir().unwrap();
        let out = tempdir().unwrap();
        let store = mirror_with(mirror.path(), "states", &[("a.tfstate", "ok")]);

        let backend = S3Backend::new("states", ["a.tfstate", "../escape.tfstate"]);
        let err = fetch_backend(&backend, out.path(), &FetchOptions::default(), &store)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert!(!out.path().join("states/a.tfstate").exists());
        assert_eq!(store.retrievals(), 0);

        let backend = S3Backend::new("states", ["a.tfstate"]);
        let outcome = fetch_backend(&backend, out.path(), &FetchOptions::default(), &store)
            .await
            .unwrap();
        assert_eq!(outcome.downloaded, 1);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(
            std::fs::read_to_string(out.path().join("states/a.tfstate")).unwrap(),
            "ok"
        );
    }

    #[tokio::test]
    async fn test_open_failure_removes_earlier_files() {
        let mirror = tempdir().unwrap();
        let out = tempdir().unwrap();
        let store = mirror_with(
            mirror.path(),
            "states",
            &[("a.tfstate", "ok"), ("b.tfstate", "ok")],
        );
        // A directory where the second file should go
        std::fs::create_dir_all(out.path().join("states/b.tfstate")).unwrap();

        let backend = S3Backend::new("states", ["a.tfstate", "b.tfstate"]);
        let options = FetchOptions {
            overwrite: true,
            ..FetchOptions::default()
        };
        let err = fetch_backend(&backend, out.path(), &options, &store)
            .await
            .unwrap_err();

        match err {
            IndexError::Fetch { key, .. } => assert_eq!(key.as_deref(), Some("b.tfstate")),
            other => panic!("Expected Fetch error, got {:?}", other),
        }
        assert!(!out.path().join("states/a.tfstate").exists());
        assert!(out.path().join("states/b.tfstate").is_dir());
        assert_eq!(store.retrievals(), 0);
    }

    struct StalledStore;

    #[async_trait::async_trait]
    impl crate::store::ObjectStore for StalledStore {
        async fn download(&self, _requests: Vec<DownloadRequest>) -> IndexResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl StoreConnector for StalledStore {
        async fn connect(
            &self,
            _backend: &S3Backend,
        ) -> IndexResult<Box<dyn crate::store::ObjectStore>> {
            Ok(Box::new(StalledStore))
        }
    }

    #[tokio::test]
    async fn test_timeout_fails_backend_and_cleans_up() {
        let out = tempdir().unwrap();
        let backend = S3Backend::new("states", ["slow.tfstate"]);
        let options = FetchOptions {
            timeout_secs: Some(0),
            ..FetchOptions::default()
        };

        let err = fetch_backend(&backend, out.path(), &options, &StalledStore)
            .await
            .unwrap_err();

        assert!(matches!(err, IndexError::Timeout { seconds: 0, .. }));
        assert_eq!(err.kind(), ErrorKind::Fetch);
        assert!(!out.path().join("states/slow.tfstate").exists());
    }

    #[test]
    fn test_locate_backend_does_not_touch_disk() {
        let out = tempdir().unwrap();
        let backend = S3Backend::new("states", ["env/app.tfstate"]);
        let objects = locate_backend(&backend, out.path(), &FetchOptions::default()).unwrap();

        assert_eq!(objects[0].path, out.path().join("states/env/app.tfstate"));
        assert!(!out.path().join("states").exists());
    }
}
