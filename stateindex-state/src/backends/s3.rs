//! S3 object store

use std::sync::Arc;

use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use log::debug;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

use crate::config::{DEFAULT_CONCURRENCY, S3Backend};
use crate::error::{IndexError, IndexResult};
use crate::store::{DownloadRequest, ObjectStore, StoreConnector};

/// S3-based object store for one backend
pub struct S3ObjectStore {
    /// S3 client
    client: Client,
    /// Maximum number of objects in flight
    concurrency: usize,
}

impl S3ObjectStore {
    /// Create a store for a backend, assuming its role when one is configured
    pub async fn connect(backend: &S3Backend) -> Self {
        let config = load_sdk_config(backend).await;
        Self::with_client(Client::new(&config))
    }

    /// Create with a specific client (for testing)
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn download(&self, requests: Vec<DownloadRequest>) -> IndexResult<()> {
        // One batch belongs to one backend
        let bucket = match requests.first() {
            Some(request) => request.bucket.clone(),
            None => return Ok(()),
        };
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for request in requests {
            let client = self.client.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|e| {
                    IndexError::fetch(&request.bucket, Some(request.key.as_str()), e.to_string())
                })?;
                download_object(&client, request).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let result = joined.map_err(|e| task_failed(&bucket, e));
            if let Err(err) = result.and_then(|r| r) {
                tasks.abort_all();
                return Err(err);
            }
        }

        Ok(())
    }
}

fn task_failed(bucket: &str, err: JoinError) -> IndexError {
    IndexError::fetch(bucket, None, format!("download task failed: {}", err))
}

async fn download_object(client: &Client, request: DownloadRequest) -> IndexResult<()> {
    let DownloadRequest {
        bucket,
        key,
        destination,
        file,
    } = request;

    let output = client
        .get_object()
        .bucket(&bucket)
        .key(&key)
        .send()
        .await
        .map_err(|e| {
            IndexError::fetch(
                &bucket,
                Some(key.as_str()),
                DisplayErrorContext(&e).to_string(),
            )
        })?;

    let body = output
        .body
        .collect()
        .await
        .map_err(|e| IndexError::fetch(&bucket, Some(key.as_str()), e.to_string()))?;
    let bytes = body.into_bytes();

    let mut file = tokio::fs::File::from_std(file);
    file.write_all(&bytes).await.map_err(|e| {
        IndexError::fetch(
            &bucket,
            Some(key.as_str()),
            format!("Failed to write {}: {}", destination.display(), e),
        )
    })?;
    file.flush().await.map_err(|e| {
        IndexError::fetch(
            &bucket,
            Some(key.as_str()),
            format!("Failed to flush {}: {}", destination.display(), e),
        )
    })?;

    debug!(
        "Downloaded s3://{}/{} ({} bytes) to {}",
        bucket,
        key,
        bytes.len(),
        destination.display()
    );
    Ok(())
}

/// Load the SDK configuration for a backend
async fn load_sdk_config(backend: &S3Backend) -> SdkConfig {
    let region = backend.region().map(|r| Region::new(r.to_string()));

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region.clone() {
        loader = loader.region(region);
    }
    let base = loader.load().await;

    let Some(role_arn) = backend.role_arn() else {
        return base;
    };

    debug!(
        "Assuming {} (session {}) for bucket {}",
        role_arn,
        backend.session_name(),
        backend.bucket
    );

    let mut builder = AssumeRoleProvider::builder(role_arn)
        .session_name(backend.session_name())
        .configure(&base);
    if let Some(external_id) = backend.external_id() {
        builder = builder.external_id(external_id);
    }
    if let Some(region) = region.clone() {
        builder = builder.region(region);
    }
    let provider = builder.build().await;

    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).credentials_provider(provider);
    if let Some(region) = region {
        loader = loader.region(region);
    }
    loader.load().await
}

/// Connector that builds an [`S3ObjectStore`] per backend
#[derive(Debug, Clone)]
pub struct S3Connector {
    concurrency: usize,
}

impl S3Connector {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}

impl Default for S3Connector {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

#[async_trait]
impl StoreConnector for S3Connector {
    async fn connect(&self, backend: &S3Backend) -> IndexResult<Box<dyn ObjectStore>> {
        let store = S3ObjectStore::connect(backend)
            .await
            .with_concurrency(self.concurrency);
        Ok(Box::new(store))
    }
}
