//! Object store implementations

mod local;
mod s3;

pub use local::LocalObjectStore;
pub use s3::{S3Connector, S3ObjectStore};

use std::path::Path;

use crate::store::StoreConnector;

/// Create a connector for the configured backends
///
/// With a mirror directory, objects are served from `{mirror}/{bucket}/{key}`;
/// otherwise they are retrieved from S3.
pub fn create_connector(mirror: Option<&Path>, concurrency: usize) -> Box<dyn StoreConnector> {
    match mirror {
        Some(root) => Box::new(LocalObjectStore::new(root)),
        None => Box::new(S3Connector::new(concurrency)),
    }
}
