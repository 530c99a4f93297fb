//! Terraform remote state retrieval and resource indexing
//!
//! This crate downloads Terraform state files from S3, extracts the
//! identifiers of the resources they manage, and builds an index from
//! resource identifier to the state object that owns it.
//!
//! # Overview
//!
//! - **RegistryConfig**: the declarative list of backends, fetch options and
//!   decode options
//! - **BackendRegistry**: validates the configuration, pulls every backend and
//!   loads the fetched state files
//! - **ObjectStore / StoreConnector**: retrieval seam (S3 or a local mirror)
//! - **StateDecoder**: turns one state document into resource descriptors
//! - **ResourceIndex**: identifier to owning `arn:aws:s3:::{bucket}/{key}`
//!
//! # Example
//!
//! ```ignore
//! use stateindex_state::{BackendRegistry, create_connector};
//!
//! let mut registry = BackendRegistry::from_file(Path::new("backends.json"))?;
//! let connector = create_connector(None, 5);
//!
//! // Fetch every configured state object into the destination directory
//! registry.pull(connector.as_ref()).await?;
//!
//! // Decode them and build the index
//! let report = registry.load();
//! for skipped in &report.skipped {
//!     eprintln!("{}: {}", skipped.path.display(), skipped.reason);
//! }
//! println!("{:?}", report.index.owner("i-0123456789abcdef0"));
//! ```

pub mod backends;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod index;
pub mod registry;
pub mod state;
pub mod store;

// Re-export main types for convenience
pub use backends::{LocalObjectStore, S3Connector, S3ObjectStore, create_connector};
pub use config::{DecodeOptions, FetchOptions, RegistryConfig, S3Backend, Substitution};
pub use error::{ErrorKind, IndexError, IndexResult};
pub use fetcher::{FetchOutcome, StateFileMap, StateObject};
pub use index::{LoadReport, LoadedState, ResourceIndex, SkippedState};
pub use registry::{BackendRegistry, PullSummary};
pub use state::{ArnlessTypes, ResourceDescriptor, StateDecoder, StateDocument};
pub use store::{DownloadRequest, ObjectStore, StoreConnector};
