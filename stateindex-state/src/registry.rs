//! Backend registry: validate, pull and load every configured backend

use std::path::Path;

use log::{info, warn};

use crate::config::{FetchOptions, RegistryConfig};
use crate::error::IndexResult;
use crate::fetcher::{self, StateFileMap};
use crate::index::{LoadReport, LoadedState, SkippedState};
use crate::state::StateDecoder;
use crate::store::StoreConnector;

/// Counts for one pull pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub backends: usize,
    pub objects: usize,
    pub downloaded: usize,
    pub skipped: usize,
}

/// Holds the configuration and the state files found by the last pull
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    config: RegistryConfig,
    state_files: StateFileMap,
}

impl BackendRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            state_files: StateFileMap::new(),
        }
    }

    /// Load the registry from a configuration file
    pub fn from_file(path: &Path) -> IndexResult<Self> {
        Ok(Self::new(RegistryConfig::from_file(path)?))
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Local to remote map built by the last pull (or locate)
    pub fn state_files(&self) -> &StateFileMap {
        &self.state_files
    }

    pub fn validate(&mut self) -> IndexResult<()> {
        self.config.validate()
    }

    fn options(&self) -> FetchOptions {
        self.config.fetch_options()
    }

    /// Fetch every backend in configuration order
    ///
    /// Validation errors are returned before anything is written. The first
    /// failing backend stops the pull; backends fetched before it stay on disk
    /// and in [`state_files`](Self::state_files).
    pub async fn pull(&mut self, connector: &dyn StoreConnector) -> IndexResult<PullSummary> {
        self.validate()?;

        let options = self.options();
        self.state_files = StateFileMap::new();
        let mut summary = PullSummary::default();

        for (i, backend) in self.config.s3.iter().enumerate() {
            let outcome =
                fetcher::fetch_backend(backend, &self.config.destination, &options, connector)
                    .await
                    .map_err(|e| e.for_backend(i + 1, &backend.bucket))?;

            info!(
                "Pulled s3://{}: {} objects, {} downloaded, {} already present",
                backend.bucket,
                outcome.objects.len(),
                outcome.downloaded,
                outcome.skipped
            );

            summary.backends += 1;
            summary.objects += outcome.objects.len();
            summary.downloaded += outcome.downloaded;
            summary.skipped += outcome.skipped;
            self.state_files.extend(outcome.objects);
        }

        Ok(summary)
    }

    /// Build the local to remote map from configuration alone, without fetching
    pub fn locate(&mut self) -> IndexResult<&StateFileMap> {
        self.validate()?;

        let options = self.options();
        let mut state_files = StateFileMap::new();
        for (i, backend) in self.config.s3.iter().enumerate() {
            let objects = fetcher::locate_backend(backend, &self.config.destination, &options)
                .map_err(|e| e.for_backend(i + 1, &backend.bucket))?;
            state_files.extend(objects);
        }

        self.state_files = state_files;
        Ok(&self.state_files)
    }

    /// Decode every known state file into a resource index
    ///
    /// A file that cannot be decoded is skipped and listed in the report;
    /// it never fails the load.
    pub fn load(&self) -> LoadReport {
        let decoder = StateDecoder::from_options(&self.config.decode);
        let mut report = LoadReport::default();

        for object in self.state_files.iter() {
            match decoder.decode_file(&object.path) {
                Ok(descriptors) => {
                    info!(
                        "Loaded {} resources from {}",
                        descriptors.len(),
                        object.path.display()
                    );
                    report.index.add_descriptors(&descriptors, &object.remote);
                    report.loaded.push(LoadedState {
                        path: object.path.clone(),
                        remote: object.remote.clone(),
                        resources: descriptors.len(),
                    });
                }
                Err(e) => {
                    warn!("Skipping {}: {}", object.path.display(), e);
                    report.skipped.push(SkippedState {
                        path: object.path.clone(),
                        remote: object.remote.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        report
    }
}
