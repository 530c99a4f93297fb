//! Resource identifier to owning-backend index

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::state::ResourceDescriptor;

/// Maps resource identifiers to the state object that manages them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ResourceIndex {
    entries: BTreeMap<String, String>,
}

impl ResourceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the owner of an identifier, returning the owner it replaced
    pub fn insert(&mut self, id: impl Into<String>, owner: impl Into<String>) -> Option<String> {
        self.entries.insert(id.into(), owner.into())
    }

    /// Record every descriptor of one state object
    pub fn add_descriptors<'a>(
        &mut self,
        descriptors: impl IntoIterator<Item = &'a ResourceDescriptor>,
        owner: &str,
    ) {
        for descriptor in descriptors {
            self.insert(descriptor.id.clone(), owner);
        }
    }

    /// Owning state object of an identifier
    pub fn owner(&self, id: &str) -> Option<&str> {
        self.entries.get(id).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Identifiers grouped by owner
    pub fn by_owner(&self) -> BTreeMap<&str, Vec<&str>> {
        let mut grouped: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (id, owner) in self.iter() {
            grouped.entry(owner).or_default().push(id);
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A state file that was decoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadedState {
    pub path: PathBuf,
    pub remote: String,
    pub resources: usize,
}

/// A state file that contributed nothing because it could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedState {
    pub path: PathBuf,
    pub remote: String,
    pub reason: String,
}

/// Result of loading every fetched state file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub index: ResourceIndex,
    pub loaded: Vec<LoadedState>,
    pub skipped: Vec<SkippedState>,
}

impl LoadReport {
    /// Whether every state file was decoded
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}
