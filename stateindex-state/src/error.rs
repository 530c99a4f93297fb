//! Error taxonomy for state retrieval and indexing

use thiserror::Error;

/// Broad category of an [`IndexError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing configuration; never retried
    Configuration,
    /// Object retrieval or local filesystem failure while fetching
    Fetch,
    /// Malformed state document or attribute blob
    Decode,
}

/// Errors that can occur while pulling, decoding or indexing state
#[derive(Debug, Error)]
pub enum IndexError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An object could not be retrieved or written locally
    #[error("Fetch failed for {}: {message}", object_url(.bucket, .key.as_deref()))]
    Fetch {
        bucket: String,
        key: Option<String>,
        message: String,
    },

    /// The batched retrieval for a bucket did not finish in time
    #[error("Fetch from s3://{bucket} timed out after {seconds}s")]
    Timeout { bucket: String, seconds: u64 },

    /// A configured backend failed; wraps the underlying fetch error
    #[error("Backend #{position} (s3://{bucket}) failed: {source}")]
    BackendFailed {
        position: usize,
        bucket: String,
        #[source]
        source: Box<IndexError>,
    },

    /// The state envelope itself could not be parsed
    #[error("Invalid state document: {0}")]
    Decode(String),

    /// The state declares a format version this decoder does not read
    #[error("Unsupported state version: {0}")]
    UnsupportedVersion(u64),

    /// The embedded attribute blob of an instance is malformed
    #[error("Invalid attributes for {address}: {message}")]
    InvalidAttributes { address: String, message: String },

    /// A mandatory attribute is absent or null
    #[error("Missing attribute `{attribute}` on {address}")]
    MissingAttribute {
        address: String,
        attribute: &'static str,
    },

    /// An attribute exists but has the wrong JSON type
    #[error("Attribute `{attribute}` on {address} must be a string, got {found}")]
    InvalidAttribute {
        address: String,
        attribute: &'static str,
        found: &'static str,
    },
}

impl IndexError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a fetch error for a bucket and (optionally) one of its keys
    pub fn fetch(bucket: impl Into<String>, key: Option<&str>, message: impl Into<String>) -> Self {
        Self::Fetch {
            bucket: bucket.into(),
            key: key.map(str::to_string),
            message: message.into(),
        }
    }

    /// Create an envelope decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Attach the 1-based configuration position of the failing backend
    pub fn for_backend(self, position: usize, bucket: impl Into<String>) -> Self {
        Self::BackendFailed {
            position,
            bucket: bucket.into(),
            source: Box::new(self),
        }
    }

    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Fetch { .. } | Self::Timeout { .. } => ErrorKind::Fetch,
            Self::BackendFailed { source, .. } => source.kind(),
            Self::Decode(_)
            | Self::UnsupportedVersion(_)
            | Self::InvalidAttributes { .. }
            | Self::MissingAttribute { .. }
            | Self::InvalidAttribute { .. } => ErrorKind::Decode,
        }
    }
}

fn object_url(bucket: &str, key: Option<&str>) -> String {
    match key {
        Some(key) => format!("s3://{}/{}", bucket, key),
        None => format!("s3://{}", bucket),
    }
}

/// Result type for state retrieval and indexing
pub type IndexResult<T> = Result<T, IndexError>;
