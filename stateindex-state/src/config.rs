//! Declarative configuration for remote state backends

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IndexResult};

/// Default number of objects downloaded concurrently within one batch
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default STS session name when assuming a cross-account role
pub const DEFAULT_SESSION_NAME: &str = "stateindex";

/// A literal find-and-replace rule applied to object keys
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substitution {
    pub old: String,
    pub new: String,
}

impl Substitution {
    pub fn new(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }
}

/// Options controlling how objects are mapped and fetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Applied to every key in order before deriving its local path
    #[serde(default)]
    pub path_substitutions: Vec<Substitution>,
    /// Re-fetch objects whose destination file already exists
    #[serde(default)]
    pub overwrite: bool,
    /// Deadline for one backend's batched retrieval
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Upper bound on in-flight downloads within one batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            path_substitutions: Vec::new(),
            overwrite: false,
            timeout_secs: None,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl FetchOptions {
    /// Apply every substitution in order; each one replaces all literal occurrences
    pub fn rewrite_key(&self, key: &str) -> String {
        self.path_substitutions
            .iter()
            .fold(key.to_string(), |acc, rule| {
                if rule.old.is_empty() {
                    acc
                } else {
                    acc.replace(&rule.old, &rule.new)
                }
            })
    }
}

/// Options for the state decoder
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// Extra resource types kept even when they carry no `arn` attribute
    #[serde(default)]
    pub arnless_types: Vec<String>,
    /// Also index `data` mode resources
    #[serde(default)]
    pub include_data_sources: bool,
}

/// One S3 bucket holding Terraform state objects
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Backend {
    pub bucket: String,
    pub keys: Vec<String>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub role_arn: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub session_name: Option<String>,
}

impl S3Backend {
    pub fn new<I, K>(bucket: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            bucket: bucket.into(),
            keys: keys.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Canonical reference of an object in this bucket
    pub fn object_arn(&self, key: &str) -> String {
        format!("arn:aws:s3:::{}/{}", self.bucket, key)
    }

    /// Region, if one is configured
    pub fn region(&self) -> Option<&str> {
        non_empty(&self.region)
    }

    /// Role to assume, if one is configured
    pub fn role_arn(&self) -> Option<&str> {
        self.role_arn.as_deref().and_then(non_empty)
    }

    pub fn external_id(&self) -> Option<&str> {
        self.external_id.as_deref().and_then(non_empty)
    }

    pub fn session_name(&self) -> &str {
        self.session_name
            .as_deref()
            .and_then(non_empty)
            .unwrap_or(DEFAULT_SESSION_NAME)
    }
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() { None } else { Some(value) }
}

/// The full configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Local root directory state objects are fetched into
    #[serde(default)]
    pub destination: PathBuf,
    #[serde(default)]
    pub options: Option<FetchOptions>,
    #[serde(default)]
    pub decode: DecodeOptions,
    #[serde(default)]
    pub s3: Vec<S3Backend>,
}

impl RegistryConfig {
    /// Parse a configuration document
    pub fn from_json_str(content: &str) -> IndexResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| IndexError::configuration(format!("Failed to parse configuration: {}", e)))
    }

    /// Read and parse a configuration file
    pub fn from_file(path: &Path) -> IndexResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            IndexError::configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// Check required fields and fill in default options
    ///
    /// Missing options are not an error; they are replaced by
    /// [`FetchOptions::default`].
    pub fn validate(&mut self) -> IndexResult<()> {
        if self.destination.as_os_str().is_empty() {
            return Err(IndexError::configuration("destination field is empty"));
        }

        if self.s3.is_empty() {
            return Err(IndexError::configuration("s3 field is empty"));
        }

        for (i, backend) in self.s3.iter().enumerate() {
            if backend.bucket.is_empty() {
                return Err(IndexError::configuration(format!(
                    "s3 backend #{} has an empty bucket",
                    i + 1
                )));
            }
            if backend.keys.is_empty() {
                return Err(IndexError::configuration(format!(
                    "s3 backend #{} ({}) has no keys",
                    i + 1,
                    backend.bucket
                )));
            }
        }

        let options = self.options.get_or_insert_with(FetchOptions::default);
        if options.concurrency == 0 {
            return Err(IndexError::configuration(
                "options.concurrency must be at least 1",
            ));
        }

        Ok(())
    }

    /// Fetch options, or the defaults when none are configured
    pub fn fetch_options(&self) -> FetchOptions {
        self.options.clone().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const FULL: &str = r#"{
        "destination": "/tmp/states",
        "options": {
            "path_substitutions": [{"old": "env:/", "new": ""}],
            "overwrite": true
        },
        "s3": [
            {
                "bucket": "org-terraform",
                "keys": ["network/terraform.tfstate", "env:/prod/app.tfstate"],
                "region": "eu-west-1",
                "role_arn": "arn:aws:iam::123456789012:role/state-reader",
                "external_id": "xyz"
            }
        ]
    }"#;

    #[test]
    fn test_parse_full_document() {
        let config = RegistryConfig::from_json_str(FULL).unwrap();
        assert_eq!(config.destination, PathBuf::from("/tmp/states"));
        assert_eq!(config.s3.len(), 1);

        let backend = &config.s3[0];
        assert_eq!(backend.keys.len(), 2);
        assert_eq!(backend.region(), Some("eu-west-1"));
        assert_eq!(
            backend.role_arn(),
            Some("arn:aws:iam::123456789012:role/state-reader")
        );
        assert_eq!(backend.external_id(), Some("xyz"));
        assert_eq!(backend.session_name(), DEFAULT_SESSION_NAME);

        let options = config.options.unwrap();
        assert!(options.overwrite);
        assert_eq!(options.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(options.path_substitutions, vec![Substitution::new("env:/", "")]);
    }

    #[test]
    fn test_parse_error_is_configuration() {
        let err = RegistryConfig::from_json_str("{ not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_validate_empty_destination() {
        let mut config = RegistryConfig {
            s3: vec![S3Backend::new("bucket", ["a.tfstate"])],
            ..RegistryConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("destination"));
    }

    #[test]
    fn test_validate_empty_backends() {
        let mut config = RegistryConfig {
            destination: PathBuf::from("states"),
            ..RegistryConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("s3 field is empty"));
    }

    #[test]
    fn test_validate_backend_without_keys() {
        let mut config = RegistryConfig {
            destination: PathBuf::from("states"),
            s3: vec![
                S3Backend::new("first", ["a.tfstate"]),
                S3Backend::new("second", Vec::<String>::new()),
            ],
            ..RegistryConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: s3 backend #2 (second) has no keys"
        );
    }

    #[test]
    fn test_validate_fills_default_options() {
        let mut config = RegistryConfig {
            destination: PathBuf::from("states"),
            s3: vec![S3Backend::new("bucket", ["a.tfstate"])],
            ..RegistryConfig::default()
        };
        assert!(config.options.is_none());

        config.validate().unwrap();
        let options = config.options.unwrap();
        assert!(options.path_substitutions.is_empty());
        assert!(!options.overwrite);
    }

    #[test]
    fn test_rewrite_key_in_order() {
        let options = FetchOptions {
            path_substitutions: vec![Substitution::new("/", "_"), Substitution::new("_v2", "")],
            ..FetchOptions::default()
        };
        assert_eq!(options.rewrite_key("a/b_v2"), "a_b");
    }

    #[test]
    fn test_rewrite_key_is_literal() {
        let options = FetchOptions {
            path_substitutions: vec![Substitution::new(".*", "x"), Substitution::new("", "y")],
            ..FetchOptions::default()
        };
        assert_eq!(options.rewrite_key("a.b/.*c"), "a.b/xc");
    }

    #[test]
    fn test_object_arn() {
        let backend = S3Backend::new("org-terraform", ["network/terraform.tfstate"]);
        assert_eq!(
            backend.object_arn("network/terraform.tfstate"),
            "arn:aws:s3:::org-terraform/network/terraform.tfstate"
        );
        assert_eq!(backend.region(), None);
        assert_eq!(backend.role_arn(), None);
    }
}
