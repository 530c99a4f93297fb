//! Terraform state documents and managed-resource extraction
//!
//! Both on-disk JSON layouts are normalised to the same shape before extraction:
//! modules contain resources, resources contain instances, and an instance may
//! carry a `current` generation whose attributes are an embedded JSON object.
//!
//! - Version 4 stores a flat `resources` list; each resource names its module
//!   and each instance object is either current or `deposed`.
//! - Version 3 stores `modules`, each with a `resources` map keyed by
//!   `[data.]type.name[.index]` and a `primary` generation. The legacy
//!   versions 1 and 2 are read the same way.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Map, Value};

use crate::config::DecodeOptions;
use crate::error::{IndexError, IndexResult};

/// Resource types kept even though they have no `arn` attribute
pub const DEFAULT_ARNLESS_TYPES: &[&str] =
    &["aws_iam_access_key", "aws_route53_record", "aws_route53_zone"];

/// Address of the root module
pub const ROOT_MODULE: &str = "root";

/// Whether a resource is managed or read from a data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceMode {
    Managed,
    Data,
}

/// A parsed state document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateDocument {
    /// State file format version
    pub version: u64,
    pub serial: u64,
    pub lineage: String,
    pub modules: Vec<ModuleState>,
}

/// Resources of one module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleState {
    /// Module address (`root`, `module.network`, ...)
    pub path: String,
    pub resources: Vec<ResourceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEntry {
    pub mode: ResourceMode,
    pub resource_type: String,
    pub name: String,
    pub instances: Vec<InstanceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceEntry {
    /// `count` index or `for_each` key, rendered as in an address
    pub index_key: Option<String>,
    /// Live generation; `None` when only deposed objects remain
    pub current: Option<InstanceObject>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceObject {
    /// Attributes as a JSON object encoded in a string
    pub attrs_json: String,
}

/// Identifier and ARN of one managed resource instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDescriptor {
    pub id: String,
    /// `None` for allow-listed types without an `arn` attribute
    pub arn: Option<String>,
    pub resource_type: String,
    /// Full address, e.g. `module.app.aws_instance.web[0]`
    pub address: String,
}

/// Set of resource types retained without an `arn` attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArnlessTypes {
    types: HashSet<String>,
}

impl ArnlessTypes {
    /// An empty allow-list
    pub fn empty() -> Self {
        Self {
            types: HashSet::new(),
        }
    }

    pub fn insert(&mut self, resource_type: impl Into<String>) -> bool {
        self.types.insert(resource_type.into())
    }

    pub fn contains(&self, resource_type: &str) -> bool {
        self.types.contains(resource_type)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

impl Default for ArnlessTypes {
    fn default() -> Self {
        DEFAULT_ARNLESS_TYPES.iter().copied().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for ArnlessTypes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            types: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl StateDocument {
    /// Parse a state document in either supported layout
    pub fn from_slice(bytes: &[u8]) -> IndexResult<Self> {
        let probe: VersionProbe = serde_json::from_slice(bytes)
            .map_err(|e| IndexError::decode(e.to_string()))?;

        match probe.version {
            4 => {
                let state: StateV4 = serde_json::from_slice(bytes)
                    .map_err(|e| IndexError::decode(e.to_string()))?;
                state.normalize()
            }
            // 1 and 2 share the modules layout of 3
            1..=3 => {
                let state: StateV3 = serde_json::from_slice(bytes)
                    .map_err(|e| IndexError::decode(e.to_string()))?;
                state.normalize()
            }
            other => Err(IndexError::UnsupportedVersion(other)),
        }
    }

    /// Read a state document from a stream
    pub fn from_reader<R: Read>(mut reader: R) -> IndexResult<Self> {
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| IndexError::decode(format!("Failed to read state: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Total number of instances that have a current generation
    pub fn live_instances(&self) -> usize {
        self.modules
            .iter()
            .flat_map(|m| &m.resources)
            .flat_map(|r| &r.instances)
            .filter(|i| i.current.is_some())
            .count()
    }
}

/// Extracts resource descriptors from state documents
#[derive(Debug, Clone, Default)]
pub struct StateDecoder {
    arnless: ArnlessTypes,
    include_data_sources: bool,
}

impl StateDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a decoder from configuration; configured types extend the defaults
    pub fn from_options(options: &DecodeOptions) -> Self {
        let mut arnless = ArnlessTypes::default();
        for resource_type in &options.arnless_types {
            arnless.insert(resource_type.clone());
        }
        Self {
            arnless,
            include_data_sources: options.include_data_sources,
        }
    }

    pub fn with_arnless_types(mut self, arnless: ArnlessTypes) -> Self {
        self.arnless = arnless;
        self
    }

    pub fn with_data_sources(mut self, include: bool) -> Self {
        self.include_data_sources = include;
        self
    }

    pub fn arnless_types(&self) -> &ArnlessTypes {
        &self.arnless
    }

    /// Decode a state file on disk
    pub fn decode_file(&self, path: &Path) -> IndexResult<Vec<ResourceDescriptor>> {
        let file = std::fs::File::open(path)
            .map_err(|e| IndexError::decode(format!("Failed to open {}: {}", path.display(), e)))?;
        self.decode_reader(std::io::BufReader::new(file))
    }

    pub fn decode_reader<R: Read>(&self, reader: R) -> IndexResult<Vec<ResourceDescriptor>> {
        self.extract(&StateDocument::from_reader(reader)?)
    }

    pub fn decode_slice(&self, bytes: &[u8]) -> IndexResult<Vec<ResourceDescriptor>> {
        self.extract(&StateDocument::from_slice(bytes)?)
    }

    /// Extract one descriptor per retained live instance
    ///
    /// A malformed attribute blob, or an instance without a string `id`, fails
    /// the whole document.
    pub fn extract(&self, document: &StateDocument) -> IndexResult<Vec<ResourceDescriptor>> {
        let mut output = Vec::new();

        for module in &document.modules {
            for resource in &module.resources {
                if resource.mode == ResourceMode::Data && !self.include_data_sources {
                    continue;
                }

                for instance in &resource.instances {
                    let Some(current) = &instance.current else {
                        continue;
                    };

                    let address = resource_address(&module.path, resource, instance);
                    let attributes: Map<String, Value> =
                        serde_json::from_str(&current.attrs_json).map_err(|e| {
                            IndexError::InvalidAttributes {
                                address: address.clone(),
                                message: e.to_string(),
                            }
                        })?;

                    let id = match string_attribute(&attributes, "id", &address)? {
                        Some(id) => id,
                        None => {
                            return Err(IndexError::MissingAttribute {
                                address,
                                attribute: "id",
                            });
                        }
                    };

                    let arn = string_attribute(&attributes, "arn", &address)?;
                    if arn.is_none() && !self.arnless.contains(&resource.resource_type) {
                        continue;
                    }

                    output.push(ResourceDescriptor {
                        id,
                        arn,
                        resource_type: resource.resource_type.clone(),
                        address,
                    });
                }
            }
        }

        Ok(output)
    }
}

/// Read an optional string attribute; absent and null are both `None`
fn string_attribute(
    attributes: &Map<String, Value>,
    attribute: &'static str,
    address: &str,
) -> IndexResult<Option<String>> {
    match attributes.get(attribute) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(IndexError::InvalidAttribute {
            address: address.to_string(),
            attribute,
            found: json_type_name(other),
        }),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn resource_address(module: &str, resource: &ResourceEntry, instance: &InstanceEntry) -> String {
    let mut address = String::new();
    if module != ROOT_MODULE {
        address.push_str(module);
        address.push('.');
    }
    if resource.mode == ResourceMode::Data {
        address.push_str("data.");
    }
    address.push_str(&resource.resource_type);
    address.push('.');
    address.push_str(&resource.name);
    if let Some(key) = &instance.index_key {
        address.push('[');
        address.push_str(key);
        address.push(']');
    }
    address
}

/// Collects resources into modules, keeping first-seen order
#[derive(Default)]
struct ModuleBuilder {
    modules: Vec<ModuleState>,
    positions: HashMap<String, usize>,
}

impl ModuleBuilder {
    fn push(&mut self, path: String, resource: ResourceEntry) {
        let position = match self.positions.get(&path) {
            Some(&position) => position,
            None => {
                self.modules.push(ModuleState {
                    path: path.clone(),
                    resources: Vec::new(),
                });
                self.positions.insert(path, self.modules.len() - 1);
                self.modules.len() - 1
            }
        };
        self.modules[position].resources.push(resource);
    }

    fn finish(self) -> Vec<ModuleState> {
        self.modules
    }
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u64,
}

// Version 4 layout

#[derive(Deserialize)]
struct StateV4 {
    version: u64,
    #[serde(default)]
    serial: u64,
    #[serde(default)]
    lineage: String,
    #[serde(default)]
    resources: Vec<ResourceV4>,
}

#[derive(Deserialize)]
struct ResourceV4 {
    #[serde(default)]
    module: Option<String>,
    #[serde(default = "managed_mode")]
    mode: ResourceMode,
    #[serde(rename = "type")]
    resource_type: String,
    name: String,
    #[serde(default)]
    instances: Vec<InstanceV4>,
}

fn managed_mode() -> ResourceMode {
    ResourceMode::Managed
}

#[derive(Deserialize)]
struct InstanceV4 {
    #[serde(default)]
    index_key: Option<Value>,
    #[serde(default)]
    deposed: Option<String>,
    #[serde(default)]
    attributes: Option<Box<RawValue>>,
    #[serde(default)]
    attributes_flat: Option<BTreeMap<String, String>>,
}

impl InstanceV4 {
    fn attrs_json(&self) -> IndexResult<String> {
        if let Some(raw) = &self.attributes {
            return Ok(raw.get().to_string());
        }
        match &self.attributes_flat {
            Some(flat) => {
                serde_json::to_string(flat).map_err(|e| IndexError::decode(e.to_string()))
            }
            None => Ok("{}".to_string()),
        }
    }
}

fn render_index_key(key: &Value) -> String {
    match key {
        Value::String(s) => format!("{:?}", s),
        other => other.to_string(),
    }
}

impl StateV4 {
    fn normalize(self) -> IndexResult<StateDocument> {
        let mut modules = ModuleBuilder::default();

        for resource in self.resources {
            let mut instances: Vec<InstanceEntry> = Vec::new();

            for object in &resource.instances {
                let index_key = object.index_key.as_ref().map(render_index_key);
                let position = match instances.iter().position(|i| i.index_key == index_key) {
                    Some(position) => position,
                    None => {
                        instances.push(InstanceEntry {
                            index_key,
                            current: None,
                        });
                        instances.len() - 1
                    }
                };

                if object.deposed.is_none() {
                    instances[position].current = Some(InstanceObject {
                        attrs_json: object.attrs_json()?,
                    });
                }
            }

            let path = resource
                .module
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| ROOT_MODULE.to_string());
            modules.push(
                path,
                ResourceEntry {
                    mode: resource.mode,
                    resource_type: resource.resource_type,
                    name: resource.name,
                    instances,
                },
            );
        }

        Ok(StateDocument {
            version: self.version,
            serial: self.serial,
            lineage: self.lineage,
            modules: modules.finish(),
        })
    }
}

// Version 3 layout

#[derive(Deserialize)]
struct StateV3 {
    version: u64,
    #[serde(default)]
    serial: u64,
    #[serde(default)]
    lineage: String,
    #[serde(default)]
    modules: Vec<ModuleV3>,
}

#[derive(Deserialize)]
struct ModuleV3 {
    #[serde(default)]
    path: Vec<String>,
    #[serde(default)]
    resources: BTreeMap<String, ResourceV3>,
}

#[derive(Deserialize)]
struct ResourceV3 {
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    primary: Option<PrimaryV3>,
}

#[derive(Deserialize)]
struct PrimaryV3 {
    id: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
}

/// Module address from a v3 path such as `["root", "network"]`
fn module_address_v3(path: &[String]) -> String {
    let children: Vec<&str> = path
        .iter()
        .skip_while(|p| p.as_str() == ROOT_MODULE)
        .map(String::as_str)
        .collect();
    if children.is_empty() {
        ROOT_MODULE.to_string()
    } else {
        children
            .iter()
            .map(|c| format!("module.{}", c))
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Split a v3 resource key into mode, name and index
fn parse_key_v3(key: &str) -> IndexResult<(ResourceMode, String, Option<String>)> {
    let (mode, rest) = match key.strip_prefix("data.") {
        Some(rest) => (ResourceMode::Data, rest),
        None => (ResourceMode::Managed, key),
    };

    let parts: Vec<&str> = rest.split('.').collect();
    match parts.as_slice() {
        [_, name] => Ok((mode, name.to_string(), None)),
        [_, name, index] => Ok((mode, name.to_string(), Some(index.to_string()))),
        _ => Err(IndexError::decode(format!("Invalid resource key: {}", key))),
    }
}

impl StateV3 {
    fn normalize(self) -> IndexResult<StateDocument> {
        let mut modules = ModuleBuilder::default();

        for module in self.modules {
            let path = module_address_v3(&module.path);
            let mut entries: Vec<ResourceEntry> = Vec::new();

            for (key, resource) in module.resources {
                let (mode, name, index_key) = parse_key_v3(&key)?;

                let current = match resource.primary {
                    Some(primary) => {
                        let mut attributes = primary.attributes;
                        attributes.entry("id".to_string()).or_insert(primary.id);
                        let attrs_json = serde_json::to_string(&attributes)
                            .map_err(|e| IndexError::decode(e.to_string()))?;
                        Some(InstanceObject { attrs_json })
                    }
                    None => None,
                };
                let instance = InstanceEntry { index_key, current };

                match entries.iter_mut().find(|e| {
                    e.mode == mode && e.resource_type == resource.resource_type && e.name == name
                }) {
                    Some(entry) => entry.instances.push(instance),
                    None => entries.push(ResourceEntry {
                        mode,
                        resource_type: resource.resource_type,
                        name,
                        instances: vec![instance],
                    }),
                }
            }

            for entry in entries {
                modules.push(path.clone(), entry);
            }
        }

        Ok(StateDocument {
            version: self.version,
            serial: self.serial,
            lineage: self.lineage,
            modules: modules.finish(),
        })
    }
}
