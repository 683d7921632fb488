//! Manifest specification types for the reconciliation engine.
//!
//! This module defines all the structs that map to the `trellis.yaml` file.
//! A manifest declares the desired topology: resources with free-form
//! attribute maps whose string values may embed `${type.name.attribute}`
//! references to other declared resources.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute map for a resource: free-form keys to JSON-shaped values.
///
/// A `BTreeMap` keeps iteration ordered by key, which keeps hashing and
/// serialization deterministic.
pub type AttrMap = BTreeMap<String, serde_json::Value>;

/// The root manifest structure for a trellis topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Adapter provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Run tuning knobs.
    #[serde(default)]
    pub run: RunConfig,
    /// Declared resources.
    pub resources: Vec<ResourceDecl>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory path (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Adapter provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Adapter driver (memory or http).
    #[serde(default)]
    pub driver: ProviderDriver,
    /// Base URL of the HTTP endpoint (required for the http driver).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token for the http driver.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Adapter driver types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderDriver {
    /// In-process adapter backed by memory; useful for local dry runs.
    #[default]
    Memory,
    /// Generic JSON CRUD adapter over HTTP.
    Http,
}

/// Run tuning knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunConfig {
    /// Maximum number of operations in flight at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Maximum convergence attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    /// Resource type (e.g., "gateway", "segment", "vm").
    #[serde(rename = "type")]
    pub kind: String,
    /// Unique name for the resource within its type.
    pub name: String,
    /// Declared attributes. String values may embed references.
    #[serde(default)]
    pub attributes: AttrMap,
    /// Explicit dependencies as `type.name` identities, merged with the
    /// dependencies implied by references.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Resource identity: the `(type, name)` pair a resource is known by, in
/// declarations, in the dependency graph, and in the state store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    /// Resource type.
    pub kind: String,
    /// Resource name.
    pub name: String,
}

// Default value functions

const fn default_concurrency() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_token_env() -> String {
    String::from("TRELLIS_API_TOKEN")
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            driver: ProviderDriver::default(),
            endpoint: None,
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
        }
    }
}

// Resource identity string conversion

impl TryFrom<String> for ResourceId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ResourceId> for String {
    fn from(id: ResourceId) -> Self {
        format!("{}.{}", id.kind, id.name)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

impl ResourceId {
    /// Creates a new resource identity.
    #[must_use]
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Parses an identity from a string like "segment.web".
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a `type.name` pair.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.split_once('.') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() => Ok(Self {
                kind: kind.to_string(),
                name: name.to_string(),
            }),
            _ => Err(format!(
                "Invalid resource identity: {s}. Expected format: TYPE.NAME"
            )),
        }
    }
}

impl Manifest {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}-{}", self.project.name, self.project.environment)
    }

    /// Returns the identities of all declared resources, in declaration order.
    #[must_use]
    pub fn identities(&self) -> Vec<ResourceId> {
        self.resources.iter().map(ResourceDecl::id).collect()
    }

    /// Looks up a declaration by identity.
    #[must_use]
    pub fn find(&self, id: &ResourceId) -> Option<&ResourceDecl> {
        self.resources
            .iter()
            .find(|r| r.kind == id.kind && r.name == id.name)
    }
}

impl ResourceDecl {
    /// Returns this declaration's identity.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.kind.clone(), self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_parse() {
        let id = ResourceId::parse("segment.web");
        assert!(id.is_ok());
        let id = id.unwrap();
        assert_eq!(id.kind, "segment");
        assert_eq!(id.name, "web");
    }

    #[test]
    fn test_resource_id_parse_hyphenated() {
        let id = ResourceId::parse("vm.web-0");
        assert!(id.is_ok());
        let id = id.unwrap();
        assert_eq!(id.kind, "vm");
        assert_eq!(id.name, "web-0");
    }

    #[test]
    fn test_resource_id_invalid() {
        assert!(ResourceId::parse("no-separator").is_err());
        assert!(ResourceId::parse(".name").is_err());
        assert!(ResourceId::parse("kind.").is_err());
    }

    #[test]
    fn test_resource_id_display_roundtrip() {
        let id = ResourceId::new("gateway", "edge");
        assert_eq!(id.to_string(), "gateway.edge");
        assert_eq!(ResourceId::parse(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_manifest_defaults() {
        let yaml = r"
project:
  name: edge-lab
resources:
  - type: gateway
    name: edge
";
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.project.environment, "dev");
        assert_eq!(manifest.state.backend, StateBackend::Local);
        assert_eq!(manifest.provider.driver, ProviderDriver::Memory);
        assert_eq!(manifest.run.concurrency, 4);
        assert_eq!(manifest.qualified_name(), "edge-lab-dev");
    }
}
