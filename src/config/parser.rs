//! Manifest parser for loading and merging configuration files.
//!
//! This module handles loading the topology manifest from YAML files and
//! environment variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, TrellisError};
use std::path::Path;
use tracing::{debug, info};

use super::spec::{Manifest, ProviderConfig, ProviderDriver};

/// Manifest parser for loading topology declarations.
#[derive(Debug, Default)]
pub struct ManifestParser {
    /// Base path for resolving relative paths.
    base_path: Option<std::path::PathBuf>,
}

impl ManifestParser {
    /// Creates a new manifest parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a manifest from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Manifest> {
        let path = path.as_ref();
        info!("Loading manifest from: {}", path.display());

        if !path.exists() {
            return Err(TrellisError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TrellisError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a manifest from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<Manifest> {
        debug!("Parsing YAML manifest");

        let manifest: Manifest = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            TrellisError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Successfully parsed manifest for project: {} ({} resources)",
            manifest.project.name,
            manifest.resources.len()
        );
        Ok(manifest)
    }

    /// Loads a manifest with environment variable overrides.
    ///
    /// Environment variables are checked in the format:
    /// `TRELLIS_<SECTION>_<KEY>` (e.g., `TRELLIS_PROJECT_NAME`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<Manifest> {
        let mut manifest = self.load_file(path)?;

        // Apply environment overrides
        Self::apply_env_overrides(&mut manifest);

        Ok(manifest)
    }

    /// Applies environment variable overrides to the manifest.
    fn apply_env_overrides(manifest: &mut Manifest) {
        // Project overrides
        if let Ok(name) = std::env::var("TRELLIS_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            manifest.project.name = name;
        }

        if let Ok(env) = std::env::var("TRELLIS_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            manifest.project.environment = env;
        }

        // State overrides
        if let Ok(bucket) = std::env::var("TRELLIS_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            manifest.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("TRELLIS_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            manifest.state.prefix = Some(prefix);
        }

        // Provider overrides
        if let Ok(endpoint) = std::env::var("TRELLIS_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            manifest.provider.endpoint = Some(endpoint);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| std::path::PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                TrellisError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Validates that the environment carries what the provider needs.
    ///
    /// # Errors
    ///
    /// Returns an error if the http driver's token variable is missing.
    pub fn validate_required_env(provider: &ProviderConfig) -> Result<()> {
        if provider.driver == ProviderDriver::Http && std::env::var(&provider.token_env).is_err() {
            return Err(TrellisError::Config(ConfigError::MissingEnvVar {
                name: provider.token_env.clone(),
            }));
        }

        Ok(())
    }

    /// Gets the adapter bearer token from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the token variable is not set.
    pub fn provider_token(provider: &ProviderConfig) -> Result<String> {
        std::env::var(&provider.token_env).map_err(|_| {
            TrellisError::Config(ConfigError::MissingEnvVar {
                name: provider.token_env.clone(),
            })
        })
    }
}

/// Default manifest file names to search for.
pub const DEFAULT_MANIFEST_FILES: &[&str] = &[
    "trellis.yaml",
    "trellis.yml",
    "topology.yaml",
    "topology.yml",
];

/// Finds the manifest file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no manifest file is found.
pub fn find_manifest_file(start_dir: impl AsRef<Path>) -> Result<std::path::PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_MANIFEST_FILES {
            let manifest_path = current.join(filename);
            if manifest_path.exists() {
                info!("Found manifest file: {}", manifest_path.display());
                return Ok(manifest_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(TrellisError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_MANIFEST_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_manifest() {
        let yaml = r"
project:
  name: test-project
resources: []
";
        let parser = ManifestParser::new();
        let result = parser.parse_yaml(yaml, None);
        assert!(result.is_ok());

        let manifest = result.unwrap();
        assert_eq!(manifest.project.name, "test-project");
        assert_eq!(manifest.project.environment, "dev");
        assert!(manifest.resources.is_empty());
    }

    #[test]
    fn test_parse_full_manifest() {
        let yaml = r#"
project:
  name: edge-lab
  environment: prod

state:
  backend: s3
  bucket: edge-lab-state
  prefix: edge-lab/prod

provider:
  driver: http
  endpoint: https://topology-ctrl.internal:8443
  timeout_secs: 60

run:
  concurrency: 8

resources:
  - type: gateway
    name: edge
    attributes:
      display_name: edge-gw
      ha_mode: ACTIVE_STANDBY

  - type: segment
    name: web
    attributes:
      gateway_path: ${gateway.edge.path}
      cidr: 10.20.10.0/24

  - type: vm
    name: web-0
    attributes:
      segment_id: ${segment.web.id}
      image: ubuntu-22.04
    depends_on:
      - gateway.edge
"#;
        let parser = ManifestParser::new();
        let result = parser.parse_yaml(yaml, None);
        assert!(result.is_ok());

        let manifest = result.unwrap();
        assert_eq!(manifest.project.name, "edge-lab");
        assert_eq!(manifest.resources.len(), 3);
        assert_eq!(manifest.resources[1].kind, "segment");
        assert_eq!(manifest.resources[2].depends_on, vec!["gateway.edge"]);
        assert_eq!(manifest.run.concurrency, 8);
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let parser = ManifestParser::new();
        let result = parser.parse_yaml("not: [valid", None);
        assert!(result.is_err());
    }
}
