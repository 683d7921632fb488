//! Manifest validation for topology declarations.
//!
//! This module provides comprehensive validation of manifests, ensuring
//! names, reference markers, and backend settings are consistent before a
//! plan is ever built.

use crate::error::{ConfigError, Result, TrellisError};
use crate::graph::Reference;
use std::collections::HashSet;
use tracing::debug;

use super::spec::{Manifest, ProviderDriver, ResourceDecl, ResourceId, StateBackend};

/// Validator for topology manifests.
#[derive(Debug, Default)]
pub struct ManifestValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ManifestValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a topology manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self, manifest: &Manifest) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_project(&manifest.project, &mut result);
        Self::validate_state(&manifest.state, &mut result);
        Self::validate_provider(&manifest.provider, &mut result);
        Self::validate_run(&manifest.run, &mut result);
        Self::validate_resources(&manifest.resources, &mut result);

        if result.errors.is_empty() {
            debug!("Manifest validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(TrellisError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Validates project configuration.
    fn validate_project(project: &super::spec::ProjectConfig, result: &mut ValidationResult) {
        // Project name must be valid
        if project.name.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: String::from("Project name cannot be empty"),
            });
        } else if !is_valid_name(&project.name) {
            result.errors.push(ValidationError {
                field: String::from("project.name"),
                message: format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            });
        }

        // Environment must be valid
        if project.environment.is_empty() {
            result.errors.push(ValidationError {
                field: String::from("project.environment"),
                message: String::from("Environment cannot be empty"),
            });
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &super::spec::StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.is_none() || state.bucket.as_ref().is_some_and(String::is_empty) {
                    result.errors.push(ValidationError {
                        field: String::from("state.bucket"),
                        message: String::from("S3 bucket name is required when using S3 backend"),
                    });
                }
            }
            StateBackend::Local => {
                // Local backend is always valid
            }
        }
    }

    /// Validates provider configuration.
    fn validate_provider(provider: &super::spec::ProviderConfig, result: &mut ValidationResult) {
        match provider.driver {
            ProviderDriver::Http => {
                match &provider.endpoint {
                    Some(endpoint) if endpoint.is_empty() => {
                        result.errors.push(ValidationError {
                            field: String::from("provider.endpoint"),
                            message: String::from("Endpoint cannot be empty"),
                        });
                    }
                    Some(endpoint) => {
                        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                            result.errors.push(ValidationError {
                                field: String::from("provider.endpoint"),
                                message: format!(
                                    "Endpoint '{endpoint}' must start with http:// or https://"
                                ),
                            });
                        }
                    }
                    None => {
                        result.errors.push(ValidationError {
                            field: String::from("provider.endpoint"),
                            message: String::from(
                                "Endpoint is required when using the http driver",
                            ),
                        });
                    }
                }

                if provider.timeout_secs == 0 {
                    result.errors.push(ValidationError {
                        field: String::from("provider.timeout_secs"),
                        message: String::from("Timeout must be at least 1 second"),
                    });
                }
            }
            ProviderDriver::Memory => {
                if provider.endpoint.is_some() {
                    result.warnings.push(String::from(
                        "provider.endpoint: endpoint is ignored by the memory driver",
                    ));
                }
            }
        }
    }

    /// Validates run configuration.
    fn validate_run(run: &super::spec::RunConfig, result: &mut ValidationResult) {
        if run.concurrency == 0 {
            result.errors.push(ValidationError {
                field: String::from("run.concurrency"),
                message: String::from("Concurrency must be at least 1"),
            });
        }

        if run.concurrency > 32 {
            result.warnings.push(format!(
                "run.concurrency: {} parallel operations is unusual",
                run.concurrency
            ));
        }

        if run.max_attempts == 0 {
            result.errors.push(ValidationError {
                field: String::from("run.max_attempts"),
                message: String::from("Max attempts must be at least 1"),
            });
        }
    }

    /// Validates all resource declarations.
    fn validate_resources(resources: &[ResourceDecl], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources declared in manifest"));
            return;
        }

        let mut seen_identities = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");
            let identity = resource.id();

            // Validate unique identity
            if seen_identities.contains(&identity) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!("Duplicate resource declaration: {identity}"),
                });
            } else {
                seen_identities.insert(identity);
            }

            // Validate type and name format
            if !is_valid_name(&resource.kind) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.type"),
                    message: format!(
                        "Resource type '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.kind
                    ),
                });
            }

            if !is_valid_name(&resource.name) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.name"),
                    message: format!(
                        "Resource name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                        resource.name
                    ),
                });
            }

            // Validate reference markers in attributes
            Self::validate_references(resource, &prefix, result);

            // Validate explicit dependencies
            Self::validate_depends_on(resource, &prefix, result);
        }
    }

    /// Validates reference marker syntax inside a declaration's attributes.
    fn validate_references(resource: &ResourceDecl, prefix: &str, result: &mut ValidationResult) {
        for (key, value) in &resource.attributes {
            if let Err(parse_err) = Reference::scan_value(value) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.attributes.{key}"),
                    message: format!(
                        "Invalid reference '{}': {}",
                        parse_err.marker, parse_err.reason
                    ),
                });
            }
        }
    }

    /// Validates explicit `depends_on` entries.
    fn validate_depends_on(resource: &ResourceDecl, prefix: &str, result: &mut ValidationResult) {
        for (i, dep) in resource.depends_on.iter().enumerate() {
            if let Err(message) = ResourceId::parse(dep) {
                result.errors.push(ValidationError {
                    field: format!("{prefix}.depends_on[{i}]"),
                    message,
                });
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase() {
            return false;
        }

    // Rest must be lowercase alphanumeric or hyphen
    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    // Cannot end with hyphen
    if name.ends_with('-') {
        return false;
    }

    // Cannot have consecutive hyphens
    if name.contains("--") {
        return false;
    }

    true
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_from(yaml: &str) -> Manifest {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("segment"));
        assert!(is_valid_name("web-tier-2"));
        assert!(is_valid_name("a"));
        assert!(is_valid_name("nat-rule"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Web-Tier")); // uppercase
        assert!(!is_valid_name("0-segment")); // starts with number
        assert!(!is_valid_name("web_tier")); // underscore
        assert!(!is_valid_name("web-")); // ends with hyphen
        assert!(!is_valid_name("web--tier")); // consecutive hyphens
    }

    #[test]
    fn test_validate_passes() {
        let manifest = manifest_from(
            r"
project:
  name: edge-lab
resources:
  - type: gateway
    name: edge
  - type: segment
    name: web
    attributes:
      gateway_path: ${gateway.edge.path}
",
        );
        let result = ManifestValidator::new().validate(&manifest);
        assert!(result.is_ok());
        assert!(result.unwrap().is_valid());
    }

    #[test]
    fn test_duplicate_identity() {
        let manifest = manifest_from(
            r"
project:
  name: edge-lab
resources:
  - type: segment
    name: web
  - type: segment
    name: web
",
        );
        let result = ManifestValidator::new().validate(&manifest);
        assert!(result.is_err());
    }

    #[test]
    fn test_http_driver_requires_endpoint() {
        let manifest = manifest_from(
            r"
project:
  name: edge-lab
provider:
  driver: http
resources:
  - type: gateway
    name: edge
",
        );
        let result = ManifestValidator::new().validate(&manifest);
        assert!(result.is_err());
    }

    #[test]
    fn test_malformed_reference_rejected() {
        let manifest = manifest_from(
            r"
project:
  name: edge-lab
resources:
  - type: segment
    name: web
    attributes:
      gateway_path: ${gateway.edge}
",
        );
        let result = ManifestValidator::new().validate(&manifest);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let manifest = manifest_from(
            r"
project:
  name: edge-lab
run:
  concurrency: 0
resources: []
",
        );
        let result = ManifestValidator::new().validate(&manifest);
        assert!(result.is_err());
    }
}
