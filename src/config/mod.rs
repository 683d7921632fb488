//! Configuration module for the trellis reconciliation engine.
//!
//! This module handles all manifest-related functionality:
//! - Parsing and deserializing `trellis.yaml`
//! - Validation of declarations and reference markers
//! - Computing declaration hashes for change detection

mod spec;
mod parser;
mod validator;
mod hash;

pub use spec::{
    AttrMap, Manifest, ProjectConfig, ProviderConfig, ProviderDriver, ResourceDecl, ResourceId,
    RunConfig, StateBackend, StateConfig,
};
pub use parser::{ManifestParser, find_manifest_file};
pub use validator::{ManifestValidator, ValidationResult};
pub use hash::DeclHasher;
