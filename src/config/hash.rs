//! Declaration hashing for change detection.
//!
//! This module provides deterministic hashing of resource declarations to
//! detect changes between runs and enable idempotent planning. The hash is
//! taken over the declared form (reference markers included), so a plan can
//! be computed without touching the remote side.

use sha2::{Digest, Sha256};

use super::spec::{Manifest, ResourceDecl};

/// Hasher for computing declaration hashes.
#[derive(Debug, Default)]
pub struct DeclHasher;

/// Type tag bytes framing hashed values so adjacent fields cannot collide.
const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_NUMBER: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_ARRAY: u8 = 4;
const TAG_OBJECT: u8 = 5;

impl DeclHasher {
    /// Creates a new declaration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire manifest.
    ///
    /// This hash changes when any declared resource changes.
    #[must_use]
    pub fn hash_manifest(&self, manifest: &Manifest) -> String {
        let mut hasher = Sha256::new();

        // Hash project info
        hasher.update(manifest.project.name.as_bytes());
        hasher.update(manifest.project.environment.as_bytes());

        // Hash each resource (sorted by identity for determinism)
        let mut resources: Vec<_> = manifest.resources.iter().collect();
        resources.sort_by(|a, b| (&a.kind, &a.name).cmp(&(&b.kind, &b.name)));
        for resource in resources {
            hasher.update(self.hash_decl(resource).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource declaration.
    ///
    /// This hash is stored on the state record at apply time and compared
    /// against the declared form on later runs.
    #[must_use]
    pub fn hash_decl(&self, resource: &ResourceDecl) -> String {
        let mut hasher = Sha256::new();

        // Resource identity
        hasher.update(resource.kind.as_bytes());
        hasher.update([b'.']);
        hasher.update(resource.name.as_bytes());

        // Attributes (BTreeMap iterates sorted by key)
        for (key, value) in &resource.attributes {
            hasher.update([TAG_STRING]);
            hasher.update(key.as_bytes());
            hash_value(&mut hasher, value);
        }

        // Explicit dependencies (sorted for determinism)
        let mut deps: Vec<_> = resource.depends_on.iter().collect();
        deps.sort_unstable();
        for dep in deps {
            hasher.update(dep.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        // Use constant-time comparison to avoid timing attacks
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

/// Feeds a JSON-shaped attribute value into the hasher.
///
/// Object keys iterate sorted (serde_json maps are BTreeMap-backed), so
/// the same logical value always hashes identically.
fn hash_value(hasher: &mut Sha256, value: &serde_json::Value) {
    match value {
        serde_json::Value::Null => {
            hasher.update([TAG_NULL]);
        }
        serde_json::Value::Bool(b) => {
            hasher.update([TAG_BOOL, u8::from(*b)]);
        }
        serde_json::Value::Number(n) => {
            hasher.update([TAG_NUMBER]);
            hasher.update(n.to_string().as_bytes());
        }
        serde_json::Value::String(s) => {
            hasher.update([TAG_STRING]);
            hasher.update(s.as_bytes());
        }
        serde_json::Value::Array(items) => {
            hasher.update([TAG_ARRAY]);
            for item in items {
                hash_value(hasher, item);
            }
        }
        serde_json::Value::Object(map) => {
            hasher.update([TAG_OBJECT]);
            for (key, item) in map {
                hasher.update(key.as_bytes());
                hash_value(hasher, item);
            }
        }
    }
}
