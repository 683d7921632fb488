//! Diff engine for comparing the declared topology against remembered state.
//!
//! The comparison is purely local: each declaration is hashed and checked
//! against the hash stored on its state record at the last successful apply.
//! No adapter calls happen here, which keeps `plan` cheap and safe to run
//! anywhere.

use tracing::debug;

use crate::config::{DeclHasher, Manifest, ResourceDecl, ResourceId};
use crate::state::{EngineState, ResourceRecord};

/// Engine for computing diffs between declared and remembered resources.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Declaration hasher.
    hasher: DeclHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    /// Resource identity.
    pub id: ResourceId,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Details about the difference.
    pub details: Vec<DiffDetail>,
    /// Hash remembered from the last apply (if any).
    pub old_hash: Option<String>,
    /// Hash of the current declaration (if still declared).
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffType {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated.
    Update,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoChange,
}

/// Detail about a specific difference.
#[derive(Debug, Clone)]
pub struct DiffDetail {
    /// Attribute that differs.
    pub field: String,
    /// Remembered value.
    pub old_value: Option<String>,
    /// Declared value.
    pub new_value: Option<String>,
}

/// Complete diff result.
#[derive(Debug)]
pub struct DiffResult {
    /// All resource diffs.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: DeclHasher::new(),
        }
    }

    /// Computes the diff between a manifest and remembered state.
    ///
    /// With no state at all, every declaration diffs as a create. Records
    /// whose identity no longer appears in the manifest diff as deletes.
    #[must_use]
    pub fn compute_diff(&self, manifest: &Manifest, state: Option<&EngineState>) -> DiffResult {
        let mut diffs = Vec::new();

        // Check each declared resource against its record
        for decl in &manifest.resources {
            let id = decl.id();
            let new_hash = self.hasher.hash_decl(decl);
            let record = state.and_then(|s| s.get_record(&id));

            diffs.push(Self::diff_resource(decl, id, record, &new_hash));
        }

        // Records with no surviving declaration are deletes
        if let Some(state) = state {
            for record in state.records.values() {
                let still_declared = manifest
                    .resources
                    .iter()
                    .any(|decl| decl.kind == record.id.kind && decl.name == record.id.name);

                if !still_declared {
                    debug!("Resource removed from manifest: {}", record.id);
                    diffs.push(ResourceDiff {
                        id: record.id.clone(),
                        diff_type: DiffType::Delete,
                        details: vec![DiffDetail {
                            field: String::from("resource"),
                            old_value: Some(record.id.to_string()),
                            new_value: None,
                        }],
                        old_hash: Some(record.decl_hash.clone()),
                        new_hash: None,
                    });
                }
            }
        }

        // Compute summary
        let creates = diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Create)
            .count();
        let updates = diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Update)
            .count();
        let deletes = diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::Delete)
            .count();
        let unchanged = diffs
            .iter()
            .filter(|d| d.diff_type == DiffType::NoChange)
            .count();

        DiffResult {
            diffs,
            creates,
            updates,
            deletes,
            unchanged,
        }
    }

    /// Computes the diff for a single declared resource.
    fn diff_resource(
        decl: &ResourceDecl,
        id: ResourceId,
        record: Option<&ResourceRecord>,
        new_hash: &str,
    ) -> ResourceDiff {
        match record {
            // No record - create
            None => {
                debug!("Resource {id} needs to be created");
                ResourceDiff {
                    diff_type: DiffType::Create,
                    details: vec![DiffDetail {
                        field: String::from("resource"),
                        old_value: None,
                        new_value: Some(id.to_string()),
                    }],
                    id,
                    old_hash: None,
                    new_hash: Some(new_hash.to_string()),
                }
            }

            // Record exists and the declaration hash matches
            Some(r) if DeclHasher::hashes_match(&r.decl_hash, new_hash) => {
                debug!("Resource {id} is up to date");
                ResourceDiff {
                    diff_type: DiffType::NoChange,
                    details: vec![],
                    id,
                    old_hash: Some(r.decl_hash.clone()),
                    new_hash: Some(new_hash.to_string()),
                }
            }

            // Declaration changed since the last apply
            Some(r) => {
                debug!("Resource {id} needs update");
                ResourceDiff {
                    diff_type: DiffType::Update,
                    details: Self::attribute_details(decl, r),
                    id,
                    old_hash: Some(r.decl_hash.clone()),
                    new_hash: Some(new_hash.to_string()),
                }
            }
        }
    }

    /// Computes attribute-level differences for an update.
    ///
    /// Declared values are compared in their raw form, so a reference
    /// marker shows up as `${…}` against the resolved value it replaced.
    fn attribute_details(decl: &ResourceDecl, record: &ResourceRecord) -> Vec<DiffDetail> {
        let mut details = Vec::new();

        for (key, declared) in &decl.attributes {
            match record.attributes.get(key) {
                None => details.push(DiffDetail {
                    field: key.clone(),
                    old_value: None,
                    new_value: Some(render_value(declared)),
                }),
                Some(remembered) if remembered != declared => details.push(DiffDetail {
                    field: key.clone(),
                    old_value: Some(render_value(remembered)),
                    new_value: Some(render_value(declared)),
                }),
                Some(_) => {}
            }
        }

        details
    }
}

/// Renders an attribute value for display, without quoting plain strings.
fn render_value(value: &serde_json::Value) -> String {
    value
        .as_str()
        .map_or_else(|| value.to_string(), ToString::to_string)
}

impl DiffResult {
    /// Returns true if there are any changes.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.updates > 0 || self.deletes > 0
    }

    /// Returns the total number of changes.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    /// Filters to only diffs that require action.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoChange => "no change",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.id, self.diff_type)?;
        if !self.details.is_empty() && self.diff_type == DiffType::Update {
            write!(f, " (")?;
            for (i, detail) in self.details.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", detail.field)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}
