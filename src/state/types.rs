//! State types for tracking remembered remote state.
//!
//! These types represent the last-known remote state of declared
//! resources, used by the planner to diff and by the executor to resolve
//! references against previously applied attributes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{AttrMap, ResourceId};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// The complete engine state for one project/environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied manifest.
    pub manifest_hash: String,
    /// Remembered records keyed by `type.name` identity. A `BTreeMap`
    /// keeps iteration and serialization deterministic.
    pub records: BTreeMap<String, ResourceRecord>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Remembered remote state of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    /// Resource identity.
    pub id: ResourceId,
    /// Attributes as last returned by the adapter (remote outputs).
    pub attributes: AttrMap,
    /// Hash of the declared form that produced this record.
    pub decl_hash: String,
    /// Dependencies at apply time, used to order deletes after the
    /// declaration no longer mentions this resource.
    #[serde(default)]
    pub depends_on: Vec<ResourceId>,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Manifest hash at the time of the run.
    pub manifest_hash: String,
    /// Identities touched by the run.
    pub resources: Vec<String>,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Plan application.
    Apply,
    /// Convergence loop.
    Reconcile,
    /// Destruction.
    Destroy,
}

impl EngineState {
    /// Creates a new empty engine state.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            manifest_hash: String::new(),
            records: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a record by identity.
    #[must_use]
    pub fn get_record(&self, id: &ResourceId) -> Option<&ResourceRecord> {
        self.records.get(&id.to_string())
    }

    /// Gets a mutable reference to a record by identity.
    pub fn get_record_mut(&mut self, id: &ResourceId) -> Option<&mut ResourceRecord> {
        self.records.get_mut(&id.to_string())
    }

    /// Adds or updates a record.
    pub fn set_record(&mut self, record: ResourceRecord) {
        self.records.insert(record.id.to_string(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by identity.
    pub fn remove_record(&mut self, id: &ResourceId) -> Option<ResourceRecord> {
        let result = self.records.remove(&id.to_string());
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Returns the identities of all remembered records, sorted.
    #[must_use]
    pub fn record_ids(&self) -> Vec<ResourceId> {
        self.records.values().map(|r| r.id.clone()).collect()
    }

    /// Number of remembered records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        // Keep only the last 100 entries
        const MAX_HISTORY: usize = 100;
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

impl ResourceRecord {
    /// Creates a new record for a freshly applied resource.
    #[must_use]
    pub fn new(id: ResourceId, attributes: AttrMap, decl_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            id,
            attributes,
            decl_hash: decl_hash.to_string(),
            depends_on: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the dependencies remembered for delete ordering.
    #[must_use]
    pub fn with_depends_on(mut self, depends_on: Vec<ResourceId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Replaces the remote attributes after an update.
    pub fn set_attributes(&mut self, attributes: AttrMap) {
        self.attributes = attributes;
        self.updated_at = Utc::now();
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: RunOperation, manifest_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            manifest_hash: manifest_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: RunOperation,
        manifest_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            manifest_hash: manifest_hash.to_string(),
            resources,
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Reconcile => "reconcile",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_remove_record() {
        let mut state = EngineState::new("edge-lab", "dev");
        let id = ResourceId::new("gateway", "edge");
        state.set_record(ResourceRecord::new(id.clone(), AttrMap::new(), "abc"));

        assert!(state.get_record(&id).is_some());
        assert_eq!(state.record_count(), 1);

        let removed = state.remove_record(&id);
        assert!(removed.is_some());
        assert!(state.get_record(&id).is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = EngineState::new("edge-lab", "dev");
        for i in 0..150 {
            state.add_history(RunHistoryEntry::new(
                RunOperation::Apply,
                &format!("hash-{i}"),
                vec![],
            ));
        }
        assert_eq!(state.history.len(), 100);
        assert_eq!(state.history.last().unwrap().manifest_hash, "hash-149");
    }
}
