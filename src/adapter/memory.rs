//! In-memory resource adapter.
//!
//! Backs resources with a process-local map. Useful for trying out a
//! topology without a control plane and as the backend for tests. State
//! does not survive the process, so a fresh run against a memory adapter
//! sees every previously applied resource as drifted.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::config::{AttrMap, ResourceId};
use crate::error::{AdapterError, Result};

use super::ResourceAdapter;

/// Adapter that stores resources in memory.
#[derive(Debug, Default)]
pub struct MemoryAdapter {
    /// Stored resources by identity.
    resources: RwLock<HashMap<ResourceId, AttrMap>>,
}

impl MemoryAdapter {
    /// Creates an empty memory adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored resources.
    pub async fn resource_count(&self) -> usize {
        self.resources.read().await.len()
    }
}

#[async_trait]
impl ResourceAdapter for MemoryAdapter {
    async fn create(&self, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
        let mut resources = self.resources.write().await;

        if resources.contains_key(id) {
            return Err(
                AdapterError::request(409, format!("resource already exists: {id}")).into(),
            );
        }

        let mut stored = attributes.clone();
        stored
            .entry(String::from("id"))
            .or_insert_with(|| Value::String(format!("mem-{}", &Uuid::new_v4().to_string()[..8])));

        resources.insert(id.clone(), stored.clone());
        debug!("Created in-memory resource: {id}");

        Ok(stored)
    }

    async fn read(&self, id: &ResourceId) -> Result<Option<AttrMap>> {
        Ok(self.resources.read().await.get(id).cloned())
    }

    async fn update(&self, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
        let mut resources = self.resources.write().await;

        let assigned_id = match resources.get(id) {
            Some(existing) => existing.get("id").cloned(),
            None => {
                return Err(AdapterError::NotFound {
                    identity: id.to_string(),
                }
                .into());
            }
        };

        // Backend-assigned identifiers survive updates
        let mut stored = attributes.clone();
        if let Some(value) = assigned_id {
            stored.entry(String::from("id")).or_insert(value);
        }

        resources.insert(id.clone(), stored.clone());
        debug!("Updated in-memory resource: {id}");

        Ok(stored)
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let mut resources = self.resources.write().await;

        if resources.remove(id).is_none() {
            return Err(AdapterError::NotFound {
                identity: id.to_string(),
            }
            .into());
        }

        debug!("Deleted in-memory resource: {id}");
        Ok(())
    }

    fn adapter_type(&self) -> &'static str {
        "memory"
    }
}
