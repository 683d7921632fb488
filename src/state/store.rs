//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Besides whole-state load/save, backends expose per-record operations
//! keyed by resource identity; those are the write-through path the
//! executor uses after every successful operation.

use async_trait::async_trait;

use super::lock::LockInfo;
use super::types::{EngineState, ResourceRecord};
use crate::config::ResourceId;
use crate::error::Result;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the engine state.
    ///
    /// Returns `None` if no state exists yet.
    async fn load(&self) -> Result<Option<EngineState>>;

    /// Saves the engine state.
    async fn save(&self, state: &EngineState) -> Result<()>;

    /// Deletes the engine state.
    async fn delete(&self) -> Result<()>;

    /// Checks if state exists.
    async fn exists(&self) -> Result<bool>;

    /// Gets a single record by identity.
    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceRecord>>;

    /// Writes a single record through to durable storage.
    async fn put(&self, record: &ResourceRecord) -> Result<()>;

    /// Removes a single record from durable storage.
    async fn delete_record(&self, id: &ResourceId) -> Result<()>;

    /// Acquires a lock on the state.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases a lock on the state.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn load(&self) -> Result<Option<EngineState>> {
        (**self).load().await
    }

    async fn save(&self, state: &EngineState) -> Result<()> {
        (**self).save(state).await
    }

    async fn delete(&self) -> Result<()> {
        (**self).delete().await
    }

    async fn exists(&self) -> Result<bool> {
        (**self).exists().await
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<ResourceRecord>> {
        (**self).get(id).await
    }

    async fn put(&self, record: &ResourceRecord) -> Result<()> {
        (**self).put(record).await
    }

    async fn delete_record(&self, id: &ResourceId) -> Result<()> {
        (**self).delete_record(id).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
