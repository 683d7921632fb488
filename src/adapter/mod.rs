//! Resource adapters for the trellis reconciliation engine.
//!
//! An adapter translates engine operations into calls against whatever
//! actually owns the resources: an HTTP control plane, an in-process map,
//! or anything else that can create, read, update, and delete a resource
//! by identity. The executor never talks to a backend directly; it always
//! goes through a [`ResourceAdapter`] looked up from the
//! [`AdapterRegistry`] by resource type.

mod http;
mod memory;

pub use http::HttpAdapter;
pub use memory::MemoryAdapter;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AttrMap, ResourceId};
use crate::error::{AdapterError, Result};

/// Trait for resource backends.
///
/// Implementations perform the actual side effects of a plan. Attribute
/// maps cross this boundary fully resolved: no `${…}` reference markers
/// remain by the time an adapter sees them.
#[async_trait]
pub trait ResourceAdapter: Send + Sync {
    /// Creates a resource and returns its observed attributes.
    ///
    /// The returned map may contain backend-assigned attributes (an `id`,
    /// an address allocation) in addition to the declared ones.
    async fn create(&self, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap>;

    /// Reads a resource's current attributes, or `None` if it does not exist.
    async fn read(&self, id: &ResourceId) -> Result<Option<AttrMap>>;

    /// Updates a resource in place and returns its new attributes.
    async fn update(&self, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap>;

    /// Deletes a resource.
    ///
    /// Returns [`AdapterError::NotFound`] if the backend no longer knows
    /// the resource; callers decide whether that counts as success.
    async fn delete(&self, id: &ResourceId) -> Result<()>;

    /// Returns the adapter type identifier.
    fn adapter_type(&self) -> &'static str;
}

#[async_trait]
impl ResourceAdapter for Box<dyn ResourceAdapter> {
    async fn create(&self, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
        (**self).create(id, attributes).await
    }

    async fn read(&self, id: &ResourceId) -> Result<Option<AttrMap>> {
        (**self).read(id).await
    }

    async fn update(&self, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
        (**self).update(id, attributes).await
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        (**self).delete(id).await
    }

    fn adapter_type(&self) -> &'static str {
        (**self).adapter_type()
    }
}

/// Registry mapping resource types to adapters.
///
/// A topology can mix backends: security groups against one control plane,
/// VMs against another. Types without an explicit registration fall back
/// to the default adapter when one is set.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    /// Adapters registered for specific resource types.
    adapters: HashMap<String, Arc<dyn ResourceAdapter>>,
    /// Fallback adapter for unregistered types.
    fallback: Option<Arc<dyn ResourceAdapter>>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry where every type routes to one adapter.
    #[must_use]
    pub fn with_fallback(adapter: Arc<dyn ResourceAdapter>) -> Self {
        Self {
            adapters: HashMap::new(),
            fallback: Some(adapter),
        }
    }

    /// Registers an adapter for a specific resource type.
    pub fn register(&mut self, kind: impl Into<String>, adapter: Arc<dyn ResourceAdapter>) {
        self.adapters.insert(kind.into(), adapter);
    }

    /// Sets the fallback adapter for unregistered types.
    pub fn set_fallback(&mut self, adapter: Arc<dyn ResourceAdapter>) {
        self.fallback = Some(adapter);
    }

    /// Looks up the adapter for a resource type.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::UnsupportedKind`] if neither a type-specific
    /// adapter nor a fallback is registered.
    pub fn adapter_for(&self, kind: &str) -> Result<Arc<dyn ResourceAdapter>> {
        self.adapters
            .get(kind)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| {
                AdapterError::UnsupportedKind {
                    kind: kind.to_string(),
                }
                .into()
            })
    }

    /// Checks whether a resource type can be handled.
    #[must_use]
    pub fn supports(&self, kind: &str) -> bool {
        self.fallback.is_some() || self.adapters.contains_key(kind)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("AdapterRegistry")
            .field("kinds", &kinds)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrellisError;

    struct EchoAdapter;

    #[async_trait]
    impl ResourceAdapter for EchoAdapter {
        async fn create(&self, _id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
            Ok(attributes.clone())
        }

        async fn read(&self, _id: &ResourceId) -> Result<Option<AttrMap>> {
            Ok(None)
        }

        async fn update(&self, _id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
            Ok(attributes.clone())
        }

        async fn delete(&self, _id: &ResourceId) -> Result<()> {
            Ok(())
        }

        fn adapter_type(&self) -> &'static str {
            "echo"
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = AdapterRegistry::new();
        registry.register("gateway", Arc::new(EchoAdapter));

        assert!(registry.supports("gateway"));
        assert!(!registry.supports("vm"));

        let adapter = registry.adapter_for("gateway").expect("adapter missing");
        assert_eq!(adapter.adapter_type(), "echo");
    }

    #[test]
    fn test_registry_fallback() {
        let registry = AdapterRegistry::with_fallback(Arc::new(EchoAdapter));

        assert!(registry.supports("anything"));
        let adapter = registry.adapter_for("anything").expect("fallback missing");
        assert_eq!(adapter.adapter_type(), "echo");
    }

    #[test]
    fn test_registry_unsupported_kind() {
        let registry = AdapterRegistry::new();

        let err = registry.adapter_for("vm").err().expect("should fail");
        match err {
            TrellisError::Adapter(AdapterError::UnsupportedKind { kind }) => {
                assert_eq!(kind, "vm");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_specific_beats_fallback() {
        let mut registry = AdapterRegistry::with_fallback(Arc::new(EchoAdapter));

        struct NamedAdapter;

        #[async_trait]
        impl ResourceAdapter for NamedAdapter {
            async fn create(&self, _id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
                Ok(attributes.clone())
            }

            async fn read(&self, _id: &ResourceId) -> Result<Option<AttrMap>> {
                Ok(None)
            }

            async fn update(&self, _id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
                Ok(attributes.clone())
            }

            async fn delete(&self, _id: &ResourceId) -> Result<()> {
                Ok(())
            }

            fn adapter_type(&self) -> &'static str {
                "named"
            }
        }

        registry.register("vm", Arc::new(NamedAdapter));

        assert_eq!(
            registry.adapter_for("vm").expect("vm adapter").adapter_type(),
            "named"
        );
        assert_eq!(
            registry
                .adapter_for("gateway")
                .expect("fallback")
                .adapter_type(),
            "echo"
        );
    }
}
