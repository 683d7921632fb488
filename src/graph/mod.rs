//! Dependency graph module for the trellis reconciliation engine.
//!
//! This module turns declared resources into a dependency DAG:
//! - Parsing `${type.name.attribute}` reference markers
//! - Building and validating the graph (cycles, unresolved references)
//! - Topological orders for apply and destroy

mod reference;
mod builder;

pub use reference::{RefParseError, Reference, ResolveError, lookup_path, resolve_value};
pub use builder::DependencyGraph;
