// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Trellis
//!
//! A declarative, graph-ordered reconciliation engine for resource topologies.
//!
//! ## Overview
//!
//! Trellis takes a set of declared resources - attribute maps that may
//! reference each other's outputs - and converges a backend to match them:
//!
//! - Declare your topology as typed, named resources in a YAML manifest
//! - References like `${gateway.edge.id}` imply a dependency graph
//! - A plan orders creates, updates, and deletes along that graph
//! - Pluggable per-type adapters carry the operations out, concurrently
//!   where the graph allows it
//! - Remembered state makes repeated runs idempotent and drift visible
//!
//! ## Architecture
//!
//! The pipeline runs in four stages:
//!
//! 1. **Graph**: parse references out of declared attributes and build a DAG
//! 2. **Plan**: diff declarations against remembered state into ordered ops
//! 3. **Execute**: dispatch ops through adapters as dependencies complete
//! 4. **Remember**: write each applied record through to the state store
//!
//! ## Modules
//!
//! - [`config`]: Manifest parsing, validation, and declaration hashing
//! - [`graph`]: Reference parsing and dependency graph construction
//! - [`state`]: State storage backends (local, S3) with locking
//! - [`adapter`]: Resource adapters (in-memory, HTTP) and their registry
//! - [`planner`]: Diff computation, plan ordering, and concurrent execution
//! - [`engine`]: Plan/apply convergence loop, drift checks, destroy
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: edge-lab
//!   environment: dev
//!
//! resources:
//!   - type: gateway
//!     name: edge
//!     attributes:
//!       cidr: 10.0.0.0/16
//!
//!   - type: segment
//!     name: app
//!     attributes:
//!       gateway: ${gateway.edge.id}
//!       vlan: 100
//!
//!   - type: vm
//!     name: web-0
//!     attributes:
//!       segment: ${segment.app.id}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod adapter;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod planner;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use adapter::{AdapterRegistry, HttpAdapter, MemoryAdapter, ResourceAdapter};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{DeclHasher, Manifest, ManifestParser, ManifestValidator, ResourceDecl, ResourceId};
pub use engine::{DriftReport, Engine, RunOutcome};
pub use error::{Result, TrellisError};
pub use graph::DependencyGraph;
pub use planner::{CancelToken, DiffEngine, Plan, PlanExecutor, RunReport};
pub use state::{EngineState, LocalStateStore, S3StateStore, StateStore};
