//! State management module for the trellis reconciliation engine.
//!
//! This module provides persistent storage for the remembered view of a
//! topology: one record per managed resource, plus run history and an
//! advisory lock guarding concurrent runs.

mod lock;
mod local;
mod s3;
mod store;
mod types;

pub use lock::{LockInfo, generate_holder_id};
pub use local::LocalStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{EngineState, ResourceRecord, RunHistoryEntry, RunOperation, STATE_VERSION};
