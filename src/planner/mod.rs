//! Planning and execution: diffing declarations against remembered state,
//! ordering the resulting operations, and running them through adapters.

mod diff;
mod executor;
mod plan;

pub use diff::{DiffDetail, DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{CancelToken, OpReport, OpStatus, PlanExecutor, RunReport};
pub use plan::{OpKind, Plan, PlannedOp};
