//! Plan executor with bounded concurrency.
//!
//! Operations are dispatched as soon as every operation they depend on has
//! completed, up to a configurable number of in-flight adapter calls. The
//! scheduler itself runs single-threaded: tasks only talk to adapters and
//! report back, while all state writes happen here between completions.
//! A record is therefore durable in the state store before any dependent
//! operation is dispatched.
//!
//! Failure is isolated: a failed operation marks its transitive dependents
//! blocked and the rest of the plan keeps going. Cancellation stops new
//! dispatches, lets in-flight calls finish, and reports the remainder as
//! cancelled.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterRegistry, ResourceAdapter};
use crate::config::{AttrMap, ResourceId};
use crate::error::{AdapterError, ApplyError, Result, TrellisError};
use crate::graph::{Reference, lookup_path, resolve_value};
use crate::state::{EngineState, ResourceRecord, StateStore};

use super::plan::{OpKind, Plan, PlannedOp};

/// Live attribute maps, keyed by identity, used for reference resolution.
type OutputsMap = Arc<RwLock<HashMap<ResourceId, AttrMap>>>;

/// Executor for plans.
pub struct PlanExecutor {
    /// Adapter registry.
    registry: AdapterRegistry,
    /// Maximum concurrent adapter calls.
    concurrency: usize,
}

/// Cooperative cancellation signal shared with the caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    /// Set once; never cleared.
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Checks whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Final status of a resource after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// The operation completed and the record was persisted.
    Applied,
    /// The adapter call (or reference resolution) failed.
    Failed,
    /// A dependency failed, so the operation was never dispatched.
    Blocked,
    /// No operation was needed.
    Unchanged,
    /// The run was cancelled before the operation was dispatched.
    Cancelled,
}

/// Result of a single operation.
#[derive(Debug, Clone)]
pub struct OpReport {
    /// Index of the operation in the plan.
    pub index: usize,
    /// Operation type.
    pub kind: OpKind,
    /// Resource identity.
    pub id: ResourceId,
    /// Final status.
    pub status: OpStatus,
    /// Error or block reason (if not applied).
    pub error: Option<String>,
}

/// Result of executing an entire plan.
#[derive(Debug)]
pub struct RunReport {
    /// Individual operation results, in plan order.
    pub results: Vec<OpReport>,
    /// Resources that needed no operation.
    pub unchanged: Vec<ResourceId>,
    /// Number of applied operations.
    pub applied: usize,
    /// Number of failed operations.
    pub failed: usize,
    /// Number of blocked operations.
    pub blocked: usize,
    /// Number of cancelled operations.
    pub cancelled: usize,
    /// True when every operation applied.
    pub success: bool,
}

/// What a dispatched task produced.
enum TaskOutcome {
    /// Create or update succeeded with these observed attributes.
    Applied(AttrMap),
    /// Delete succeeded (or the resource was already gone).
    Deleted,
}

impl PlanExecutor {
    /// Creates a new executor.
    #[must_use]
    pub fn new(registry: AdapterRegistry, concurrency: usize) -> Self {
        Self {
            registry,
            concurrency: concurrency.max(1),
        }
    }

    /// Executes a plan against the adapters and the state store.
    ///
    /// The in-memory state is kept in step with the store: every successful
    /// operation is flushed through [`StateStore::put`] or
    /// [`StateStore::delete_record`] before its dependents run.
    ///
    /// # Errors
    ///
    /// Returns an error only when the state store fails or an executor task
    /// panics; adapter failures are reported per operation instead.
    pub async fn execute(
        &self,
        plan: &Plan,
        store: &dyn StateStore,
        state: &mut EngineState,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        let total = plan.ops.len();
        info!("Executing plan with {total} operations");

        if total == 0 {
            return Ok(RunReport::empty(plan.unchanged.clone()));
        }

        let mut statuses: Vec<Option<OpStatus>> = vec![None; total];
        let mut messages: Vec<Option<String>> = vec![None; total];
        let mut remaining: Vec<usize> = plan.ops.iter().map(|o| o.dependencies.len()).collect();

        // Reverse adjacency: who waits on whom
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); total];
        for (idx, op) in plan.ops.iter().enumerate() {
            for &dep in &op.dependencies {
                dependents[dep].push(idx);
            }
        }

        // Seed live outputs from the remembered records, so references to
        // already-converged resources resolve without any adapter call
        let outputs: OutputsMap = Arc::new(RwLock::new(
            state
                .records
                .values()
                .map(|r| (r.id.clone(), r.attributes.clone()))
                .collect(),
        ));

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut join_set: JoinSet<(usize, Result<TaskOutcome>)> = JoinSet::new();
        let mut ready: VecDeque<usize> = (0..total).filter(|&i| remaining[i] == 0).collect();

        loop {
            while !cancel.is_cancelled() {
                let Some(idx) = ready.pop_front() else {
                    break;
                };
                self.spawn_op(&mut join_set, idx, plan.ops[idx].clone(), &outputs, &semaphore);
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (idx, outcome) = joined
                .map_err(|e| TrellisError::internal(format!("Executor task failed: {e}")))?;
            let op = &plan.ops[idx];

            match outcome {
                Ok(TaskOutcome::Applied(applied)) => {
                    let record = Self::record_for(state, op, &applied);
                    store.put(&record).await?;
                    state.set_record(record);
                    outputs.write().await.insert(op.id.clone(), applied);

                    statuses[idx] = Some(OpStatus::Applied);
                    info!("Applied {} of {}", op.kind, op.id);
                    Self::enqueue_dependents(idx, &dependents, &mut remaining, &statuses, &mut ready);
                }
                Ok(TaskOutcome::Deleted) => {
                    store.delete_record(&op.id).await?;
                    state.remove_record(&op.id);
                    outputs.write().await.remove(&op.id);

                    statuses[idx] = Some(OpStatus::Applied);
                    info!("Applied delete of {}", op.id);
                    Self::enqueue_dependents(idx, &dependents, &mut remaining, &statuses, &mut ready);
                }
                Err(e) => {
                    warn!("Failed to {} {}: {e}", op.kind, op.id);
                    statuses[idx] = Some(OpStatus::Failed);
                    messages[idx] = Some(e.to_string());
                    Self::block_dependents(idx, plan, &dependents, &mut statuses, &mut messages);
                }
            }
        }

        // Anything still unmarked was never dispatched
        let was_cancelled = cancel.is_cancelled();
        for (idx, status) in statuses.iter_mut().enumerate() {
            if status.is_none() {
                *status = Some(if was_cancelled {
                    OpStatus::Cancelled
                } else {
                    OpStatus::Blocked
                });
                if messages[idx].is_none() {
                    messages[idx] = Some(if was_cancelled {
                        String::from("Run cancelled before dispatch")
                    } else {
                        String::from("Dependencies never completed")
                    });
                }
            }
        }

        Ok(Self::build_report(plan, &statuses, &mut messages))
    }

    /// Spawns one operation as a task.
    ///
    /// The semaphore permit is taken inside the task, so the scheduler can
    /// keep draining completions while dispatched work queues for a slot.
    fn spawn_op(
        &self,
        join_set: &mut JoinSet<(usize, Result<TaskOutcome>)>,
        idx: usize,
        op: PlannedOp,
        outputs: &OutputsMap,
        semaphore: &Arc<Semaphore>,
    ) {
        let adapter = self.registry.adapter_for(&op.id.kind);
        let outputs = Arc::clone(outputs);
        let semaphore = Arc::clone(semaphore);

        join_set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (idx, Err(TrellisError::internal("Executor semaphore closed")));
            };

            let adapter = match adapter {
                Ok(adapter) => adapter,
                Err(e) => return (idx, Err(e)),
            };

            debug!("Dispatching {} of {}", op.kind, op.id);
            let result = run_op(adapter, &op, &outputs).await;
            (idx, result)
        });
    }

    /// Builds the record to persist for an applied create or update.
    fn record_for(state: &EngineState, op: &PlannedOp, applied: &AttrMap) -> ResourceRecord {
        let hash = op.new_hash.clone().unwrap_or_default();

        match state.get_record(&op.id) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.set_attributes(applied.clone());
                updated.decl_hash = hash;
                updated.depends_on.clone_from(&op.depends_on);
                updated
            }
            None => ResourceRecord::new(op.id.clone(), applied.clone(), &hash)
                .with_depends_on(op.depends_on.clone()),
        }
    }

    /// Moves dependents of a completed op toward readiness.
    fn enqueue_dependents(
        idx: usize,
        dependents: &[Vec<usize>],
        remaining: &mut [usize],
        statuses: &[Option<OpStatus>],
        ready: &mut VecDeque<usize>,
    ) {
        for &d in &dependents[idx] {
            remaining[d] -= 1;
            if remaining[d] == 0 && statuses[d].is_none() {
                ready.push_back(d);
            }
        }
    }

    /// Marks every transitive dependent of a failed op as blocked.
    fn block_dependents(
        failed_idx: usize,
        plan: &Plan,
        dependents: &[Vec<usize>],
        statuses: &mut [Option<OpStatus>],
        messages: &mut [Option<String>],
    ) {
        let cause = &plan.ops[failed_idx].id;
        let mut queue: VecDeque<usize> = dependents[failed_idx].iter().copied().collect();

        while let Some(d) = queue.pop_front() {
            if statuses[d].is_some() {
                continue;
            }
            debug!("Blocking {} behind failed {cause}", plan.ops[d].id);
            statuses[d] = Some(OpStatus::Blocked);
            messages[d] = Some(format!("Blocked by failure of {cause}"));
            queue.extend(dependents[d].iter().copied());
        }
    }

    /// Assembles the final report.
    fn build_report(
        plan: &Plan,
        statuses: &[Option<OpStatus>],
        messages: &mut [Option<String>],
    ) -> RunReport {
        let mut results = Vec::with_capacity(plan.ops.len());
        let (mut applied, mut failed, mut blocked, mut cancelled) = (0, 0, 0, 0);

        for (idx, op) in plan.ops.iter().enumerate() {
            let status = statuses[idx].map_or(OpStatus::Blocked, |s| s);
            match status {
                OpStatus::Applied => applied += 1,
                OpStatus::Failed => failed += 1,
                OpStatus::Blocked => blocked += 1,
                OpStatus::Cancelled => cancelled += 1,
                OpStatus::Unchanged => {}
            }

            results.push(OpReport {
                index: idx,
                kind: op.kind,
                id: op.id.clone(),
                status,
                error: messages[idx].take(),
            });
        }

        RunReport {
            results,
            unchanged: plan.unchanged.clone(),
            applied,
            failed,
            blocked,
            cancelled,
            success: failed == 0 && blocked == 0 && cancelled == 0,
        }
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("registry", &self.registry)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Performs one adapter operation.
async fn run_op(
    adapter: Arc<dyn ResourceAdapter>,
    op: &PlannedOp,
    outputs: &RwLock<HashMap<ResourceId, AttrMap>>,
) -> Result<TaskOutcome> {
    if op.kind == OpKind::Delete {
        return match adapter.delete(&op.id).await {
            Ok(()) => Ok(TaskOutcome::Deleted),
            Err(TrellisError::Adapter(AdapterError::NotFound { .. })) => {
                debug!("Resource {} already gone, delete counts as applied", op.id);
                Ok(TaskOutcome::Deleted)
            }
            Err(e) => Err(e),
        };
    }

    let resolved = {
        let snapshot = outputs.read().await;
        resolve_attributes(&op.id, &op.attributes, &snapshot)?
    };

    let applied = if op.kind == OpKind::Create {
        adapter.create(&op.id, &resolved).await?
    } else {
        adapter.update(&op.id, &resolved).await?
    };

    Ok(TaskOutcome::Applied(applied))
}

/// Resolves every `${…}` reference in an attribute map against live outputs.
fn resolve_attributes(
    id: &ResourceId,
    attributes: &AttrMap,
    outputs: &HashMap<ResourceId, AttrMap>,
) -> Result<AttrMap> {
    let lookup = |reference: &Reference| {
        outputs
            .get(&reference.target)
            .and_then(|attrs| lookup_path(attrs, &reference.path))
            .cloned()
    };

    let mut resolved = AttrMap::new();
    for (key, value) in attributes {
        let value = resolve_value(value, &lookup).map_err(|e| {
            TrellisError::Apply(ApplyError::UnresolvedOutput {
                identity: id.to_string(),
                reference: e.reference,
            })
        })?;
        resolved.insert(key.clone(), value);
    }

    Ok(resolved)
}

impl RunReport {
    /// Creates a report for a plan with no operations.
    #[must_use]
    pub const fn empty(unchanged: Vec<ResourceId>) -> Self {
        Self {
            results: Vec::new(),
            unchanged,
            applied: 0,
            failed: 0,
            blocked: 0,
            cancelled: 0,
            success: true,
        }
    }

    /// Returns the number of operations that did not apply.
    #[must_use]
    pub const fn pending(&self) -> usize {
        self.failed + self.blocked + self.cancelled
    }

    /// Whether cancellation kept any operation from dispatching.
    #[must_use]
    pub const fn was_cancelled(&self) -> bool {
        self.cancelled > 0
    }

    /// Looks up the final status of a resource.
    #[must_use]
    pub fn status_of(&self, id: &ResourceId) -> Option<OpStatus> {
        self.results
            .iter()
            .find(|r| r.id == *id)
            .map(|r| r.status)
            .or_else(|| self.unchanged.contains(id).then_some(OpStatus::Unchanged))
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Unchanged => "unchanged",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} applied, {} failed, {} blocked, {} cancelled, {} unchanged",
            self.applied,
            self.failed,
            self.blocked,
            self.cancelled,
            self.unchanged.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Manifest, ProjectConfig, ProviderConfig, ResourceDecl, RunConfig, StateConfig};
    use crate::error::StateError;
    use crate::graph::DependencyGraph;
    use crate::planner::DiffEngine;
    use crate::state::LocalStateStore;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Test adapter that logs calls and can fail or miss specific resources.
    #[derive(Default)]
    struct ScriptedAdapter {
        log: StdMutex<Vec<String>>,
        seen_attrs: StdMutex<HashMap<String, AttrMap>>,
        fail: HashSet<String>,
        missing: HashSet<String>,
    }

    impl ScriptedAdapter {
        fn failing(identities: &[&str]) -> Self {
            Self {
                fail: identities.iter().map(|s| (*s).to_string()).collect(),
                ..Self::default()
            }
        }

        fn log_snapshot(&self) -> Vec<String> {
            self.log.lock().expect("log poisoned").clone()
        }

        fn attrs_seen(&self, identity: &str) -> Option<AttrMap> {
            self.seen_attrs
                .lock()
                .expect("seen_attrs poisoned")
                .get(identity)
                .cloned()
        }

        fn apply(&self, verb: &str, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
            let identity = id.to_string();
            self.log
                .lock()
                .expect("log poisoned")
                .push(format!("{verb} {identity}"));

            if self.fail.contains(&identity) {
                return Err(AdapterError::request(500, "injected failure").into());
            }

            self.seen_attrs
                .lock()
                .expect("seen_attrs poisoned")
                .insert(identity, attributes.clone());

            let mut outputs = attributes.clone();
            outputs.insert(
                String::from("id"),
                Value::String(format!("{}-id", id.name)),
            );
            Ok(outputs)
        }
    }

    #[async_trait]
    impl ResourceAdapter for ScriptedAdapter {
        async fn create(&self, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
            self.apply("create", id, attributes)
        }

        async fn read(&self, _id: &ResourceId) -> Result<Option<AttrMap>> {
            Ok(None)
        }

        async fn update(&self, id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
            self.apply("update", id, attributes)
        }

        async fn delete(&self, id: &ResourceId) -> Result<()> {
            let identity = id.to_string();
            self.log
                .lock()
                .expect("log poisoned")
                .push(format!("delete {identity}"));

            if self.fail.contains(&identity) {
                return Err(AdapterError::request(500, "injected failure").into());
            }
            if self.missing.contains(&identity) {
                return Err(AdapterError::NotFound { identity }.into());
            }
            Ok(())
        }

        fn adapter_type(&self) -> &'static str {
            "scripted"
        }
    }

    fn decl(kind: &str, name: &str, attrs: &[(&str, Value)]) -> ResourceDecl {
        ResourceDecl {
            kind: kind.to_string(),
            name: name.to_string(),
            attributes: attrs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            depends_on: vec![],
        }
    }

    fn manifest(resources: Vec<ResourceDecl>) -> Manifest {
        Manifest {
            project: ProjectConfig {
                name: String::from("demo"),
                environment: String::from("dev"),
            },
            state: StateConfig::default(),
            provider: ProviderConfig::default(),
            run: RunConfig::default(),
            resources,
        }
    }

    fn three_tier() -> Manifest {
        manifest(vec![
            decl("gateway", "edge", &[("cidr", json!("10.0.0.0/16"))]),
            decl(
                "segment",
                "app",
                &[("gateway", json!("${gateway.edge.id}")), ("vlan", json!(100))],
            ),
            decl("vm", "web-0", &[("segment", json!("${segment.app.id}"))]),
        ])
    }

    fn plan_for(manifest: &Manifest, state: Option<&EngineState>) -> Plan {
        let graph = DependencyGraph::build(&manifest.resources).expect("graph build failed");
        let diff = DiffEngine::new().compute_diff(manifest, state);
        Plan::from_diff(&diff, manifest, &graph, state, "hash")
    }

    async fn seeded_store() -> (LocalStateStore, TempDir, EngineState) {
        let temp = TempDir::new().expect("temp dir failed");
        let store = LocalStateStore::with_base_dir(temp.path());
        let state = EngineState::new("demo", "dev");
        store.save(&state).await.expect("seed save failed");
        (store, temp, state)
    }

    fn executor_with(adapter: Arc<ScriptedAdapter>, concurrency: usize) -> PlanExecutor {
        PlanExecutor::new(AdapterRegistry::with_fallback(adapter), concurrency)
    }

    #[tokio::test]
    async fn test_three_tier_applies_in_dependency_order() {
        let manifest = three_tier();
        let plan = plan_for(&manifest, None);
        let (store, _temp, mut state) = seeded_store().await;

        let adapter = Arc::new(ScriptedAdapter::default());
        let executor = executor_with(Arc::clone(&adapter), 4);

        let report = executor
            .execute(&plan, &store, &mut state, &CancelToken::new())
            .await
            .expect("execute failed");

        assert!(report.success);
        assert_eq!(report.applied, 3);
        assert_eq!(
            adapter.log_snapshot(),
            vec![
                "create gateway.edge",
                "create segment.app",
                "create vm.web-0"
            ]
        );

        // References were resolved against the freshly created outputs
        let segment_attrs = adapter.attrs_seen("segment.app").expect("segment not applied");
        assert_eq!(
            segment_attrs.get("gateway"),
            Some(&Value::String(String::from("edge-id")))
        );
        let vm_attrs = adapter.attrs_seen("vm.web-0").expect("vm not applied");
        assert_eq!(
            vm_attrs.get("segment"),
            Some(&Value::String(String::from("app-id")))
        );

        // Records were written through to the store with remembered edges
        let persisted = store
            .load()
            .await
            .expect("load failed")
            .expect("state missing");
        assert_eq!(persisted.record_count(), 3);
        let segment_record = persisted
            .get_record(&ResourceId::new("segment", "app"))
            .expect("segment record missing");
        assert_eq!(
            segment_record.depends_on,
            vec![ResourceId::new("gateway", "edge")]
        );
    }

    #[tokio::test]
    async fn test_failure_blocks_transitive_dependents_only() {
        let mut manifest = three_tier();
        manifest
            .resources
            .push(decl("security-group", "default", &[("policy", json!("deny"))]));
        let plan = plan_for(&manifest, None);
        let (store, _temp, mut state) = seeded_store().await;

        let adapter = Arc::new(ScriptedAdapter::failing(&["gateway.edge"]));
        let executor = executor_with(Arc::clone(&adapter), 4);

        let report = executor
            .execute(&plan, &store, &mut state, &CancelToken::new())
            .await
            .expect("execute failed");

        assert!(!report.success);
        assert_eq!(report.failed, 1);
        assert_eq!(report.blocked, 2);
        assert_eq!(report.applied, 1);
        assert_eq!(report.pending(), 3);

        assert_eq!(
            report.status_of(&ResourceId::new("gateway", "edge")),
            Some(OpStatus::Failed)
        );
        assert_eq!(
            report.status_of(&ResourceId::new("segment", "app")),
            Some(OpStatus::Blocked)
        );
        assert_eq!(
            report.status_of(&ResourceId::new("vm", "web-0")),
            Some(OpStatus::Blocked)
        );
        assert_eq!(
            report.status_of(&ResourceId::new("security-group", "default")),
            Some(OpStatus::Applied)
        );

        // Blocked resources never reached the adapter
        let log = adapter.log_snapshot();
        assert_eq!(log.len(), 2);
        assert!(log.contains(&String::from("create gateway.edge")));
        assert!(log.contains(&String::from("create security-group.default")));

        // Only the independent sibling made it into the store
        let persisted = store
            .load()
            .await
            .expect("load failed")
            .expect("state missing");
        assert_eq!(persisted.record_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_of_missing_resource_counts_as_applied() {
        let (store, _temp, mut state) = seeded_store().await;
        state.set_record(ResourceRecord::new(
            ResourceId::new("vm", "web-0"),
            AttrMap::new(),
            "h1",
        ));
        store.save(&state).await.expect("save failed");

        let plan = Plan::destroy_from_state(&state, "hash");

        let adapter = Arc::new(ScriptedAdapter {
            missing: HashSet::from([String::from("vm.web-0")]),
            ..ScriptedAdapter::default()
        });
        let executor = executor_with(Arc::clone(&adapter), 2);

        let report = executor
            .execute(&plan, &store, &mut state, &CancelToken::new())
            .await
            .expect("execute failed");

        assert!(report.success);
        assert_eq!(report.applied, 1);
        assert_eq!(state.record_count(), 0);

        let persisted = store
            .load()
            .await
            .expect("load failed")
            .expect("state missing");
        assert_eq!(persisted.record_count(), 0);
    }

    #[tokio::test]
    async fn test_precancelled_run_dispatches_nothing() {
        let manifest = three_tier();
        let plan = plan_for(&manifest, None);
        let (store, _temp, mut state) = seeded_store().await;

        let adapter = Arc::new(ScriptedAdapter::default());
        let executor = executor_with(Arc::clone(&adapter), 4);

        let cancel = CancelToken::new();
        cancel.cancel();

        let report = executor
            .execute(&plan, &store, &mut state, &cancel)
            .await
            .expect("execute failed");

        assert!(!report.success);
        assert!(report.was_cancelled());
        assert_eq!(report.cancelled, 3);
        assert!(adapter.log_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_reports_unchanged() {
        let (store, _temp, mut state) = seeded_store().await;
        let mut plan = Plan::empty("hash");
        plan.unchanged = vec![ResourceId::new("gateway", "edge")];

        let adapter = Arc::new(ScriptedAdapter::default());
        let executor = executor_with(Arc::clone(&adapter), 2);

        let report = executor
            .execute(&plan, &store, &mut state, &CancelToken::new())
            .await
            .expect("execute failed");

        assert!(report.success);
        assert_eq!(
            report.status_of(&ResourceId::new("gateway", "edge")),
            Some(OpStatus::Unchanged)
        );
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        struct ProbeAdapter {
            in_flight: AtomicUsize,
            max_seen: AtomicUsize,
        }

        #[async_trait]
        impl ResourceAdapter for ProbeAdapter {
            async fn create(&self, _id: &ResourceId, attributes: &AttrMap) -> Result<AttrMap> {
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
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
                "probe"
            }
        }

        let manifest = manifest(vec![
            decl("vm", "a", &[]),
            decl("vm", "b", &[]),
            decl("vm", "c", &[]),
            decl("vm", "d", &[]),
        ]);
        let plan = plan_for(&manifest, None);
        let (store, _temp, mut state) = seeded_store().await;

        let adapter = Arc::new(ProbeAdapter {
            in_flight: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        });
        let executor = PlanExecutor::new(
            AdapterRegistry::with_fallback(Arc::clone(&adapter) as Arc<dyn ResourceAdapter>),
            2,
        );

        let report = executor
            .execute(&plan, &store, &mut state, &CancelToken::new())
            .await
            .expect("execute failed");

        assert!(report.success);
        assert!(adapter.max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_state_store_failure_aborts_run() {
        struct BrokenStore;

        #[async_trait]
        impl StateStore for BrokenStore {
            async fn load(&self) -> Result<Option<EngineState>> {
                Ok(None)
            }
            async fn save(&self, _state: &EngineState) -> Result<()> {
                Ok(())
            }
            async fn delete(&self) -> Result<()> {
                Ok(())
            }
            async fn exists(&self) -> Result<bool> {
                Ok(false)
            }
            async fn get(&self, _id: &ResourceId) -> Result<Option<ResourceRecord>> {
                Ok(None)
            }
            async fn put(&self, _record: &ResourceRecord) -> Result<()> {
                Err(StateError::s3("injected store failure").into())
            }
            async fn delete_record(&self, _id: &ResourceId) -> Result<()> {
                Err(StateError::s3("injected store failure").into())
            }
            async fn acquire_lock(&self, _holder: &str) -> Result<crate::state::LockInfo> {
                Err(StateError::LockFailed {
                    message: String::from("unsupported"),
                }
                .into())
            }
            async fn release_lock(&self, _lock_id: &str) -> Result<()> {
                Ok(())
            }
            async fn get_lock_info(&self) -> Result<Option<crate::state::LockInfo>> {
                Ok(None)
            }
            async fn is_locked(&self) -> Result<bool> {
                Ok(false)
            }
            fn backend_type(&self) -> &'static str {
                "broken"
            }
        }

        let manifest = manifest(vec![decl("gateway", "edge", &[])]);
        let plan = plan_for(&manifest, None);
        let mut state = EngineState::new("demo", "dev");

        let adapter = Arc::new(ScriptedAdapter::default());
        let executor = executor_with(adapter, 2);

        let result = executor
            .execute(&plan, &BrokenStore, &mut state, &CancelToken::new())
            .await;

        assert!(matches!(result, Err(TrellisError::State(_))));
    }
}
